// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared page frames.
//!
//! A frame is stored as 32-bit atomic words so that two domains can touch it
//! concurrently without `unsafe`. Byte accessors use little-endian order inside
//! each word, which fixes the on-page byte layout independently of the host.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Size of one shareable frame in bytes.
pub const PAGE_SIZE: usize = 4096;

const WORD: usize = 4;
const WORDS: usize = PAGE_SIZE / WORD;

/// Access outside the frame or at an unaligned offset.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("page access out of range: offset {offset}, len {len}")]
pub struct PageRangeError {
    /// Requested byte offset.
    pub offset: usize,
    /// Requested length in bytes.
    pub len: usize,
}

/// Handle to a single shared frame. Clones refer to the same memory.
#[derive(Clone)]
pub struct Page {
    frame: Arc<[AtomicU32]>,
}

impl Page {
    /// Allocates a zero-filled frame.
    pub fn zeroed() -> Self {
        let words: Vec<AtomicU32> = (0..WORDS).map(|_| AtomicU32::new(0)).collect();
        Self { frame: words.into() }
    }

    /// Returns `true` when both handles name the same frame.
    pub fn same_frame(&self, other: &Page) -> bool {
        Arc::ptr_eq(&self.frame, &other.frame)
    }

    fn word_index(offset: usize, len: usize) -> Result<usize, PageRangeError> {
        let err = PageRangeError { offset, len };
        if offset % WORD != 0 {
            return Err(err);
        }
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(offset / WORD),
            _ => Err(err),
        }
    }

    /// Loads the 32-bit word at `offset`.
    pub fn load_u32(&self, offset: usize, order: Ordering) -> Result<u32, PageRangeError> {
        let idx = Self::word_index(offset, WORD)?;
        Ok(self.frame[idx].load(order))
    }

    /// Stores the 32-bit word at `offset`.
    pub fn store_u32(&self, offset: usize, value: u32, order: Ordering) -> Result<(), PageRangeError> {
        let idx = Self::word_index(offset, WORD)?;
        self.frame[idx].store(value, order);
        Ok(())
    }

    /// Copies `out.len()` bytes starting at `offset` out of the frame.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<(), PageRangeError> {
        let first = Self::word_index(offset, out.len())?;
        for (i, chunk) in out.chunks_mut(WORD).enumerate() {
            let word = self.frame[first + i].load(Ordering::Relaxed).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(())
    }

    /// Copies `data` into the frame starting at `offset`.
    ///
    /// A trailing partial word is merged with the bytes already present.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), PageRangeError> {
        let first = Self::word_index(offset, data.len())?;
        for (i, chunk) in data.chunks(WORD).enumerate() {
            let slot = &self.frame[first + i];
            let mut word = slot.load(Ordering::Relaxed).to_le_bytes();
            word[..chunk.len()].copy_from_slice(chunk);
            slot.store(u32::from_le_bytes(word), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Zeroes `len` bytes starting at `offset`.
    pub fn clear(&self, offset: usize, len: usize) -> Result<(), PageRangeError> {
        let first = Self::word_index(offset, len)?;
        let words = len.div_ceil(WORD);
        for slot in &self.frame[first..first + words] {
            slot.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copies the whole frame into a byte vector.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![0u8; PAGE_SIZE];
        for (chunk, word) in out.chunks_mut(WORD).zip(self.frame.iter()) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        out
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page").field("frame", &Arc::as_ptr(&self.frame)).finish()
    }
}
