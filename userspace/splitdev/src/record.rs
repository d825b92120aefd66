// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

use nexus_ring::Slot;

use crate::error::{Error, Result};

/// Size of one message record on the ring.
pub const MESSAGE_SIZE: usize = 32;

/// Fixed-size response record carried by the device ring.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Message([u8; MESSAGE_SIZE]);

impl Message {
    /// Wraps raw record bytes.
    pub const fn new(bytes: [u8; MESSAGE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Record holding `text`, zero padded.
    pub fn from_text(text: &str) -> Result<Self> {
        let bytes = text.as_bytes();
        if bytes.len() > MESSAGE_SIZE {
            return Err(Error::MessageTooLong(bytes.len()));
        }
        let mut record = [0u8; MESSAGE_SIZE];
        record[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(record))
    }

    /// Raw record bytes.
    pub fn as_bytes(&self) -> &[u8; MESSAGE_SIZE] {
        &self.0
    }

    /// Text up to the first NUL, lossily decoded.
    pub fn text(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(MESSAGE_SIZE);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Message").field(&self.text()).finish()
    }
}

impl Slot for Message {
    const SIZE: usize = MESSAGE_SIZE;

    fn encode(&self, out: &mut [u8]) {
        out[..MESSAGE_SIZE].copy_from_slice(&self.0);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut record = [0u8; MESSAGE_SIZE];
        record.copy_from_slice(&bytes[..MESSAGE_SIZE]);
        Self(record)
    }
}
