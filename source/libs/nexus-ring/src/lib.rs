// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-capacity SPSC ring living in one shared page
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (FIFO order, capacity boundary, cursor wrap, layout)
//!
//! PUBLIC API:
//!   - format / format_with_capacity: stamp an empty ring onto a page (allocating side)
//!   - init_as_producer / init_as_consumer: attach one end to a formatted page
//!   - RingProducer::produce, RingConsumer::consume / has_unconsumed
//!
//! PAGE LAYOUT (byte offsets, little-endian u32 words):
//!   0   prod        producer cursor, written only by the producer
//!   4   cons        consumer cursor, written only by the consumer
//!   8   stride      bytes per slot (slot size rounded up to 4)
//!   12  capacity    number of slots, a power of two
//!   16  magic       RING_MAGIC once formatted
//!   64  slots[capacity]
//!
//! SECURITY INVARIANTS:
//!   - Each cursor has exactly one writer; no lock is shared between domains
//!   - Cursors are free-running u32 counters compared with wrapping subtraction
//!   - A producer never overwrites a slot the consumer has not released
//!   - A consumer never trusts a producer cursor more than `capacity` ahead

#![forbid(unsafe_code)]
#![deny(clippy::all)]

use core::marker::PhantomData;
use core::sync::atomic::Ordering;

use nexus_grant::{Page, PageRangeError, PAGE_SIZE};
use thiserror::Error;

/// Bytes reserved for the ring header before the first slot.
pub const HEADER_SIZE: usize = 64;
/// Value stored at the magic offset of a formatted ring.
pub const RING_MAGIC: u32 = 0x5352_4E47;

const OFF_PROD: usize = 0;
const OFF_CONS: usize = 4;
const OFF_STRIDE: usize = 8;
const OFF_CAPACITY: usize = 12;
const OFF_MAGIC: usize = 16;

/// Fixed-size record carried in one ring slot.
pub trait Slot: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Writes the record into `out` (exactly `SIZE` bytes).
    fn encode(&self, out: &mut [u8]);

    /// Reads a record from `bytes` (exactly `SIZE` bytes).
    fn decode(bytes: &[u8]) -> Self;
}

impl<const N: usize> Slot for [u8; N] {
    const SIZE: usize = N;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        out
    }
}

/// Errors raised while formatting or attaching to a ring.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingError {
    /// The page does not carry a formatted ring header.
    #[error("page does not hold a formatted ring")]
    Unformatted,
    /// The stamped geometry does not fit the record type or the page.
    #[error("ring geometry mismatch: expected stride {expected_stride}, found stride {stride} capacity {capacity}")]
    GeometryMismatch {
        /// Stride required by the record type.
        expected_stride: u32,
        /// Stride found in the header.
        stride: u32,
        /// Capacity found in the header.
        capacity: u32,
    },
    /// Not even one slot of this size fits in a page.
    #[error("slot of {0} bytes does not fit in a ring page")]
    SlotTooLarge(usize),
    /// Requested capacity is zero, not a power of two, or too large.
    #[error("invalid ring capacity {0}")]
    InvalidCapacity(u32),
    /// Header access failed.
    #[error(transparent)]
    Page(#[from] PageRangeError),
}

/// Returned by [`RingProducer::produce`] when every slot holds unread data.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("ring full")]
pub struct Full;

/// Slot stride and count of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes per slot.
    pub stride: u32,
    /// Number of slots (power of two).
    pub capacity: u32,
}

impl Geometry {
    fn stride_of<T: Slot>() -> usize {
        T::SIZE.div_ceil(4) * 4
    }

    /// Largest power-of-two ring of `T` records that fits in one page.
    pub fn for_slot<T: Slot>() -> Result<Self, RingError> {
        let stride = Self::stride_of::<T>();
        let fit = if stride == 0 { 0 } else { (PAGE_SIZE - HEADER_SIZE) / stride };
        if fit == 0 {
            return Err(RingError::SlotTooLarge(T::SIZE));
        }
        let capacity = 1u32 << (usize::BITS - 1 - fit.leading_zeros());
        Ok(Self { stride: stride as u32, capacity })
    }

    /// Ring of exactly `capacity` `T` records.
    pub fn with_capacity<T: Slot>(capacity: u32) -> Result<Self, RingError> {
        let max = Self::for_slot::<T>()?;
        if capacity == 0 || !capacity.is_power_of_two() || capacity > max.capacity {
            return Err(RingError::InvalidCapacity(capacity));
        }
        Ok(Self { stride: max.stride, capacity })
    }

    fn fits(&self) -> bool {
        self.capacity.is_power_of_two()
            && self.stride % 4 == 0
            && HEADER_SIZE + self.capacity as usize * self.stride as usize <= PAGE_SIZE
    }

    fn slot_offset(&self, cursor: u32) -> usize {
        HEADER_SIZE + (cursor & (self.capacity - 1)) as usize * self.stride as usize
    }
}

/// Stamps an empty ring with the largest capacity that fits one page.
pub fn format<T: Slot>(page: &Page) -> Result<Geometry, RingError> {
    write_header(page, Geometry::for_slot::<T>()?)
}

/// Stamps an empty ring with exactly `capacity` slots.
pub fn format_with_capacity<T: Slot>(page: &Page, capacity: u32) -> Result<Geometry, RingError> {
    write_header(page, Geometry::with_capacity::<T>(capacity)?)
}

fn write_header(page: &Page, geometry: Geometry) -> Result<Geometry, RingError> {
    page.clear(0, HEADER_SIZE)?;
    page.store_u32(OFF_STRIDE, geometry.stride, Ordering::Relaxed)?;
    page.store_u32(OFF_CAPACITY, geometry.capacity, Ordering::Relaxed)?;
    page.store_u32(OFF_MAGIC, RING_MAGIC, Ordering::Release)?;
    Ok(geometry)
}

fn read_header<T: Slot>(page: &Page) -> Result<Geometry, RingError> {
    if page.load_u32(OFF_MAGIC, Ordering::Acquire)? != RING_MAGIC {
        return Err(RingError::Unformatted);
    }
    let geometry = Geometry {
        stride: page.load_u32(OFF_STRIDE, Ordering::Relaxed)?,
        capacity: page.load_u32(OFF_CAPACITY, Ordering::Relaxed)?,
    };
    let expected_stride = Geometry::stride_of::<T>() as u32;
    if geometry.stride != expected_stride || !geometry.fits() {
        return Err(RingError::GeometryMismatch {
            expected_stride,
            stride: geometry.stride,
            capacity: geometry.capacity,
        });
    }
    Ok(geometry)
}

// Cursor offsets are constants inside the header, so the accessors cannot fail.
fn cursor(page: &Page, offset: usize, order: Ordering) -> u32 {
    page.load_u32(offset, order).unwrap_or_default()
}

fn publish(page: &Page, offset: usize, value: u32) {
    let _ = page.store_u32(offset, value, Ordering::Release);
}

/// Attaches the producing end to a formatted ring page.
pub fn init_as_producer<T: Slot>(page: Page) -> Result<RingProducer<T>, RingError> {
    let geometry = read_header::<T>(&page)?;
    let prod = page.load_u32(OFF_PROD, Ordering::Relaxed)?;
    Ok(RingProducer { page, geometry, prod, scratch: vec![0; geometry.stride as usize], _slot: PhantomData })
}

/// Attaches the consuming end to a formatted ring page.
pub fn init_as_consumer<T: Slot>(page: Page) -> Result<RingConsumer<T>, RingError> {
    let geometry = read_header::<T>(&page)?;
    let cons = page.load_u32(OFF_CONS, Ordering::Relaxed)?;
    Ok(RingConsumer {
        page,
        geometry,
        cons,
        corrupt: false,
        scratch: vec![0; geometry.stride as usize],
        _slot: PhantomData,
    })
}

/// Producing end of a ring. Only this end writes the `prod` cursor.
pub struct RingProducer<T: Slot> {
    page: Page,
    geometry: Geometry,
    prod: u32,
    scratch: Vec<u8>,
    _slot: PhantomData<fn(T)>,
}

impl<T: Slot> RingProducer<T> {
    /// Copies `value` into the next free slot and publishes it.
    ///
    /// Never blocks and never overwrites unread slots. The caller signals the
    /// peer afterwards.
    pub fn produce(&mut self, value: &T) -> Result<(), Full> {
        if self.free_slots() == 0 {
            return Err(Full);
        }
        self.scratch.fill(0);
        value.encode(&mut self.scratch[..T::SIZE]);
        // The slot range was checked against the page when the geometry was read.
        self.page
            .write_bytes(self.geometry.slot_offset(self.prod), &self.scratch)
            .map_err(|_| Full)?;
        self.prod = self.prod.wrapping_add(1);
        publish(&self.page, OFF_PROD, self.prod);
        Ok(())
    }

    /// Number of slots that can be produced without overwriting unread data.
    pub fn free_slots(&self) -> u32 {
        let cons = cursor(&self.page, OFF_CONS, Ordering::Acquire);
        let used = self.prod.wrapping_sub(cons);
        self.geometry.capacity.saturating_sub(used)
    }

    /// Geometry of the attached ring.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }
}

/// Consuming end of a ring. Only this end writes the `cons` cursor.
pub struct RingConsumer<T: Slot> {
    page: Page,
    geometry: Geometry,
    cons: u32,
    corrupt: bool,
    scratch: Vec<u8>,
    _slot: PhantomData<fn() -> T>,
}

impl<T: Slot> RingConsumer<T> {
    fn available(&self) -> u32 {
        cursor(&self.page, OFF_PROD, Ordering::Acquire).wrapping_sub(self.cons)
    }

    /// Takes the oldest unread record, if any.
    pub fn consume(&mut self) -> Option<T> {
        let available = self.available();
        if available == 0 {
            return None;
        }
        if available > self.geometry.capacity {
            self.corrupt = true;
            return None;
        }
        self.page.read_bytes(self.geometry.slot_offset(self.cons), &mut self.scratch).ok()?;
        let value = T::decode(&self.scratch[..T::SIZE]);
        self.cons = self.cons.wrapping_add(1);
        publish(&self.page, OFF_CONS, self.cons);
        Some(value)
    }

    /// Returns `true` while records are waiting to be consumed.
    pub fn has_unconsumed(&self) -> bool {
        let available = self.available();
        available != 0 && available <= self.geometry.capacity
    }

    /// Set once the producer cursor was seen more than `capacity` ahead.
    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    /// Geometry of the attached ring.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::thread;

    type Record = [u8; 32];

    fn record(tag: u8) -> Record {
        [tag; 32]
    }

    fn pair(capacity: u32) -> (RingProducer<Record>, RingConsumer<Record>, Page) {
        let page = Page::zeroed();
        format_with_capacity::<Record>(&page, capacity).unwrap();
        let producer = init_as_producer(page.clone()).unwrap();
        let consumer = init_as_consumer(page.clone()).unwrap();
        (producer, consumer, page)
    }

    #[test]
    fn default_geometry_for_message_record() {
        let page = Page::zeroed();
        let geometry = format::<Record>(&page).unwrap();
        assert_eq!(geometry, Geometry { stride: 32, capacity: 64 });
        assert_eq!(Geometry::for_slot::<[u8; 5]>().unwrap().stride, 8);
        assert_eq!(Geometry::for_slot::<[u8; 4096]>(), Err(RingError::SlotTooLarge(4096)));
    }

    #[test]
    fn capacity_boundary() {
        let (mut producer, mut consumer, _page) = pair(4);
        for tag in 0..4 {
            producer.produce(&record(tag)).unwrap();
        }
        assert_eq!(producer.produce(&record(9)), Err(Full));
        assert_eq!(consumer.consume(), Some(record(0)));
        producer.produce(&record(4)).unwrap();
        assert_eq!(producer.produce(&record(5)), Err(Full));
    }

    #[test]
    fn empty_ring_consumes_nothing() {
        let (_producer, mut consumer, _page) = pair(8);
        assert!(!consumer.has_unconsumed());
        assert_eq!(consumer.consume(), None);
    }

    #[test]
    fn header_layout_is_explicit() {
        let (mut producer, _consumer, page) = pair(8);
        producer.produce(&record(0xAB)).unwrap();
        let bytes = page.snapshot();
        assert_eq!(&bytes[OFF_PROD..OFF_PROD + 4], &1u32.to_le_bytes());
        assert_eq!(&bytes[OFF_CONS..OFF_CONS + 4], &0u32.to_le_bytes());
        assert_eq!(&bytes[OFF_STRIDE..OFF_STRIDE + 4], &32u32.to_le_bytes());
        assert_eq!(&bytes[OFF_CAPACITY..OFF_CAPACITY + 4], &8u32.to_le_bytes());
        assert_eq!(&bytes[OFF_MAGIC..OFF_MAGIC + 4], &RING_MAGIC.to_le_bytes());
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 32], &[0xAB; 32]);
        assert!(bytes[HEADER_SIZE + 32..].iter().all(|b| *b == 0));
    }

    #[test]
    fn attach_rejects_unformatted_and_mismatched_pages() {
        let page = Page::zeroed();
        assert_eq!(init_as_consumer::<Record>(page.clone()).err(), Some(RingError::Unformatted));
        format::<Record>(&page).unwrap();
        assert!(matches!(
            init_as_producer::<[u8; 16]>(page.clone()),
            Err(RingError::GeometryMismatch { expected_stride: 16, stride: 32, .. })
        ));
        page.store_u32(OFF_CAPACITY, 3, Ordering::Relaxed).unwrap();
        assert!(init_as_consumer::<Record>(page).is_err());
    }

    #[test]
    fn cursors_wrap_around_u32() {
        let page = Page::zeroed();
        format_with_capacity::<Record>(&page, 4).unwrap();
        page.store_u32(OFF_PROD, u32::MAX - 1, Ordering::Relaxed).unwrap();
        page.store_u32(OFF_CONS, u32::MAX - 1, Ordering::Relaxed).unwrap();
        let mut producer = init_as_producer::<Record>(page.clone()).unwrap();
        let mut consumer = init_as_consumer::<Record>(page.clone()).unwrap();
        for tag in 0..4 {
            producer.produce(&record(tag)).unwrap();
        }
        assert_eq!(producer.produce(&record(7)), Err(Full));
        for tag in 0..4 {
            assert_eq!(consumer.consume(), Some(record(tag)));
        }
        assert!(!consumer.has_unconsumed());
        assert_eq!(page.load_u32(OFF_CONS, Ordering::Relaxed).unwrap(), 2);
    }

    #[test]
    fn runaway_producer_cursor_is_not_trusted() {
        let (_producer, mut consumer, page) = pair(4);
        page.store_u32(OFF_PROD, 40, Ordering::Release).unwrap();
        assert!(!consumer.has_unconsumed());
        assert_eq!(consumer.consume(), None);
        assert!(consumer.is_corrupt());
    }

    #[test]
    fn cross_thread_transfer_preserves_order() {
        let (mut producer, mut consumer, _page) = pair(16);
        let writer = thread::spawn(move || {
            for i in 0..2_000u32 {
                let mut rec = [0u8; 32];
                rec[..4].copy_from_slice(&i.to_le_bytes());
                while producer.produce(&rec).is_err() {
                    thread::yield_now();
                }
            }
        });
        let mut expected = 0u32;
        while expected < 2_000 {
            match consumer.consume() {
                Some(rec) => {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&rec[..4]);
                    assert_eq!(u32::from_le_bytes(raw), expected);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        writer.join().unwrap();
        assert!(!consumer.has_unconsumed());
    }

    proptest! {
        #[test]
        fn fifo_order_matches_model(ops in proptest::collection::vec(any::<Option<u8>>(), 1..200)) {
            let (mut producer, mut consumer, _page) = pair(8);
            let mut model = VecDeque::new();
            for op in ops {
                match op {
                    Some(tag) => {
                        let result = producer.produce(&record(tag));
                        if model.len() == 8 {
                            prop_assert_eq!(result, Err(Full));
                        } else {
                            prop_assert!(result.is_ok());
                            model.push_back(record(tag));
                        }
                    }
                    None => prop_assert_eq!(consumer.consume(), model.pop_front()),
                }
            }
            while let Some(expected) = model.pop_front() {
                prop_assert_eq!(consumer.consume(), Some(expected));
            }
            prop_assert!(!consumer.has_unconsumed());
        }
    }
}
