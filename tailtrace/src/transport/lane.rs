//! # Lane
//!
//! One bounded circular buffer of encoded records.
//!
//! Each slot carries a sequence number. A producer at write position `p` may
//! claim slot `p & mask` only when its sequence is `2p` (free for lap `p`);
//! publishing sets it to `2p + 1`. The consumer at read position `p` takes the
//! slot only at `2p + 1` and hands it back as `2(p + capacity)`. Free and
//! written states never collide, even for a single-slot lane, and a full lane
//! is detected without waiting on the consumer:
//!
//! ```text
//!   read_cursor                      write_cursor
//!        │                                │
//!  ┌─────▼──────┬──────────┬──────────┬───▼─────┐
//!  │ seq = 2r+1 │ 2(r+1)+1 │ 2(r+2)+1 │ seq = 2w │   w - r <= capacity
//!  └────────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The consumer advances `read_cursor` just before it frees the slot. A
//! producer that finds the slot still occupied while the cursors say there
//! is room backs off until the slot is released, so a write is only dropped
//! when `capacity` records are genuinely outstanding.
//!
//! Slot bytes sit behind a lock that is never contended: the sequence
//! protocol grants exclusive access before anyone touches it.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::sync::Unparker;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

use crate::codec::{Record, RecordCodec};
use crate::domain::{CodecError, ConfigError, LaneId};

/// Result of polling a lane once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    /// Nothing to read
    Empty,
    /// The next record, plus drops observed since the previous read
    Record { record: Record, dropped: u64 },
    /// The next slot held bytes that did not decode
    Malformed { error: CodecError, dropped: u64 },
}

impl Polled {
    /// Drops surfaced by this poll (zero for `Empty`)
    #[must_use]
    pub fn dropped(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Record { dropped, .. } | Self::Malformed { dropped, .. } => *dropped,
        }
    }
}

struct Slot {
    sequence: AtomicU64,
    bytes: Mutex<Vec<u8>>,
}

/// Consumer-side bookkeeping; the lock makes the lane single-reader
struct ReaderState {
    drops_reported: u64,
}

pub struct Lane {
    id: LaneId,
    capacity: u64,
    mask: u64,
    codec: RecordCodec,
    slots: Box<[Slot]>,
    write_cursor: CachePadded<AtomicU64>,
    read_cursor: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    reader: Mutex<ReaderState>,
    doorbell: Option<Unparker>,
}

impl Lane {
    /// Allocate a lane of `capacity` slots
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidCapacity`] unless `capacity` is a
    /// non-zero power of two.
    pub fn new(id: LaneId, capacity: usize, codec: RecordCodec) -> Result<Self, ConfigError> {
        if !capacity.is_power_of_two() {
            return Err(ConfigError::InvalidCapacity { lane: id, capacity });
        }

        let slots = (0..capacity as u64)
            .map(|pos| Slot {
                sequence: AtomicU64::new(free_seq(pos)),
                bytes: Mutex::new(Vec::with_capacity(codec.record_size())),
            })
            .collect();

        Ok(Self {
            id,
            capacity: capacity as u64,
            mask: capacity as u64 - 1,
            codec,
            slots,
            write_cursor: CachePadded::new(AtomicU64::new(0)),
            read_cursor: CachePadded::new(AtomicU64::new(0)),
            dropped: CachePadded::new(AtomicU64::new(0)),
            reader: Mutex::new(ReaderState { drops_reported: 0 }),
            doorbell: None,
        })
    }

    /// Wake this consumer whenever a record is published
    #[must_use]
    pub(crate) fn with_doorbell(mut self, unparker: Unparker) -> Self {
        self.doorbell = Some(unparker);
        self
    }

    #[must_use]
    pub fn id(&self) -> LaneId {
        self.id
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[must_use]
    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    /// Total records claimed by producers
    #[must_use]
    pub fn write_cursor(&self) -> u64 {
        self.write_cursor.load(Ordering::Acquire)
    }

    /// Total records taken by the consumer
    #[must_use]
    pub fn read_cursor(&self) -> u64 {
        self.read_cursor.load(Ordering::Acquire)
    }

    /// Records currently buffered
    #[must_use]
    pub fn len(&self) -> u64 {
        // Read first: the read cursor never passes the write cursor
        let read = self.read_cursor();
        self.write_cursor().saturating_sub(read)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records discarded because the lane was full, since the lane opened
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Encode and append `record`
    ///
    /// Never blocks on the consumer. When the lane is full the record is
    /// discarded and the drop counter increments.
    pub fn write(&self, record: &Record) {
        if let Some(pos) = self.claim() {
            let slot = self.slot(pos);
            self.codec.encode_into(record, &mut slot.bytes.lock());
            self.publish(slot, pos);
        }
    }

    /// Append pre-encoded bytes, such as a sample from the kernel ring buffer
    ///
    /// The length is checked when the consumer decodes the slot.
    pub fn write_raw(&self, bytes: &[u8]) {
        if let Some(pos) = self.claim() {
            let slot = self.slot(pos);
            {
                let mut buf = slot.bytes.lock();
                buf.clear();
                buf.extend_from_slice(bytes);
            }
            self.publish(slot, pos);
        }
    }

    /// Take the next record
    ///
    /// `dropped` in the result counts drops since the previous read that
    /// returned a slot, so loss is visible without a side channel.
    pub fn poll(&self) -> Polled {
        let mut reader = self.reader.lock();

        let pos = self.read_cursor.load(Ordering::Relaxed);
        let slot = self.slot(pos);
        if slot.sequence.load(Ordering::Acquire) != written_seq(pos) {
            return Polled::Empty;
        }

        let decoded = self.codec.decode(&slot.bytes.lock());

        // Cursor first: `write - read` never exceeds `capacity`
        self.read_cursor.store(pos + 1, Ordering::Release);
        slot.sequence.store(free_seq(pos + self.capacity), Ordering::Release);

        let total = self.dropped.load(Ordering::Acquire);
        let dropped = total - reader.drops_reported;
        reader.drops_reported = total;

        match decoded {
            Ok(record) => Polled::Record { record, dropped },
            Err(error) => Polled::Malformed { error, dropped },
        }
    }

    fn slot(&self, pos: u64) -> &Slot {
        // mask < capacity, which came from a usize
        #[allow(clippy::cast_possible_truncation)]
        &self.slots[(pos & self.mask) as usize]
    }

    /// Reserve the next write position, or count a drop when full
    fn claim(&self) -> Option<u64> {
        let backoff = Backoff::new();
        let mut pos = self.write_cursor.load(Ordering::Relaxed);
        loop {
            let seq = self.slot(pos).sequence.load(Ordering::Acquire);
            #[allow(clippy::cast_possible_wrap)]
            let diff = seq.wrapping_sub(free_seq(pos)) as i64;

            if diff == 0 {
                match self.write_cursor.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(pos),
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                if pos.wrapping_sub(self.read_cursor.load(Ordering::Acquire)) < self.capacity {
                    // Already read, the consumer is about to free it
                    backoff.snooze();
                    continue;
                }
                // Slot still holds an unread record from one lap ago
                self.dropped.fetch_add(1, Ordering::AcqRel);
                return None;
            } else {
                // Another writer claimed this position
                pos = self.write_cursor.load(Ordering::Relaxed);
            }
        }
    }

    fn publish(&self, slot: &Slot, pos: u64) {
        slot.sequence.store(written_seq(pos), Ordering::Release);
        if let Some(doorbell) = &self.doorbell {
            doorbell.unpark();
        }
    }
}

#[inline]
fn free_seq(pos: u64) -> u64 {
    pos.wrapping_mul(2)
}

#[inline]
fn written_seq(pos: u64) -> u64 {
    pos.wrapping_mul(2).wrapping_add(1)
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("write_cursor", &self.write_cursor())
            .field("read_cursor", &self.read_cursor())
            .field("dropped", &self.dropped_total())
            .finish_non_exhaustive()
    }
}
