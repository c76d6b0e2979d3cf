//! # Ring Buffer Transport
//!
//! Moves encoded records from producer lanes to the single consumer.
//!
//! - [`RingTransport`] owns every [`Lane`] and the consumer's idle parker.
//! - Producers hold an `Arc<Lane>` and call [`Lane::write`] /
//!   [`Lane::write_raw`]; a full lane turns into a counted drop, never a wait.
//! - The consumer polls lanes in the order they were opened.
//!
//! Ordering is FIFO within a lane and unspecified across lanes.

pub mod lane;

pub use lane::{Lane, Polled};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};
use log::debug;

use crate::codec::RecordCodec;
use crate::domain::{ConfigError, LaneId};

pub struct RingTransport {
    codec: RecordCodec,
    lanes: Vec<Arc<Lane>>,
    parker: Parker,
}

impl RingTransport {
    #[must_use]
    pub fn new(codec: RecordCodec) -> Self {
        Self { codec, lanes: Vec::new(), parker: Parker::new() }
    }

    /// Allocate a lane of `capacity` records
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidCapacity`] when `capacity` is not a
    /// non-zero power of two and [`ConfigError::DuplicateLane`] when
    /// `lane_id` is already open.
    pub fn open(&mut self, lane_id: LaneId, capacity: usize) -> Result<Arc<Lane>, ConfigError> {
        if self.lane(lane_id).is_some() {
            return Err(ConfigError::DuplicateLane(lane_id));
        }

        let lane = Arc::new(
            Lane::new(lane_id, capacity, self.codec)?.with_doorbell(self.parker.unparker().clone()),
        );
        debug!("Opened {lane_id} with capacity {capacity}");
        self.lanes.push(Arc::clone(&lane));
        Ok(lane)
    }

    /// Lanes in round-robin order
    #[must_use]
    pub fn lanes(&self) -> &[Arc<Lane>] {
        &self.lanes
    }

    #[must_use]
    pub fn lane(&self, lane_id: LaneId) -> Option<&Arc<Lane>> {
        self.lanes.iter().find(|lane| lane.id() == lane_id)
    }

    #[must_use]
    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    /// Drops across every lane
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.lanes.iter().map(|lane| lane.dropped_total()).sum()
    }

    /// A fresh cancellation handle that also wakes the idle consumer
    #[must_use]
    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown::new(self.parker.unparker().clone())
    }

    /// Sleep until a producer publishes, a shutdown fires, or `timeout` passes
    pub fn park_timeout(&self, timeout: Duration) {
        self.parker.park_timeout(timeout);
    }
}

/// Cooperative cancellation signal
///
/// Clones share the same flag. Triggering it wakes the consumer if it is
/// parked.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    unparker: Unparker,
}

impl Shutdown {
    fn new(unparker: Unparker) -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), unparker }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.unparker.unpark();
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
