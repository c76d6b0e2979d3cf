//! # Poll Loop
//!
//! The single consumer: polls every lane round-robin, reports losses, and
//! routes each decoded record through the dispatch table.
//!
//! ## Per-record Outcomes
//!
//! - `Polled::Record` → [`DispatchTable::dispatch`]
//! - `Polled::Malformed` → counted as a decode failure, discarded
//! - [`DispatchLoopError`](crate::domain::DispatchLoopError) → logged at
//!   `warn`, counted as an anomaly, discarded
//!
//! A non-zero drop count reaches the loss callback before the record that
//! carried it is dispatched.

use std::time::Duration;

use log::{debug, warn};

use crate::dispatch::{DispatchResult, DispatchTable, HandlerEnv};
use crate::domain::LaneId;
use crate::transport::{Polled, RingTransport, Shutdown};

/// Default wait between rounds that found nothing
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS);

/// Called with `(lane, drops)` whenever a lane reports losses
pub type LossCallback = Box<dyn FnMut(LaneId, u64) + Send>;

/// Counters kept by the poll loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Records decoded and dispatched
    pub records: u64,
    pub handled: u64,
    pub no_handler: u64,
    pub decode_failures: u64,
    /// Records abandoned at the tail-call cap
    pub loop_anomalies: u64,
    pub drops_reported: u64,
    pub idle_waits: u64,
    pub rounds: u64,
}

/// Drives one [`RingTransport`] into one [`DispatchTable`]
pub struct PollLoop {
    transport: RingTransport,
    table: DispatchTable,
    env: HandlerEnv,
    on_loss: LossCallback,
    idle_timeout: Duration,
    stats: PollStats,
}

impl PollLoop {
    #[must_use]
    pub fn new(transport: RingTransport, table: DispatchTable, env: HandlerEnv) -> Self {
        Self {
            transport,
            table,
            env,
            on_loss: Box::new(|lane, dropped| warn!("{lane}: lost {dropped} records")),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            stats: PollStats::default(),
        }
    }

    /// Replace the default loss callback (a `warn` log line)
    #[must_use]
    pub fn on_loss(mut self, callback: impl FnMut(LaneId, u64) + Send + 'static) -> Self {
        self.on_loss = Box::new(callback);
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn stats(&self) -> PollStats {
        self.stats
    }

    #[must_use]
    pub fn transport(&self) -> &RingTransport {
        &self.transport
    }

    #[must_use]
    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    #[must_use]
    pub fn env(&self) -> &HandlerEnv {
        &self.env
    }

    /// Poll until `shutdown` fires
    ///
    /// Shutdown is checked before every lane poll, so the record being
    /// dispatched when it fires is always finished. Records still queued are
    /// left in place; call [`PollLoop::drain`] to flush them.
    pub fn run(&mut self, shutdown: &Shutdown) -> PollStats {
        debug!("Poll loop started over {} lanes", self.transport.lanes().len());
        while !shutdown.is_triggered() {
            let progressed = self.round(Some(shutdown));
            if !progressed && !shutdown.is_triggered() {
                self.stats.idle_waits += 1;
                self.transport.park_timeout(self.idle_timeout);
            }
        }
        debug!("Poll loop stopped after {} rounds", self.stats.rounds);
        self.stats
    }

    /// Poll rounds until one finds every lane empty
    pub fn drain(&mut self) -> PollStats {
        while self.round(None) {}
        self.stats
    }

    /// One pass over every lane; true when any lane yielded something
    fn round(&mut self, shutdown: Option<&Shutdown>) -> bool {
        self.stats.rounds += 1;
        let mut progressed = false;

        for index in 0..self.transport.lanes().len() {
            if shutdown.is_some_and(Shutdown::is_triggered) {
                break;
            }
            let lane = &self.transport.lanes()[index];
            let lane_id = lane.id();
            let polled = lane.poll();

            let dropped = polled.dropped();
            if dropped > 0 {
                self.stats.drops_reported += dropped;
                (self.on_loss)(lane_id, dropped);
            }

            match polled {
                Polled::Empty => {}
                Polled::Record { record, .. } => {
                    progressed = true;
                    self.stats.records += 1;
                    match self.table.dispatch(&record, &self.env) {
                        Ok(DispatchResult::Handled { .. }) => self.stats.handled += 1,
                        Ok(DispatchResult::NoHandler { .. }) => self.stats.no_handler += 1,
                        Err(err) => {
                            self.stats.loop_anomalies += 1;
                            warn!("{lane_id}: {err}");
                        }
                    }
                }
                Polled::Malformed { error, .. } => {
                    progressed = true;
                    self.stats.decode_failures += 1;
                    debug!("{lane_id}: discarding malformed record: {error}");
                }
            }
        }

        progressed
    }
}

impl std::fmt::Debug for PollLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollLoop")
            .field("lanes", &self.transport.lanes().len())
            .field("table", &self.table)
            .field("idle_timeout", &self.idle_timeout)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationTable;
    use crate::codec::{Record, RecordCodec};
    use crate::dispatch::handlers::CountSubject;
    use crate::dispatch::DispatchContext;
    use crate::transport::Lane;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn setup(lanes: &[(u32, usize)], table: DispatchTable) -> (PollLoop, Vec<Arc<Lane>>) {
        let mut transport = RingTransport::new(RecordCodec::default());
        let handles = lanes
            .iter()
            .map(|&(id, capacity)| transport.open(LaneId(id), capacity).unwrap())
            .collect();
        let env = HandlerEnv::new(Arc::new(AggregationTable::new()));
        (PollLoop::new(transport, table, env), handles)
    }

    #[test]
    fn test_drain_dispatches_everything() {
        let mut table = DispatchTable::default();
        table.register(59, Arc::new(CountSubject)).unwrap();
        let (mut poll_loop, lanes) = setup(&[(0, 8), (1, 8)], table);

        lanes[0].write(&Record::new(59, 1, 0));
        lanes[1].write(&Record::new(59, 1, 0));
        lanes[1].write(&Record::new(999, 1, 0));

        let stats = poll_loop.drain();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.handled, 2);
        assert_eq!(stats.no_handler, 1);
        assert_eq!(poll_loop.env().aggregation().get(1), Some(2));
    }

    #[test]
    fn test_round_robin_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let mut table = DispatchTable::default();
        table
            .register_fn(1, move |record: &Record, _: &mut DispatchContext<'_>| {
                log.lock().push(record.process_id);
            })
            .unwrap();
        let (mut poll_loop, lanes) = setup(&[(0, 4), (1, 4)], table);

        for pid in [10, 11] {
            lanes[0].write(&Record::new(1, 0, pid));
        }
        for pid in [20, 21] {
            lanes[1].write(&Record::new(1, 0, pid));
        }

        poll_loop.drain();
        assert_eq!(*seen.lock(), vec![10, 20, 11, 21]);
    }

    #[test]
    fn test_loss_reported_before_record() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut table = DispatchTable::default();
        let log = Arc::clone(&events);
        table
            .register_fn(1, move |record: &Record, _: &mut DispatchContext<'_>| {
                log.lock().push(format!("record {}", record.process_id));
            })
            .unwrap();

        let (poll_loop, lanes) = setup(&[(3, 2)], table);
        let log = Arc::clone(&events);
        let mut poll_loop = poll_loop.on_loss(move |lane, dropped| {
            log.lock().push(format!("{lane} lost {dropped}"));
        });

        for pid in 0..5 {
            lanes[0].write(&Record::new(1, 0, pid));
        }

        let stats = poll_loop.drain();
        assert_eq!(*events.lock(), vec!["lane:3 lost 3", "record 0", "record 1"]);
        assert_eq!(stats.drops_reported, 3);
    }

    #[test]
    fn test_malformed_is_counted_and_skipped() {
        let (mut poll_loop, lanes) = setup(&[(0, 4)], DispatchTable::default());
        lanes[0].write_raw(&[1, 2, 3]);
        lanes[0].write(&Record::new(7, 0, 0));

        let stats = poll_loop.drain();
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.records, 1);
        assert_eq!(stats.no_handler, 1);
    }

    #[test]
    fn test_loop_anomaly_does_not_stop_the_loop() {
        let mut table = DispatchTable::new(16, 4);
        table
            .register_fn(1, |_: &Record, ctx: &mut DispatchContext<'_>| {
                ctx.tail_call(1);
            })
            .unwrap();
        table.register(2, Arc::new(CountSubject)).unwrap();
        let (mut poll_loop, lanes) = setup(&[(0, 4)], table);

        lanes[0].write(&Record::new(1, 0, 0));
        lanes[0].write(&Record::new(2, 5, 0));

        let stats = poll_loop.drain();
        assert_eq!(stats.loop_anomalies, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(poll_loop.env().aggregation().get(5), Some(1));
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let mut table = DispatchTable::default();
        table.register(59, Arc::new(CountSubject)).unwrap();
        let (poll_loop, lanes) = setup(&[(0, 64)], table);
        let mut poll_loop = poll_loop.idle_timeout(Duration::from_millis(5));
        let shutdown = poll_loop.transport().shutdown_handle();

        let trigger = shutdown.clone();
        let producer = std::thread::spawn(move || {
            for pid in 0..32 {
                lanes[0].write(&Record::new(59, 0, pid));
            }
            std::thread::sleep(Duration::from_millis(50));
            trigger.trigger();
        });

        poll_loop.run(&shutdown);
        producer.join().unwrap();
        let stats = poll_loop.drain();

        assert_eq!(stats.records, 32);
        assert!(stats.idle_waits > 0);
        assert_eq!(poll_loop.env().aggregation().get(0), Some(32));
    }
}
