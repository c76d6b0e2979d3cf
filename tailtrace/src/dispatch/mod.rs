//! # Dispatch Table
//!
//! Routes a decoded record to a handler by opcode, the userspace
//! counterpart of a BPF program array.
//!
//! ## Tail Calls
//!
//! A handler may ask for the same record to be re-dispatched under another
//! opcode with [`DispatchContext::tail_call`]. The request replaces the
//! current invocation: the handler returns, then the table runs the target.
//! Dispatch is a loop with a counter, never recursion, so the depth cap
//! always holds.
//!
//! ```text
//! record(opcode=0) ──► router ──tail_call(59)──► exec ──► AggregationTable
//!                                                   └──► OutputEvent
//! ```
//!
//! A tail call to an unbound opcode fails immediately (`tail_call` returns
//! `false`) and the calling handler carries on, mirroring how a failed
//! `bpf_tail_call` falls through to the next instruction.

pub mod handlers;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use tailtrace_common::MAX_OPCODES;

use crate::aggregation::AggregationTable;
use crate::codec::Record;
use crate::domain::{ConfigError, DispatchLoopError};

/// Default tail-call depth cap (the kernel allows 33 chained tail calls)
pub const DEFAULT_MAX_TAIL_CALLS: u32 = 32;

/// Something the table can invoke for a record
pub trait Handler: Send + Sync {
    fn handle(&self, record: &Record, ctx: &mut DispatchContext<'_>);

    /// Name shown in logs and summaries
    fn name(&self) -> &str {
        "anonymous"
    }
}

impl<F> Handler for F
where
    F: Fn(&Record, &mut DispatchContext<'_>) + Send + Sync,
{
    fn handle(&self, record: &Record, ctx: &mut DispatchContext<'_>) {
        self(record, ctx);
    }
}

/// Box a closure as a shareable handler
pub fn handler_fn<F>(handler: F) -> Arc<dyn Handler>
where
    F: Fn(&Record, &mut DispatchContext<'_>) + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Outcome of dispatching one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// A handler ran; `opcode` is the last one invoked
    Handled { opcode: u32, tail_calls: u32 },
    /// Nothing is bound to the record's opcode
    NoHandler { opcode: u32 },
}

/// Line of output produced by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub opcode: u32,
    pub subject_id: u32,
    pub process_id: u32,
    pub command: String,
    pub message: String,
}

/// Bounded, non-blocking destination for [`OutputEvent`]s
#[derive(Debug)]
pub struct OutputSink {
    tx: Sender<OutputEvent>,
    dropped: AtomicU64,
}

impl OutputSink {
    #[must_use]
    pub fn new(tx: Sender<OutputEvent>) -> Self {
        Self { tx, dropped: AtomicU64::new(0) }
    }

    fn send(&self, event: OutputEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            // A slow or absent reader must not stall the consumer
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events discarded because the channel was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// State shared by every handler invocation
#[derive(Debug)]
pub struct HandlerEnv {
    aggregation: Arc<AggregationTable>,
    output: Option<OutputSink>,
}

impl HandlerEnv {
    #[must_use]
    pub fn new(aggregation: Arc<AggregationTable>) -> Self {
        Self { aggregation, output: None }
    }

    #[must_use]
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = Some(output);
        self
    }

    #[must_use]
    pub fn aggregation(&self) -> &AggregationTable {
        &self.aggregation
    }

    #[must_use]
    pub fn output(&self) -> Option<&OutputSink> {
        self.output.as_ref()
    }
}

/// Per-dispatch view handed to handlers
pub struct DispatchContext<'a> {
    table: &'a DispatchTable,
    env: &'a HandlerEnv,
    record: &'a Record,
    opcode: u32,
    tail_calls: u32,
    pending: Option<u32>,
}

impl<'a> DispatchContext<'a> {
    /// Opcode the current handler was invoked under
    #[must_use]
    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// Tail calls taken so far for this record
    #[must_use]
    pub fn tail_calls(&self) -> u32 {
        self.tail_calls
    }

    #[must_use]
    pub fn aggregation(&self) -> &'a AggregationTable {
        self.env.aggregation()
    }

    /// Re-dispatch this record under `opcode` once the handler returns
    ///
    /// Returns `false` when nothing is bound to `opcode`; the handler should
    /// then run its fallback path. On `true` the handler should return
    /// without further side effects. A later call in the same invocation
    /// replaces an earlier one.
    pub fn tail_call(&mut self, opcode: u32) -> bool {
        if !self.table.is_bound(opcode) {
            return false;
        }
        self.pending = Some(opcode);
        true
    }

    /// Send a line of output attributed to the current record
    pub fn emit(&self, message: impl Into<String>) {
        if let Some(output) = self.env.output() {
            output.send(OutputEvent {
                opcode: self.opcode,
                subject_id: self.record.subject_id,
                process_id: self.record.process_id,
                command: self.record.command_name.clone(),
                message: message.into(),
            });
        }
    }
}

/// Opcode-indexed handler table
pub struct DispatchTable {
    slots: Vec<Option<Arc<dyn Handler>>>,
    max_tail_calls: u32,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new(MAX_OPCODES, DEFAULT_MAX_TAIL_CALLS)
    }
}

impl DispatchTable {
    /// Table with `slots` opcodes (`0..slots`) and a tail-call cap
    #[must_use]
    pub fn new(slots: u32, max_tail_calls: u32) -> Self {
        Self { slots: (0..slots).map(|_| None).collect(), max_tail_calls }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn slots(&self) -> u32 {
        self.slots.len() as u32
    }

    #[must_use]
    pub fn max_tail_calls(&self) -> u32 {
        self.max_tail_calls
    }

    /// Bind `opcode` to `handler`, replacing any previous binding
    ///
    /// Bind the same `Arc` to several opcodes to alias them.
    ///
    /// # Errors
    /// Returns [`ConfigError::OpcodeOutOfRange`] when `opcode` has no slot.
    pub fn register(&mut self, opcode: u32, handler: Arc<dyn Handler>) -> Result<(), ConfigError> {
        let slots = self.slots();
        let slot = self
            .slots
            .get_mut(opcode as usize)
            .ok_or(ConfigError::OpcodeOutOfRange { opcode, slots })?;
        *slot = Some(handler);
        Ok(())
    }

    /// Bind a closure
    ///
    /// # Errors
    /// Returns [`ConfigError::OpcodeOutOfRange`] when `opcode` has no slot.
    pub fn register_fn<F>(&mut self, opcode: u32, handler: F) -> Result<(), ConfigError>
    where
        F: Fn(&Record, &mut DispatchContext<'_>) + Send + Sync + 'static,
    {
        self.register(opcode, handler_fn(handler))
    }

    /// Remove the binding for `opcode`, returning it
    pub fn unregister(&mut self, opcode: u32) -> Option<Arc<dyn Handler>> {
        self.slots.get_mut(opcode as usize).and_then(Option::take)
    }

    #[must_use]
    pub fn lookup(&self, opcode: u32) -> Option<&Arc<dyn Handler>> {
        self.slots.get(opcode as usize).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn is_bound(&self, opcode: u32) -> bool {
        self.lookup(opcode).is_some()
    }

    /// Opcodes that currently have a handler, ascending
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bound_opcodes(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(opcode, _)| opcode as u32)
            .collect()
    }

    /// Route `record` by its opcode, following tail calls
    ///
    /// # Errors
    /// Returns [`DispatchLoopError`] when the record requests more than
    /// `max_tail_calls` tail calls. Side effects of the handlers that already
    /// ran are kept.
    pub fn dispatch(
        &self,
        record: &Record,
        env: &HandlerEnv,
    ) -> Result<DispatchResult, DispatchLoopError> {
        let Some(mut handler) = self.lookup(record.opcode) else {
            return Ok(DispatchResult::NoHandler { opcode: record.opcode });
        };

        let mut ctx = DispatchContext {
            table: self,
            env,
            record,
            opcode: record.opcode,
            tail_calls: 0,
            pending: None,
        };

        loop {
            handler.handle(record, &mut ctx);

            let Some(target) = ctx.pending.take() else {
                return Ok(DispatchResult::Handled {
                    opcode: ctx.opcode,
                    tail_calls: ctx.tail_calls,
                });
            };

            if ctx.tail_calls >= self.max_tail_calls {
                return Err(DispatchLoopError {
                    origin: record.opcode,
                    target,
                    depth: self.max_tail_calls,
                });
            }

            // tail_call only accepts bound targets
            let Some(next) = self.lookup(target) else {
                return Ok(DispatchResult::Handled {
                    opcode: ctx.opcode,
                    tail_calls: ctx.tail_calls,
                });
            };
            handler = next;
            ctx.opcode = target;
            ctx.tail_calls += 1;
        }
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("slots", &self.slots.len())
            .field("bound", &self.bound_opcodes().len())
            .field("max_tail_calls", &self.max_tail_calls)
            .finish()
    }
}
