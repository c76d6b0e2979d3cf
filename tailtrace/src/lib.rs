//! # tailtrace - Kernel Event Routing Runtime
//!
//! tailtrace moves small fixed-layout event records from many producers to a
//! single consumer, routes each record through an opcode-indexed handler
//! table that supports bounded "tail calls", and keeps per-subject counters
//! that can be snapshotted while they are being updated.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Producers                               │
//! │  • eBPF: kprobe hello_execve, raw tracepoint sys_enter          │
//! │  • Synthetic: one thread per lane                               │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ write / write_raw (never blocks)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Ring Buffer Transport                          │
//! │   lane 0 │ lane 1 │ ... │ lane N   (bounded, drops when full)   │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ poll, round-robin
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Poll Loop (one thread)                      │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │    Codec     │──▶│  Dispatch    │──▶│   Handlers   │         │
//! │  │  (decode)    │   │   Table      │◀──│ (tail calls) │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │                                               │                 │
//! │                          ┌────────────────────┼──────┐          │
//! │                          ▼                           ▼          │
//! │                  ┌──────────────┐           ┌──────────────┐    │
//! │                  │ Aggregation  │           │ Output events│    │
//! │                  │   (DashMap)  │           │  (channel)   │    │
//! │                  └──────────────┘           └──────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`codec`]: fixed-layout record encoding shared with the kernel probes
//! - [`transport`]: bounded multi-lane ring buffers with drop accounting
//! - [`dispatch`]: opcode → handler table, tail calls, built-in handlers
//! - [`aggregation`]: concurrent per-subject counters and snapshots
//! - [`consumer`]: the round-robin poll loop and its statistics
//! - [`producer`]: synthetic load and the eBPF ring buffer pump
//! - [`config`]: defaults, TOML file and CLI overrides
//! - [`report`]: console output
//! - [`cli`]: command-line arguments
//! - [`domain`]: lane IDs and error types
//!
//! ## Failure Model
//!
//! Only configuration errors stop the agent. A full lane drops the new
//! record and the next poll reports how many were lost; a malformed record
//! or a record that exceeds the tail-call cap is counted and skipped.
//!
//! ## Key Concepts
//!
//! - **Lane**: one bounded circular buffer written by one producer context
//! - **Opcode**: small integer naming the event kind or a routing target
//! - **Tail call**: re-dispatch of the current record under another opcode,
//!   replacing the current handler invocation instead of nesting in it
//! - **Subject**: the user ID an event is attributed to

pub mod aggregation;
pub mod cli;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod domain;
pub mod producer;
pub mod report;
pub mod transport;
