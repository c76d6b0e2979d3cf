//! # Producers
//!
//! Feed records into transport lanes until cancelled.
//!
//! - [`synthetic`]: in-process threads, one per lane, drawing opcodes from
//!   the default bindings plus unbound ones
//! - [`ebpf`]: kernel probes loaded from a compiled object, pumped from the
//!   `EVENTS` ring buffer into lane 0
//!
//! Producers never wait on the consumer: a full lane is a counted drop.

pub mod ebpf;
pub mod synthetic;

pub use ebpf::{EbpfSource, PumpSummary};
pub use synthetic::{spawn_synthetic, SyntheticConfig};
