//! Domain model for tailtrace
//!
//! Core identifiers and the error taxonomy shared by the transport, dispatch
//! and consumer layers.

pub mod errors;
pub mod types;

pub use types::LaneId;

pub use errors::{CodecError, ConfigError, DispatchLoopError};
