//! Structured error types for tailtrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! - [`ConfigError`] is fatal and only raised while the agent is being set up.
//! - [`CodecError`] and [`DispatchLoopError`] are per-record: the consumer
//!   counts them and moves on.

use super::types::LaneId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{lane} capacity {capacity} is not a non-zero power of two")]
    InvalidCapacity { lane: LaneId, capacity: usize },

    #[error("{0} is already open")]
    DuplicateLane(LaneId),

    #[error("At least one lane is required")]
    NoLanes,

    #[error("Output capacity must be at least 1")]
    NoOutputCapacity,

    #[error("Payload capacity {capacity} outside supported range {min}..={max}")]
    InvalidPayloadCapacity { capacity: usize, min: usize, max: usize },

    #[error("Opcode {opcode} outside dispatch table of {slots} entries")]
    OpcodeOutOfRange { opcode: u32, slots: u32 },

    #[error("Unknown handler \"{0}\"")]
    UnknownHandler(String),

    #[error("Invalid subject ID \"{0}\" in greetings")]
    InvalidSubject(String),

    #[error("Source {source_kind} requires {requirement}")]
    SourceRequirement { source_kind: &'static str, requirement: String },

    #[error("Failed to read config file {path}: {error}")]
    ReadFailed { path: String, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    ParseFailed { path: String, error: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Record is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Payload length {len} exceeds capacity {capacity}")]
    PayloadOverflow { len: usize, capacity: usize },
}

/// A record kept tail calling past the configured depth cap
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Record with opcode {origin} exceeded {depth} tail calls (last target {target})")]
pub struct DispatchLoopError {
    /// Opcode the record arrived with
    pub origin: u32,
    /// Opcode of the tail call that was refused
    pub target: u32,
    /// The configured cap
    pub depth: u32,
}
