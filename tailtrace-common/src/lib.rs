//! # Shared Record Layout (eBPF ↔ Userspace)
//!
//! Defines the fixed-layout event record and the constants shared between the
//! kernel-side probe programs and the userspace agent. All types use
//! `#[repr(C)]` so the bytes a probe writes into the `EVENTS` ring buffer are
//! exactly the bytes the agent's record codec decodes.
//!
//! ## Key Types
//!
//! - [`EventRecord`] - Record emitted by probes (64 bytes)
//! - [`Greeting`] - Per-subject message stored in the `GREETINGS` map
//!
//! ## Wire Layout
//!
//! ```text
//! 0        4        8        12   14   16               32               64
//! ├────────┼────────┼────────┼────┼────┼────────────────┼────────────────┤
//! │subject │ pid    │ opcode │len │rsvd│ command (16)   │ payload (32)   │
//! └────────┴────────┴────────┴────┴────┴────────────────┴────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Layout Constants
// ============================================================================

/// Capacity of the command name field (matches the kernel's `TASK_COMM_LEN`)
pub const COMMAND_CAPACITY: usize = 16;

/// Payload capacity of records produced by the kernel probes
///
/// The userspace codec accepts larger payloads on synthetic channels, but a
/// lane fed by the kernel ring buffer must use this capacity.
pub const PAYLOAD_CAPACITY: usize = 32;

/// Size of the fixed header that precedes the command name
pub const HEADER_SIZE: usize = 16;

/// Number of slots in the opcode dispatch table
///
/// Large enough for every x86-64 syscall number the examples route.
pub const MAX_OPCODES: u32 = 300;

// ============================================================================
// Opcodes
// ============================================================================

/// Records from the `sys_enter` tracepoint; the payload carries the syscall
/// number to tail call
pub const OPCODE_ROUTER: u32 = 0;

/// `execve(2)` on x86-64
pub const OPCODE_EXECVE: u32 = 59;

/// `timer_create(2)` on x86-64
pub const OPCODE_TIMER_CREATE: u32 = 222;

/// `timer_delete(2)` on x86-64
pub const OPCODE_TIMER_DELETE: u32 = 226;

/// Timer-related syscalls routed to the same handler (222..=226)
pub const TIMER_OPCODES: [u32; 5] = [222, 223, 224, 225, 226];

/// Syscalls that fire so often their trace output is noise
pub const NOISY_OPCODES: [u32; 23] = [
    21, 22, 25, 29, 56, 57, 63, 64, 66, 72, 73, 79, 98, 101, 115, 131, 134, 135, 139, 172, 233,
    280, 291,
];

/// Whether `sys_enter` forwards `syscall` to the router
///
/// execve already has its own kprobe record, so forwarding it too would
/// count every exec twice.
#[must_use]
pub const fn routed_by_sys_enter(syscall: u32) -> bool {
    syscall != OPCODE_EXECVE
}

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Event record sent from eBPF to userspace via ring buffer
///
/// **Memory Layout**: `#[repr(C)]`, no implicit padding, little-endian on
/// `bpfel` targets.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventRecord {
    /// User ID of the calling task (low 32 bits of `bpf_get_current_uid_gid`)
    pub subject_id: u32,

    /// Process ID (TGID in Linux terms)
    pub process_id: u32,

    /// Event kind or routing target, usually the syscall number
    pub opcode: u32,

    /// Number of meaningful bytes in `payload`
    pub payload_len: u16,

    #[allow(clippy::pub_underscore_fields)]
    pub _reserved: u16,

    /// Command name, NUL padded
    pub command: [u8; COMMAND_CAPACITY],

    /// Free-form payload, zero padded
    pub payload: [u8; PAYLOAD_CAPACITY],
}

impl EventRecord {
    /// An all-zero record
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            subject_id: 0,
            process_id: 0,
            opcode: 0,
            payload_len: 0,
            _reserved: 0,
            command: [0; COMMAND_CAPACITY],
            payload: [0; PAYLOAD_CAPACITY],
        }
    }
}

/// Per-subject message configured from userspace
///
/// Stored in the `GREETINGS` map keyed by subject ID; the execve probe copies
/// it into the record payload.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Greeting {
    pub len: u32,
    pub text: [u8; PAYLOAD_CAPACITY],
}

impl Greeting {
    /// Build a greeting, truncating `text` to the payload capacity
    #[must_use]
    pub fn new(text: &[u8]) -> Self {
        let len = if text.len() < PAYLOAD_CAPACITY { text.len() } else { PAYLOAD_CAPACITY };
        let mut buf = [0u8; PAYLOAD_CAPACITY];
        buf[..len].copy_from_slice(&text[..len]);
        #[allow(clippy::cast_possible_truncation)]
        Self { len: len as u32, text: buf }
    }
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod lets aya copy these types to and from map memory as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for EventRecord {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for Greeting {}
