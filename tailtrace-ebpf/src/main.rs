//! # eBPF Kernel-Side Probes
//!
//! Probe programs that emit fixed-layout records into the `EVENTS` ring
//! buffer for the userspace agent to route and aggregate.
//!
//! ## Programs
//!
//! - **Kprobe**: `hello_execve` - one record per `execve(2)`, opcode 59
//! - **Raw tracepoint**: `sys_enter` - one router record per syscall other than
//!   execve, with the syscall number in the payload
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (256KB) for the record stream
//! - `GREETINGS` - Subject ID → message copied into the record payload
//! - `COUNTER_TABLE` - Subject ID → execve count, maintained in-kernel
//! - `RING_DROPS` - Records the kernel failed to reserve in `EVENTS`
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_uid_gid},
    macros::{kprobe, map, raw_tracepoint},
    maps::{HashMap, RingBuf},
    programs::{ProbeContext, RawTracePointContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use tailtrace_common::{
    routed_by_sys_enter, EventRecord, Greeting, OPCODE_EXECVE, OPCODE_ROUTER, PAYLOAD_CAPACITY,
};

// ============================================================================
// eBPF Maps
// ============================================================================

/// Ring buffer for sending records to userspace
///
/// The kernel drops a record when `output()` cannot reserve space; those
/// failures are counted in `RING_DROPS`.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

/// Map: Subject ID → greeting, written by userspace at startup
#[map]
static GREETINGS: HashMap<u32, Greeting> = HashMap::with_max_entries(64, 0);

/// Map: Subject ID → number of execve calls
#[map]
static COUNTER_TABLE: HashMap<u32, u64> = HashMap::with_max_entries(1024, 0);

/// Single-entry counter of failed ring buffer writes
#[map]
static RING_DROPS: HashMap<u32, u64> = HashMap::with_max_entries(1, 0);

/// Payload used when no greeting is configured for the subject
const DEFAULT_MESSAGE: &[u8] = b"Hello World";

// ============================================================================
// eBPF Program Hooks
// ============================================================================

#[kprobe]
pub fn hello_execve(ctx: ProbeContext) -> u32 {
    match try_hello_execve(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_hello_execve(ctx: &ProbeContext) -> Result<(), i64> {
    let subject_id = unsafe { bpf_get_current_uid_gid() } as u32;
    debug!(ctx, "execve by subject {}", subject_id);

    count_subject(subject_id);

    let mut record = current_record(subject_id, OPCODE_EXECVE);
    match unsafe { GREETINGS.get(&subject_id) } {
        Some(greeting) => {
            let len = (greeting.len as usize).min(PAYLOAD_CAPACITY);
            record.payload = greeting.text;
            record.payload_len = len as u16;
        }
        None => {
            record.payload[..DEFAULT_MESSAGE.len()].copy_from_slice(DEFAULT_MESSAGE);
            record.payload_len = DEFAULT_MESSAGE.len() as u16;
        }
    }

    submit(&record)
}

#[raw_tracepoint(tracepoint = "sys_enter")]
pub fn sys_enter(ctx: RawTracePointContext) -> u32 {
    match try_sys_enter(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_sys_enter(ctx: &RawTracePointContext) -> Result<(), i64> {
    // sys_enter args: [0] = struct pt_regs *, [1] = syscall number
    let args = ctx.as_ptr() as *const u64;
    let syscall = unsafe { *args.add(1) } as u32;
    if !routed_by_sys_enter(syscall) {
        return Ok(());
    }

    let subject_id = unsafe { bpf_get_current_uid_gid() } as u32;
    let mut record = current_record(subject_id, OPCODE_ROUTER);
    record.payload[..4].copy_from_slice(&syscall.to_le_bytes());
    record.payload_len = 4;

    submit(&record)
}

// ============================================================================
// Helpers
// ============================================================================

fn current_record(subject_id: u32, opcode: u32) -> EventRecord {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };

    let mut record = EventRecord::zeroed();
    record.subject_id = subject_id;
    record.process_id = (pid_tgid >> 32) as u32;
    record.opcode = opcode;
    record.command = bpf_get_current_comm().unwrap_or([0u8; 16]);
    record
}

fn count_subject(subject_id: u32) {
    match COUNTER_TABLE.get_ptr_mut(&subject_id) {
        Some(count) => unsafe { *count += 1 },
        None => {
            let _ = COUNTER_TABLE.insert(&subject_id, &1, 0);
        }
    }
}

fn submit(record: &EventRecord) -> Result<(), i64> {
    if EVENTS.output(record, 0).is_err() {
        let key = 0u32;
        match RING_DROPS.get_ptr_mut(&key) {
            Some(drops) => unsafe { *drops += 1 },
            None => {
                let _ = RING_DROPS.insert(&key, &1, 0);
            }
        }
        return Err(1);
    }
    Ok(())
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
