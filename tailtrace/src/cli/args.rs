//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::config::SourceKind;

#[derive(Parser, Debug, Default)]
#[command(
    name = "tailtrace",
    about = "Route kernel events through a tail-call dispatch table",
    after_help = "\
EXAMPLES:
    tailtrace --duration 10                          Synthetic load, 10 seconds
    tailtrace --config tailtrace.toml                Settings from a file
    sudo tailtrace --source ebpf --object ./probe    Live execve events"
)]
pub struct Args {
    /// TOML configuration file; flags below override its values
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Where events come from
    #[arg(long, value_enum)]
    pub source: Option<SourceKind>,

    /// Number of producer lanes
    #[arg(long)]
    pub lanes: Option<u32>,

    /// Records per lane (power of two)
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Payload bytes per record
    #[arg(long)]
    pub payload_capacity: Option<usize>,

    /// Tail calls allowed per record
    #[arg(long)]
    pub max_tail_calls: Option<u32>,

    /// Seconds between counter reports
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Compiled kernel probe object (for --source ebpf)
    #[arg(long, value_name = "FILE")]
    pub object: Option<PathBuf>,

    /// Kernel symbol the execve probe attaches to
    #[arg(long, value_name = "SYMBOL")]
    pub kprobe: Option<String>,

    /// Also trace every syscall entry through the raw tracepoint
    #[arg(long)]
    pub all_syscalls: bool,

    /// Synthetic records per second per lane (0 = unthrottled)
    #[arg(long)]
    pub rate: Option<u64>,

    /// Suppress per-event output
    #[arg(short, long)]
    pub quiet: bool,
}
