//! # eBPF Program Loading and Pumping
//!
//! Loads the compiled kernel probes, attaches them, and copies every sample
//! from the `EVENTS` ring buffer into a transport lane.
//!
//! ## Attachment Points
//!
//! - **Kprobe**: `hello_execve` on the configured execve symbol
//! - **Raw tracepoint**: `sys_enter` (only with `--all-syscalls`), emitting
//!   router records for every syscall except execve
//!
//! Kernel samples already use the record wire layout, so the pump hands them
//! to [`Lane::write_raw`] unchanged. Requires a payload capacity of
//! [`PAYLOAD_CAPACITY`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::{
    maps::{HashMap, MapData, RingBuf},
    programs::{KProbe, RawTracePoint},
    Ebpf,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use tailtrace_common::{Greeting, PAYLOAD_CAPACITY};

use crate::dispatch::handlers::Greetings;
use crate::transport::{Lane, Shutdown};

/// How long the pump sleeps once the kernel ring is empty
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// What the kernel side reported when the pump stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpSummary {
    /// Samples copied into the lane
    pub samples: u64,
    /// Samples the kernel could not reserve in `EVENTS`
    pub kernel_drops: u64,
    /// In-kernel execve count per subject, ordered by subject
    pub kernel_counts: Vec<(u32, u64)>,
}

/// Loaded probe object
pub struct EbpfSource {
    bpf: Ebpf,
}

impl EbpfSource {
    /// Load the probe object and start forwarding its log output
    ///
    /// # Errors
    /// Returns an error if the object cannot be read or verified.
    pub fn load(object: &Path) -> Result<Self> {
        let mut bpf = Ebpf::load_file(object)
            .with_context(|| format!("Failed to load eBPF object {}", object.display()))?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {e}");
        }
        Ok(Self { bpf })
    }

    /// Copy greetings into the `GREETINGS` map
    ///
    /// # Errors
    /// Returns an error if the map is missing or an insert fails.
    pub fn seed_greetings(&mut self, greetings: &Greetings) -> Result<usize> {
        let mut map: HashMap<_, u32, Greeting> = HashMap::try_from(
            self.bpf.map_mut("GREETINGS").context("GREETINGS map not found")?,
        )?;
        for (subject, message) in greetings {
            if message.len() > PAYLOAD_CAPACITY {
                warn!("Greeting for subject {subject} truncated to {PAYLOAD_CAPACITY} bytes");
            }
            map.insert(subject, Greeting::new(message.as_bytes()), 0)?;
        }
        debug!("Seeded {} greetings", greetings.len());
        Ok(greetings.len())
    }

    /// Attach `hello_execve` as a kprobe on `symbol`
    ///
    /// # Errors
    /// Returns an error if the program is missing or fails to load or attach.
    pub fn attach_execve(&mut self, symbol: &str) -> Result<()> {
        let program: &mut KProbe = self
            .bpf
            .program_mut("hello_execve")
            .context("hello_execve program not found")?
            .try_into()?;
        program.load()?;
        program
            .attach(symbol, 0)
            .with_context(|| format!("Failed to attach kprobe to {symbol}"))?;
        info!("✓ Attached kprobe: {symbol}");
        Ok(())
    }

    /// Attach `sys_enter` as a raw tracepoint
    ///
    /// # Errors
    /// Returns an error if the program is missing or fails to load or attach.
    pub fn attach_sys_enter(&mut self) -> Result<()> {
        let program: &mut RawTracePoint = self
            .bpf
            .program_mut("sys_enter")
            .context("sys_enter program not found")?
            .try_into()?;
        program.load()?;
        program.attach("sys_enter").context("Failed to attach raw tracepoint sys_enter")?;
        info!("✓ Attached raw tracepoint: sys_enter");
        Ok(())
    }

    /// Copy kernel samples into `lane` until `shutdown` fires
    ///
    /// Programs stay attached for as long as the pump runs.
    ///
    /// # Errors
    /// Returns an error if the `EVENTS` map is missing.
    pub async fn pump(mut self, lane: Arc<Lane>, shutdown: Shutdown) -> Result<PumpSummary> {
        let mut ring = RingBuf::try_from(self.bpf.take_map("EVENTS").context("EVENTS map not found")?)?;
        let mut samples = 0u64;

        loop {
            while let Some(item) = ring.next() {
                lane.write_raw(&item);
                samples += 1;
            }
            if shutdown.is_triggered() {
                break;
            }
            tokio::time::sleep(PUMP_INTERVAL).await;
        }

        Ok(PumpSummary {
            samples,
            kernel_drops: self.kernel_drops(),
            kernel_counts: self.kernel_counts(),
        })
    }

    fn kernel_drops(&self) -> u64 {
        let Some(map) = self.bpf.map("RING_DROPS") else {
            return 0;
        };
        match HashMap::<&MapData, u32, u64>::try_from(map) {
            Ok(drops) => drops.get(&0, 0).unwrap_or(0),
            Err(e) => {
                warn!("Failed to read RING_DROPS: {e}");
                0
            }
        }
    }

    fn kernel_counts(&self) -> Vec<(u32, u64)> {
        let Some(map) = self.bpf.map("COUNTER_TABLE") else {
            return Vec::new();
        };
        let counts = match HashMap::<&MapData, u32, u64>::try_from(map) {
            Ok(counts) => counts,
            Err(e) => {
                warn!("Failed to read COUNTER_TABLE: {e}");
                return Vec::new();
            }
        };
        let mut entries: Vec<(u32, u64)> = counts.iter().filter_map(Result::ok).collect();
        entries.sort_unstable_by_key(|&(subject, _)| subject);
        entries
    }
}
