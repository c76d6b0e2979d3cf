//! Randomised in-process load, one thread per lane.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::debug;
use tailtrace_common::{NOISY_OPCODES, OPCODE_EXECVE, TIMER_OPCODES};

use crate::codec::Record;
use crate::transport::{Lane, Shutdown};

const SUBJECTS: [u32; 4] = [0, 501, 1000, 1001];
const COMMANDS: [&str; 4] = ["bash", "sleep", "cron", "sshd"];
/// Opcodes nothing is bound to by default
const UNBOUND_OPCODES: [u32; 3] = [5, 250, 999];

#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticConfig {
    /// Records per second per lane, 0 for unthrottled
    pub rate: u64,
    /// Fixed seed for reproducible streams; lane `n` uses `seed + n`
    pub seed: Option<u64>,
}

/// One random record: mostly execve, then noise, timers and unbound opcodes
pub fn synthetic_record(rng: &mut fastrand::Rng) -> Record {
    let opcode = match rng.u8(0..10) {
        0..=3 => OPCODE_EXECVE,
        4..=5 => TIMER_OPCODES[rng.usize(..TIMER_OPCODES.len())],
        6..=8 => NOISY_OPCODES[rng.usize(..NOISY_OPCODES.len())],
        _ => UNBOUND_OPCODES[rng.usize(..UNBOUND_OPCODES.len())],
    };
    Record::new(opcode, SUBJECTS[rng.usize(..SUBJECTS.len())], rng.u32(1..=32_768))
        .with_command(COMMANDS[rng.usize(..COMMANDS.len())])
        .with_payload(*b"Hello World")
}

/// Start one producer thread per lane
///
/// Each thread returns how many records it wrote (including ones the lane
/// dropped) once `shutdown` fires.
pub fn spawn_synthetic(
    lanes: &[Arc<Lane>],
    config: SyntheticConfig,
    shutdown: &Shutdown,
) -> Vec<JoinHandle<u64>> {
    lanes
        .iter()
        .enumerate()
        .map(|(index, lane)| {
            let lane = Arc::clone(lane);
            let shutdown = shutdown.clone();
            let rng = match config.seed {
                Some(seed) => fastrand::Rng::with_seed(seed.wrapping_add(index as u64)),
                None => fastrand::Rng::new(),
            };
            std::thread::spawn(move || produce(&lane, rng, config.rate, &shutdown))
        })
        .collect()
}

fn produce(lane: &Lane, mut rng: fastrand::Rng, rate: u64, shutdown: &Shutdown) -> u64 {
    let interval = (rate > 0).then(|| Duration::from_nanos(1_000_000_000 / rate));
    let mut deadline = Instant::now();
    let mut written = 0u64;

    while !shutdown.is_triggered() {
        lane.write(&synthetic_record(&mut rng));
        written += 1;

        if let Some(interval) = interval {
            deadline += interval;
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            } else {
                // Fell behind; don't burst to catch up
                deadline = now;
            }
        }
    }

    debug!("{}: synthetic producer wrote {written} records", lane.id());
    written
}
