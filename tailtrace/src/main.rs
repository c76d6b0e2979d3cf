//! # tailtrace - Main Entry Point
//!
//! Supports two event sources:
//! - **Synthetic** (default): in-process producer threads, one per lane
//! - **eBPF** (`--source ebpf --object <FILE>`): kernel probes pumped from the
//!   `EVENTS` ring buffer
//!
//! Shutdown order: producers stop, the consumer drains what they left, the
//! output printer exits once the consumer drops its sender, then the final
//! snapshot and summary are printed.

#![allow(clippy::too_many_lines)]

use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tailtrace::aggregation::AggregationTable;
use tailtrace::cli::Args;
use tailtrace::config::{AgentConfig, SourceKind};
use tailtrace::consumer::PollLoop;
use tailtrace::dispatch::{HandlerEnv, OutputSink};
use tailtrace::domain::{ConfigError, LaneId};
use tailtrace::producer::{spawn_synthetic, EbpfSource, PumpSummary, SyntheticConfig};
use tailtrace::report::{
    display_loss, display_output_event, display_pump_summary, display_snapshot, display_summary,
};
use tailtrace::transport::RingTransport;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

type PumpFuture = Pin<Box<dyn Future<Output = Result<Option<PumpSummary>>>>>;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.downcast_ref::<ConfigError>().is_some()) {
        return EXIT_USAGE;
    }
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let config = AgentConfig::from_args(&args)?;
    let kind = config.source.kind;

    // The kernel pump feeds a single lane
    let lane_count = match kind {
        SourceKind::Synthetic => config.transport.lanes,
        SourceKind::Ebpf => 1,
    };

    if !quiet {
        println!("tailtrace v{}", env!("CARGO_PKG_VERSION"));
        println!("source: {}", kind.as_str());
        println!("lanes: {lane_count} x {}", config.transport.capacity);
        println!("tail call cap: {}", config.dispatch.max_tail_calls);
    }

    // ── Transport, aggregation, dispatch ────────────────────────────────
    let mut transport = RingTransport::new(config.codec()?);
    let lanes = (0..lane_count)
        .map(|id| transport.open(LaneId(id), config.transport.capacity))
        .collect::<Result<Vec<_>, _>>()?;

    let aggregation = Arc::new(AggregationTable::new());
    let (output_tx, output_rx) = bounded(config.report.output_capacity);
    let env = HandlerEnv::new(Arc::clone(&aggregation)).with_output(OutputSink::new(output_tx));
    let table = config.dispatch_table()?;
    info!("Dispatch table: {} opcodes bound", table.bound_opcodes().len());

    let consumer_shutdown = transport.shutdown_handle();
    let producer_shutdown = transport.shutdown_handle();

    // ── Producers ───────────────────────────────────────────────────────
    let mut synthetic_handles = Vec::new();
    let mut pump_running = false;
    let mut pump: PumpFuture = match kind {
        SourceKind::Synthetic => {
            let synthetic = SyntheticConfig { rate: config.source.rate, seed: None };
            synthetic_handles = spawn_synthetic(&lanes, synthetic, &producer_shutdown);
            Box::pin(async { Ok(None) })
        }
        SourceKind::Ebpf => {
            let object = config.source.object.as_deref().ok_or_else(|| {
                ConfigError::SourceRequirement {
                    source_kind: kind.as_str(),
                    requirement: "--object <FILE>".to_string(),
                }
            })?;
            let mut source = EbpfSource::load(object)?;
            source.seed_greetings(&config.greetings()?)?;
            source.attach_execve(&config.source.kprobe)?;
            if config.source.all_syscalls {
                source.attach_sys_enter()?;
            }
            pump_running = true;
            let lane = Arc::clone(&lanes[0]);
            let shutdown = producer_shutdown.clone();
            Box::pin(async move { source.pump(lane, shutdown).await.map(Some) })
        }
    };

    // ── Consumer and output printer ─────────────────────────────────────
    let mut poll_loop = PollLoop::new(transport, table, env)
        .idle_timeout(config.idle_timeout())
        .on_loss(move |lane, dropped| {
            warn!("{lane}: lost {dropped} records");
            if !quiet {
                display_loss(lane, dropped);
            }
        });

    let consumer_stop = consumer_shutdown.clone();
    let consumer = std::thread::spawn(move || {
        poll_loop.run(&consumer_stop);
        let stats = poll_loop.drain();
        let output_dropped = poll_loop.env().output().map_or(0, OutputSink::dropped);
        let lane_drops = poll_loop.transport().dropped_total();
        (stats, output_dropped, lane_drops)
    });

    let printer = std::thread::spawn(move || {
        for event in output_rx {
            if !quiet {
                display_output_event(&event);
            }
        }
    });

    // ── Main loop: periodic report until Ctrl+C or duration ─────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut report_timer = tokio::time::interval(config.report_interval());
    report_timer.tick().await;

    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration);
    let duration_limited = args.duration > 0;

    let mut exit_reason = "interrupted";
    let mut pump_result = None;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                break;
            }
            () = tokio::time::sleep_until(deadline), if duration_limited => {
                exit_reason = "duration limit reached";
                break;
            }
            result = &mut pump, if pump_running => {
                pump_result = Some(result);
                exit_reason = "source stopped";
                break;
            }
            _ = report_timer.tick() => {
                if !quiet {
                    display_snapshot(&aggregation.snapshot());
                }
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────
    producer_shutdown.trigger();
    let pump_result = match pump_result {
        Some(result) => result,
        None => pump.await,
    };
    for handle in synthetic_handles {
        handle.join().map_err(|_| anyhow!("synthetic producer thread panicked"))?;
    }

    consumer_shutdown.trigger();
    let (stats, output_dropped, lane_drops) =
        consumer.join().map_err(|_| anyhow!("consumer thread panicked"))?;
    printer.join().map_err(|_| anyhow!("output printer thread panicked"))?;

    let pump_summary = pump_result?;

    display_snapshot(&aggregation.snapshot());
    display_summary(exit_reason, start.elapsed(), &stats, lane_drops);
    if output_dropped > 0 {
        eprintln!("output: {output_dropped} events dropped (printer fell behind)");
    }
    if let Some(summary) = pump_summary {
        display_pump_summary(&summary);
    }

    Ok(())
}
