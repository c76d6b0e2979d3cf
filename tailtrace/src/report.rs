//! Console output for counters, handler events, losses and the final summary.

use std::fmt::Write as _;
use std::time::Duration;

use crate::aggregation::Snapshot;
use crate::consumer::PollStats;
use crate::dispatch::OutputEvent;
use crate::domain::LaneId;
use crate::producer::PumpSummary;

/// One line with every counter, `ID <subject>: <count>` separated by tabs
#[must_use]
pub fn format_snapshot(snapshot: &Snapshot) -> String {
    let mut line = String::new();
    for (subject, count) in snapshot {
        let _ = write!(line, "ID {subject}: {count}\t");
    }
    line
}

/// Print the counter line, or nothing while the table is empty
pub fn display_snapshot(snapshot: &Snapshot) {
    if !snapshot.is_empty() {
        println!("{}", format_snapshot(snapshot));
    }
}

#[must_use]
pub fn format_output_event(event: &OutputEvent) -> String {
    format!("{} {} {} {}", event.process_id, event.subject_id, event.command, event.message)
}

pub fn display_output_event(event: &OutputEvent) {
    println!("{}", format_output_event(event));
}

pub fn display_loss(lane: LaneId, dropped: u64) {
    eprintln!("[LOSS] {lane} dropped={dropped}");
}

#[must_use]
pub fn format_summary(exit_reason: &str, elapsed: Duration, stats: &PollStats, lane_drops: u64) -> String {
    format!(
        "{}: {:.1}s, {} records (handled: {}, no_handler: {}, decode_failures: {}, loop_anomalies: {}, dropped: {})",
        exit_reason,
        elapsed.as_secs_f64(),
        stats.records,
        stats.handled,
        stats.no_handler,
        stats.decode_failures,
        stats.loop_anomalies,
        lane_drops,
    )
}

pub fn display_summary(exit_reason: &str, elapsed: Duration, stats: &PollStats, lane_drops: u64) {
    eprintln!("\n{}", format_summary(exit_reason, elapsed, stats, lane_drops));
}

pub fn display_pump_summary(summary: &PumpSummary) {
    let mut kernel = String::new();
    for (subject, count) in &summary.kernel_counts {
        let _ = write!(kernel, "ID {subject}: {count}\t");
    }
    eprintln!(
        "kernel: {} samples, {} ring drops{}{}",
        summary.samples,
        summary.kernel_drops,
        if kernel.is_empty() { "" } else { ", counters: " },
        kernel.trim_end(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationTable;

    #[test]
    fn test_format_snapshot() {
        let table = AggregationTable::new();
        for subject in [501, 0, 501] {
            table.increment(subject);
        }
        assert_eq!(format_snapshot(&table.snapshot()), "ID 0: 1\tID 501: 2\t");
        assert_eq!(format_snapshot(&AggregationTable::new().snapshot()), "");
    }

    #[test]
    fn test_format_output_event() {
        let event = OutputEvent {
            opcode: 59,
            subject_id: 501,
            process_id: 4242,
            command: "bash".into(),
            message: "Hi user 501!".into(),
        };
        assert_eq!(format_output_event(&event), "4242 501 bash Hi user 501!");
    }

    #[test]
    fn test_format_summary() {
        let stats = PollStats { records: 10, handled: 7, no_handler: 2, loop_anomalies: 1, ..PollStats::default() };
        let line = format_summary("interrupted", Duration::from_millis(1500), &stats, 4);
        assert_eq!(
            line,
            "interrupted: 1.5s, 10 records (handled: 7, no_handler: 2, decode_failures: 0, loop_anomalies: 1, dropped: 4)"
        );
    }
}
