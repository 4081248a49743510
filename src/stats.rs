//! Job totals and human-readable formatting.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::agent::AgentSummary;
use crate::config::DeliveryChannel;
use crate::failure::ErrorType;
use crate::transfer::TransferSummary;

/// Final report of one job run.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// Job name from the configuration.
    pub job_name: String,
    /// Channel the files went through.
    pub channel: DeliveryChannel,
    /// Files enumerated.
    pub total: usize,
    /// Files saved.
    pub succeeded: usize,
    /// Files that failed after retries.
    pub failed: usize,
    /// Bytes written locally (direct channel only).
    pub bytes: u64,
    /// Archives produced, in packing order.
    pub archives: Vec<PathBuf>,
    /// Files too large for any archive, saved individually.
    pub oversized: usize,
    /// URL refreshes served to the agent.
    pub refreshed: usize,
    /// Version reported by the agent.
    pub agent_version: Option<String>,
    /// Outstanding failures grouped by class.
    pub failures_by_type: BTreeMap<ErrorType, usize>,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl JobReport {
    /// Bytes per second over the whole run.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 / secs) as u64
        } else {
            0
        }
    }

    /// True when nothing failed and the run was not cancelled.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// One-line summary for logs and the CLI.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{}: {}/{} saved, {} failed in {}",
            self.job_name,
            self.succeeded,
            self.total,
            self.failed,
            format_duration(self.elapsed)
        );
        if self.bytes > 0 {
            line.push_str(&format!(
                " ({}, {}/s)",
                format_bytes(self.bytes),
                format_bytes(self.average_speed())
            ));
        }
        if self.cancelled {
            line.push_str(" [cancelled]");
        }
        line
    }
}

/// Accumulates a [`JobReport`] while a job runs.
#[derive(Debug)]
pub struct JobReportBuilder {
    job_name: String,
    channel: DeliveryChannel,
    total: usize,
    succeeded: usize,
    failed: usize,
    bytes: u64,
    archives: Vec<PathBuf>,
    oversized: usize,
    refreshed: usize,
    agent_version: Option<String>,
    failures_by_type: BTreeMap<ErrorType, usize>,
    cancelled: bool,
    started: Instant,
}

impl JobReportBuilder {
    /// Starts timing a job of `total` files.
    #[must_use]
    pub fn new(job_name: impl Into<String>, channel: DeliveryChannel, total: usize) -> Self {
        Self {
            job_name: job_name.into(),
            channel,
            total,
            succeeded: 0,
            failed: 0,
            bytes: 0,
            archives: Vec::new(),
            oversized: 0,
            refreshed: 0,
            agent_version: None,
            failures_by_type: BTreeMap::new(),
            cancelled: false,
            started: Instant::now(),
        }
    }

    /// Adds the outcome of a direct transfer pass.
    pub fn add_transfer(&mut self, summary: &TransferSummary) {
        self.succeeded += summary.succeeded;
        self.failed += summary.failed;
        self.bytes += summary.bytes;
        self.archives.extend(summary.archives.iter().cloned());
        self.oversized += summary.oversized;
        self.cancelled |= summary.cancelled;
    }

    /// Adds the outcome of an agent session.
    pub fn add_agent(&mut self, summary: &AgentSummary) {
        self.succeeded += summary.succeeded;
        self.failed += summary.failed;
        self.refreshed += summary.refreshed;
        if summary.agent_version.is_some() {
            self.agent_version.clone_from(&summary.agent_version);
        }
    }

    /// Replaces the failure breakdown.
    pub fn set_failures(&mut self, by_type: BTreeMap<ErrorType, usize>) {
        self.failures_by_type = by_type;
    }

    /// Marks the run cancelled.
    pub const fn set_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Finishes the report.
    #[must_use]
    pub fn build(self) -> JobReport {
        JobReport {
            job_name: self.job_name,
            channel: self.channel,
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            bytes: self.bytes,
            archives: self.archives,
            oversized: self.oversized,
            refreshed: self.refreshed,
            agent_version: self.agent_version,
            failures_by_type: self.failures_by_type,
            elapsed: self.started.elapsed(),
            cancelled: self.cancelled,
        }
    }
}

/// Formats a byte count with binary units (B, KB, MB, GB).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 3] = [("GB", 1 << 30), ("MB", 1 << 20), ("KB", 1 << 10)];

    UNITS
        .iter()
        .find(|(_, scale)| bytes >= *scale)
        .map_or_else(
            || format!("{bytes} B"),
            |(unit, scale)| format!("{:.2} {unit}", bytes as f64 / *scale as f64),
        )
}

/// Formats a duration as `4.2s`, `3m 07s` or `2h 03m 07s`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..60 => format!("{secs}.{}s", d.subsec_millis() / 100),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(succeeded: usize, failed: usize, bytes: u64) -> TransferSummary {
        TransferSummary {
            succeeded,
            failed,
            bytes,
            archives: vec![PathBuf::from("out/photos.zip")],
            oversized: 1,
            cancelled: false,
        }
    }

    #[test]
    fn builder_sums_passes() {
        let mut builder = JobReportBuilder::new("photos", DeliveryChannel::Direct, 10);
        builder.add_transfer(&transfer(7, 3, 700));
        builder.add_transfer(&transfer(2, 0, 200));
        let report = builder.build();
        assert_eq!(report.succeeded, 9);
        assert_eq!(report.failed, 3);
        assert_eq!(report.bytes, 900);
        assert_eq!(report.archives.len(), 2);
        assert_eq!(report.oversized, 2);
        assert!(!report.is_clean());
    }

    #[test]
    fn agent_summary_keeps_version() {
        let mut builder = JobReportBuilder::new("photos", DeliveryChannel::AgentToken, 3);
        builder.add_agent(&AgentSummary {
            pushed: 3,
            succeeded: 3,
            failed: 0,
            refreshed: 2,
            agent_version: Some("2.0.1".into()),
        });
        let report = builder.build();
        assert_eq!(report.agent_version.as_deref(), Some("2.0.1"));
        assert_eq!(report.refreshed, 2);
        assert!(report.is_clean());
    }

    #[test]
    fn cancelled_report_is_not_clean() {
        let mut builder = JobReportBuilder::new("photos", DeliveryChannel::Direct, 1);
        builder.set_cancelled();
        let report = builder.build();
        assert!(!report.is_clean());
        assert!(report.summary_line().ends_with("[cancelled]"));
    }

    #[test]
    fn average_speed_handles_zero_elapsed() {
        let mut report = JobReportBuilder::new("j", DeliveryChannel::Direct, 1).build();
        report.bytes = 1000;
        report.elapsed = Duration::ZERO;
        assert_eq!(report.average_speed(), 0);
        report.elapsed = Duration::from_secs(4);
        assert_eq!(report.average_speed(), 250);
    }

    #[test]
    fn bytes_pick_the_largest_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(format_bytes(1_288_490_189), "1.20 GB");
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_millis(4200)), "4.2s");
        assert_eq!(format_duration(Duration::from_secs(187)), "3m 07s");
        assert_eq!(format_duration(Duration::from_secs(7387)), "2h 03m 07s");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn format_bytes_has_a_unit(bytes in any::<u64>()) {
                let text = format_bytes(bytes);
                prop_assert!(text.ends_with('B'));
            }

            #[test]
            fn format_duration_never_panics(millis in 0u64..10_000_000_000) {
                let _ = format_duration(Duration::from_millis(millis));
            }
        }
    }
}
