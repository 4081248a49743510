//! Progress bars and summaries for the command line.

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::events::JobEvent;
use crate::file::FileInfo;
use crate::stats::{JobReport, format_bytes, format_duration};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╌")
}

/// Creates the bar of one file, measured in percent.
fn make_file_bar(name: &str) -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(style("{spinner:.cyan} [{bar:40.cyan/blue}] {pos:>3}% - {msg}"));
    bar.set_message(name.to_string());
    bar
}

/// Creates the bar counting finished files.
fn make_total_bar(files: u64) -> ProgressBar {
    let bar = ProgressBar::new(files);
    bar.set_style(style("Total [{bar:40.green/white}] {pos}/{len} files ({elapsed})"));
    bar
}

/// Renders [`JobEvent`]s as indicatif bars.
pub struct EventView {
    multi: MultiProgress,
    total: ProgressBar,
    bars: HashMap<u32, ProgressBar>,
}

impl EventView {
    /// Creates a view for a job of `files` files.
    #[must_use]
    pub fn new(files: usize) -> Self {
        let multi = MultiProgress::new();
        let total = multi.add(make_total_bar(files as u64));
        Self {
            multi,
            total,
            bars: HashMap::new(),
        }
    }

    fn bar(&mut self, index: u32, name: Option<&str>) -> &ProgressBar {
        let multi = &self.multi;
        let total = &self.total;
        self.bars.entry(index).or_insert_with(|| {
            let label = name.map_or_else(|| format!("file {index}"), str::to_string);
            multi.insert_before(total, make_file_bar(&label))
        })
    }

    fn println(&self, line: impl AsRef<str>) {
        let _ = self.multi.println(line);
    }

    /// Applies one event.
    pub fn apply(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Progress {
                index,
                name,
                percentage,
                ..
            } => {
                let bar = self.bar(*index, name.as_deref()).clone();
                bar.set_position(u64::from(*percentage));
                if *percentage >= 100 {
                    bar.finish_and_clear();
                    self.bars.remove(index);
                    self.total.inc(1);
                }
            }
            JobEvent::Error { index, message } => {
                if let Some(bar) = self.bars.remove(index) {
                    bar.abandon_with_message(format!("failed: {message}"));
                }
                self.total.inc(1);
                self.println(format!("  ✗ file {index}: {message}"));
            }
            JobEvent::Warn { message } => self.println(format!("  ! {message}")),
            JobEvent::Info { message } => self.println(format!("  {message}")),
            JobEvent::ZipProgress {
                stage,
                message,
                path,
                failed,
            } => {
                let mut line = format!("  [{}]", stage.as_deref().unwrap_or("zip"));
                if let Some(message) = message {
                    line.push(' ');
                    line.push_str(message);
                }
                if let Some(path) = path {
                    line.push_str(&format!(" → {path}"));
                }
                if let Some(failed) = failed.filter(|n| *n > 0) {
                    line.push_str(&format!(" ({failed} failed)"));
                }
                self.println(line);
            }
            JobEvent::Finished | JobEvent::Cancelled => {
                for (_, bar) in self.bars.drain() {
                    bar.finish_and_clear();
                }
            }
        }
    }

    /// Renders events until the bus closes.
    pub async fn drive(mut self, mut events: mpsc::UnboundedReceiver<JobEvent>) {
        while let Some(event) = events.recv().await {
            self.apply(&event);
        }
        self.total.finish_and_clear();
        let _ = self.multi.clear();
    }
}

/// Prints the files a job is about to transfer.
pub fn print_file_list(files: &[FileInfo]) {
    if files.is_empty() {
        println!("No attachments found.");
        return;
    }
    let total: u64 = files.iter().map(|f| f.size).sum();

    println!("\n{SEPARATOR}");
    println!("Attachments:");
    println!("{SEPARATOR}");
    for file in files {
        println!("  {:>5}  {} ({})", file.order, file.name, format_bytes(file.size));
    }
    println!("{SEPARATOR}");
    println!("  {} file(s), {} total", files.len(), format_bytes(total));
    println!("{SEPARATOR}\n");
}

/// Prints the final report.
pub fn print_report(report: &JobReport) {
    println!("\n{SEPARATOR}");
    println!("Job Summary: {}", report.job_name);
    println!("{SEPARATOR}");
    println!("  Saved:             {}/{}", report.succeeded, report.total);
    if report.failed > 0 {
        println!("  Failed:            {}", report.failed);
        for (kind, count) in &report.failures_by_type {
            println!("    {kind:<16} {count}");
        }
    }
    if report.bytes > 0 {
        println!("  Total size:        {}", format_bytes(report.bytes));
        println!(
            "  Average speed:     {}/s",
            format_bytes(report.average_speed())
        );
    }
    println!("  Total time:        {}", format_duration(report.elapsed));
    for archive in &report.archives {
        println!("  Archive:           {}", archive.display());
    }
    if report.oversized > 0 {
        println!("  Saved separately:  {} (over archive cap)", report.oversized);
    }
    if let Some(version) = &report.agent_version {
        println!("  Agent version:     {version}");
    }
    if report.refreshed > 0 {
        println!("  URL refreshes:     {}", report.refreshed);
    }
    if report.cancelled {
        println!("  Cancelled before completion");
    }
    println!("{SEPARATOR}");
}
