//! Job orchestration.
//!
//! A [`Job`] enumerates the selected attachments, hands them to the
//! configured delivery channel and reports the outcome on its event bus.
//! Failures recorded during a run can be retried afterwards through the
//! direct channel with [`Job::retry_failed`].

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentSession;
use crate::config::{DeliveryChannel, JobConfig};
use crate::error::{Error, Result};
use crate::events::{EventBus, JobEvent};
use crate::failure::{ErrorType, FailureRecorder};
use crate::file::{FileInfo, enumerate_files};
use crate::fs::{FileSystem, TokioFileSystem};
use crate::resolve::Resolver;
use crate::stats::{JobReport, JobReportBuilder};
use crate::table::HostTable;
use crate::transfer::DirectBackend;

#[derive(Default)]
struct JobState {
    files: Vec<FileInfo>,
    resolver: Option<Arc<Resolver>>,
}

/// One download job.
pub struct Job {
    config: JobConfig,
    table: Arc<dyn HostTable>,
    fs: Arc<dyn FileSystem>,
    bus: EventBus,
    cancel: CancellationToken,
    failures: Arc<Mutex<FailureRecorder>>,
    state: Mutex<JobState>,
}

impl Job {
    /// Creates a job over `table`.
    #[must_use]
    pub fn new(config: JobConfig, table: Arc<dyn HostTable>) -> Self {
        Self {
            config,
            table,
            fs: Arc::new(TokioFileSystem::new()),
            bus: EventBus::new(),
            cancel: CancellationToken::new(),
            failures: Arc::new(Mutex::new(FailureRecorder::new())),
            state: Mutex::new(JobState::default()),
        }
    }

    /// Replaces the file system used by the direct channel.
    #[must_use]
    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// The job configuration.
    #[must_use]
    pub const fn config(&self) -> &JobConfig {
        &self.config
    }

    /// The event bus the job publishes on.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribes to job events.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.bus.subscribe()
    }

    /// Token that cancels this job when triggered.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests cooperative cancellation. Files already in flight finish;
    /// nothing new starts.
    pub fn cancel(&self) {
        log::info!("Cancelling {}", self.config.job_name);
        self.cancel.cancel();
    }

    fn failures(&self) -> MutexGuard<'_, FailureRecorder> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Orders of files that currently have a failure record.
    #[must_use]
    pub fn failed_orders(&self) -> Vec<u32> {
        self.failures().orders()
    }

    /// Outstanding failures grouped by class.
    #[must_use]
    pub fn failure_breakdown(&self) -> BTreeMap<ErrorType, usize> {
        self.failures().counts_by_type()
    }

    /// Lists the files the job would transfer, without transferring.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the host table
    /// rejects a listing request.
    pub async fn enumerate(&self) -> Result<Vec<FileInfo>> {
        self.config.validate()?;
        enumerate_files(self.table.as_ref(), &self.config).await
    }

    /// Runs the job to completion and emits `finished`, `cancelled`, or a
    /// single `warn` for a fatal error.
    ///
    /// # Errors
    ///
    /// Returns configuration, enumeration and job-fatal channel errors, and
    /// [`Error::Cancelled`] if an agent session was cancelled. Per-file
    /// failures are reported in the [`JobReport`] instead.
    pub async fn run(&self) -> Result<JobReport> {
        let result = self.execute().await;
        self.finish(result)
    }

    async fn execute(&self) -> Result<JobReport> {
        let files = self.enumerate().await?;
        let channel = self.config.channel;
        log::info!(
            "{}: {} attachment(s) via {channel:?}",
            self.config.job_name,
            files.len()
        );
        self.bus
            .emit(JobEvent::info(format!("Found {} attachment(s)", files.len())));

        let resolver = Arc::new(Resolver::new(
            Arc::clone(&self.table),
            self.config.naming.clone(),
            self.config.folders.clone(),
        ));
        {
            let mut state = self.state();
            state.files.clone_from(&files);
            state.resolver = Some(Arc::clone(&resolver));
        }

        let mut report = JobReportBuilder::new(&self.config.job_name, channel, files.len());
        if channel.is_agent() {
            let session = AgentSession::new(
                &self.config,
                Arc::clone(&self.table),
                Arc::clone(&self.failures),
                self.bus.clone(),
            );
            let summary = session.run(files, &resolver, &self.cancel).await?;
            report.add_agent(&summary);
        } else {
            let summary = self
                .direct_backend()?
                .run(files, &resolver, &self.cancel)
                .await?;
            report.add_transfer(&summary);
        }
        Ok(self.close_report(report))
    }

    /// Re-runs the files that have failure records through the direct
    /// channel, reusing the names the first run assigned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the job has not run yet, or a fatal
    /// error from the direct channel.
    pub async fn retry_failed(&self) -> Result<JobReport> {
        let result = self.retry().await;
        self.finish(result)
    }

    async fn retry(&self) -> Result<JobReport> {
        let failed: HashSet<u32> = self.failed_orders().into_iter().collect();
        let (files, resolver) = {
            let state = self.state();
            let files: Vec<FileInfo> = state
                .files
                .iter()
                .filter(|f| failed.contains(&f.order))
                .cloned()
                .collect();
            (files, state.resolver.clone())
        };
        let Some(resolver) = resolver else {
            return Err(Error::Config("nothing to retry before the job has run".into()));
        };

        log::info!("Retrying {} failed file(s)", files.len());
        let mut report =
            JobReportBuilder::new(&self.config.job_name, DeliveryChannel::Direct, files.len());
        if !files.is_empty() {
            let summary = self
                .direct_backend()?
                .run(files, &resolver, &self.cancel)
                .await?;
            report.add_transfer(&summary);
        }
        Ok(self.close_report(report))
    }

    fn direct_backend(&self) -> Result<DirectBackend> {
        let backend = DirectBackend::new(
            &self.config,
            Arc::clone(&self.table),
            Arc::clone(&self.failures),
            self.bus.clone(),
        )?;
        Ok(backend.with_fs(Arc::clone(&self.fs)))
    }

    fn close_report(&self, mut report: JobReportBuilder) -> JobReport {
        report.set_failures(self.failure_breakdown());
        if self.cancel.is_cancelled() {
            report.set_cancelled();
        }
        report.build()
    }

    fn finish(&self, result: Result<JobReport>) -> Result<JobReport> {
        match &result {
            Ok(report) if report.cancelled => {
                log::warn!("{}", report.summary_line());
                self.bus.emit(JobEvent::Cancelled);
            }
            Ok(report) => {
                log::info!("{}", report.summary_line());
                self.bus.emit(JobEvent::Finished);
            }
            Err(Error::Cancelled) => {
                log::warn!("{} cancelled", self.config.job_name);
                self.bus.emit(JobEvent::Cancelled);
            }
            Err(err) => {
                log::error!("{} failed: {err}", self.config.job_name);
                self.bus.emit(JobEvent::warn(err.to_string()));
            }
        }
        result
    }
}
