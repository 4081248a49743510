//! Direct-transfer backend.
//!
//! Mints (or reuses) a temporary URL per file, streams the bytes to a
//! `.part` file and then either renames it into place or copies it into a
//! size-capped zip archive. Per-file failures are retried, then recorded;
//! they never abort the job.

mod archive;
mod plan;

pub use archive::ArchiveSink;
pub use plan::{ArchivePlan, archive_name, plan_archives};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::{JobConfig, PackingMode, TransferConfig};
use crate::error::{Error, Result};
use crate::events::{EventBus, JobEvent};
use crate::failure::{ErrorType, FailureRecorder, TransferError, classify, should_refresh_url};
use crate::file::{AttachmentKey, FileInfo};
use crate::fs::{FileSystem, TokioFileSystem, next_free_path, part_path};
use crate::resolve::{Resolver, sanitize_component};
use crate::scheduler::run_pool;
use crate::table::HostTable;
use crate::throttle::ProgressThrottler;

/// Mint attempts per URL before giving up on a timeout.
const MINT_ATTEMPTS: u32 = 3;

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileOutcome {
    Saved(u64),
    Failed,
    Skipped,
}

/// Totals of one direct-channel run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Files written into an archive or saved individually.
    pub succeeded: usize,
    /// Files that ended with a failure record.
    pub failed: usize,
    /// Payload bytes written.
    pub bytes: u64,
    /// Archives written, in order.
    pub archives: Vec<PathBuf>,
    /// Files routed to individual save because they exceed the archive cap.
    pub oversized: usize,
    /// The run stopped early because of cancellation.
    pub cancelled: bool,
}

impl TransferSummary {
    fn add(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Saved(bytes) => {
                self.succeeded += 1;
                self.bytes += bytes;
            }
            FileOutcome::Failed => self.failed += 1,
            FileOutcome::Skipped => {}
        }
    }
}

/// Transfers files in-process.
pub struct DirectBackend {
    table: Arc<dyn HostTable>,
    http: reqwest::Client,
    fs: Arc<dyn FileSystem>,
    settings: TransferConfig,
    job_name: String,
    packing: PackingMode,
    failures: Arc<Mutex<FailureRecorder>>,
    progress: Mutex<ProgressThrottler>,
    bus: EventBus,
}

impl DirectBackend {
    /// Creates a backend writing through `tokio::fs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        config: &JobConfig,
        table: Arc<dyn HostTable>,
        failures: Arc<Mutex<FailureRecorder>>,
        bus: EventBus,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.transfer.request_timeout_secs))
            .build()?;
        let progress = ProgressThrottler::new(bus.clone(), config.transfer.progress_interval());
        Ok(Self {
            table,
            http,
            fs: Arc::new(TokioFileSystem::new()),
            settings: config.transfer.clone(),
            job_name: config.job_name.clone(),
            packing: config.packing,
            failures,
            progress: Mutex::new(progress),
            bus,
        })
    }

    /// Replaces the file system used for saves.
    #[must_use]
    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    fn report_progress(&self, file: &FileInfo, percentage: u8) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update(file.order, Some(file.name.clone()), Some(file.size), percentage);
    }

    fn record(&self, file: &FileInfo, error: TransferError, attempts: u32) {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .discard(file.order);
        let message = error.to_string();
        let error_type = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_failure(file.order, error, attempts);
        log::warn!("{} failed ({error_type}): {message}", file.name);
        self.bus.emit(JobEvent::Error {
            index: file.order,
            message,
        });
    }

    fn resolve_failure(&self, order: u32) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(order);
    }

    /// Streams the body of `url` into `part`, reporting 0-99% as bytes
    /// arrive. Returns the number of bytes written.
    async fn fetch(
        &self,
        file: &FileInfo,
        url: &str,
        part: &Path,
    ) -> std::result::Result<u64, TransferError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::http(
                status.as_u16(),
                status.canonical_reason().unwrap_or_default(),
            ));
        }
        let total = response
            .content_length()
            .filter(|&len| len > 0)
            .unwrap_or(file.size);
        let mut out = self.fs.create_file(part).await?;
        let mut received = 0u64;
        let mut stream = response.bytes_stream();
        self.report_progress(file, 0);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            received += chunk.len() as u64;
            self.report_progress(file, streaming_percentage(received, total));
        }
        out.flush().await?;
        Ok(received)
    }

    fn check_integrity(&self, file: &FileInfo, received: u64) -> std::result::Result<(), TransferError> {
        match self.settings.integrity_tolerance {
            Some(tolerance) if file.size > 0 && file.size.abs_diff(received) > tolerance => {
                Err(TransferError::size_mismatch(file.size, received))
            }
            _ => Ok(()),
        }
    }

    /// One attempt: mint if no URL is cached, fetch into `part`, verify.
    async fn attempt(&self, file: &mut FileInfo, part: &Path) -> std::result::Result<u64, TransferError> {
        let url = match &file.file_url {
            Some(url) => url.clone(),
            None => {
                let url = self.table.mint_url(&file.key).await?;
                file.file_url = Some(url.clone());
                url
            }
        };
        let received = self.fetch(file, &url, part).await?;
        self.check_integrity(file, received)?;
        Ok(received)
    }

    /// Runs the attempt budget for one file. Mints, fetches and integrity
    /// checks all draw on the same budget. Returns the byte count left in
    /// `part`, or `None` after recording a failure or when cancelled
    /// between attempts; `part` is removed in both cases.
    async fn transfer(&self, file: &mut FileInfo, part: &Path, cancel: &CancellationToken) -> Option<u64> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(file, part).await {
                Ok(received) => {
                    self.resolve_failure(file.order);
                    return Some(received);
                }
                Err(err) => {
                    let error_type = classify(&err);
                    if should_refresh_url(error_type, err.status) {
                        file.file_url = None;
                    }
                    if attempt >= max_attempts {
                        self.discard(part).await;
                        self.record(file, err, attempt);
                        return None;
                    }
                    log::debug!(
                        "{} attempt {attempt}/{max_attempts} failed ({error_type}): {err}",
                        file.name
                    );
                    tokio::time::sleep(self.settings.backoff(attempt)).await;
                    if cancel.is_cancelled() {
                        self.discard(part).await;
                        return None;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn discard(&self, part: &Path) {
        if self.fs.file_exists(part).await
            && let Err(err) = self.fs.remove_file(part).await
        {
            log::debug!("Could not remove {}: {err}", part.display());
        }
    }

    /// Prepares the file's name and path, recording a failure if a cell
    /// read fails.
    async fn prepare(&self, resolver: &Resolver, file: &mut FileInfo) -> bool {
        match resolver.prepare(file).await {
            Ok(()) => true,
            Err(err) => {
                self.record(file, TransferError::new(err.to_string()), 0);
                false
            }
        }
    }

    /// Picks a free destination for `file` and claims it with an empty
    /// part file, so concurrent saves and existing files are never
    /// overwritten.
    async fn reserve(&self, file: &FileInfo) -> std::io::Result<PathBuf> {
        let dir = self.settings.output_dir.join(&file.path);
        self.fs.create_dir_all(&dir).await?;
        let target = next_free_path(self.fs.as_ref(), &dir, &file.name).await;
        self.fs.create_file(&part_path(&target)).await?;
        Ok(target)
    }

    /// Renames a verified part file to its destination.
    async fn promote(&self, file: &FileInfo, part: &Path, target: &Path, len: u64) -> FileOutcome {
        match self.fs.rename_file(part, target).await {
            Ok(()) => {
                self.report_progress(file, 100);
                log::debug!("Saved {}", target.display());
                FileOutcome::Saved(len)
            }
            Err(err) => {
                self.discard(part).await;
                self.record(file, TransferError::from(err), 1);
                FileOutcome::Failed
            }
        }
    }

    async fn save_individual(
        &self,
        mut file: FileInfo,
        resolver: &Resolver,
        cancel: &CancellationToken,
    ) -> FileOutcome {
        if !self.prepare(resolver, &mut file).await {
            return FileOutcome::Failed;
        }
        let target = match self.reserve(&file).await {
            Ok(target) => target,
            Err(err) => {
                self.record(&file, TransferError::from(err), 0);
                return FileOutcome::Failed;
            }
        };
        let part = part_path(&target);
        match self.transfer(&mut file, &part, cancel).await {
            Some(len) => self.promote(&file, &part, &target, len).await,
            None => stopped(cancel),
        }
    }

    async fn save_all_individually(
        &self,
        files: Vec<FileInfo>,
        resolver: &Resolver,
        cancel: &CancellationToken,
        summary: &mut TransferSummary,
    ) {
        let outcome = run_pool(files, self.settings.concurrency, cancel, |file| {
            self.save_individual(file, resolver, cancel)
        })
        .await;
        summary.cancelled |= outcome.was_cancelled();
        for result in &outcome.results {
            summary.add(result);
        }
    }

    /// Where a zip-mode file is staged before it is copied into the archive.
    fn staging_path(&self, file: &FileInfo) -> PathBuf {
        self.settings.output_dir.join(format!(
            ".{}-{}.part",
            sanitize_component(&self.job_name),
            file.order
        ))
    }

    /// Fetches one file and copies it into the archive. A file whose real
    /// size no longer fits is saved individually right away.
    async fn pack_file(
        &self,
        mut file: FileInfo,
        sink: &Arc<Mutex<ArchiveSink>>,
        resolver: &Resolver,
        cancel: &CancellationToken,
    ) -> FileOutcome {
        if !self.prepare(resolver, &mut file).await {
            return FileOutcome::Failed;
        }
        let staged = self.staging_path(&file);
        let Some(len) = self.transfer(&mut file, &staged, cancel).await else {
            return stopped(cancel);
        };
        match append(sink, file.relative_path(), staged.clone(), len).await {
            Ok(true) => {
                self.discard(&staged).await;
                self.report_progress(&file, 100);
                FileOutcome::Saved(len)
            }
            Ok(false) => {
                log::info!("{} does not fit in the archive; saving individually", file.name);
                let dir = self.settings.output_dir.join(&file.path);
                if let Err(err) = self.fs.create_dir_all(&dir).await {
                    self.discard(&staged).await;
                    self.record(&file, TransferError::from(err), 1);
                    return FileOutcome::Failed;
                }
                let target = next_free_path(self.fs.as_ref(), &dir, &file.name).await;
                self.promote(&file, &staged, &target, len).await
            }
            Err(err) => {
                self.discard(&staged).await;
                let error = TransferError::new(format!("filesystem error: {err}")).with_code("EIO");
                self.record(&file, error, 1);
                FileOutcome::Failed
            }
        }
    }

    /// Writes one planned archive.
    async fn pack_archive(
        &self,
        files: Vec<FileInfo>,
        resolver: &Resolver,
        cancel: &CancellationToken,
        summary: &mut TransferSummary,
    ) -> Result<()> {
        let path = next_free_path(
            self.fs.as_ref(),
            &self.settings.output_dir,
            &archive_name(&self.job_name),
        )
        .await;
        let file = self.fs.create_archive(&path).await?;
        let sink = Arc::new(Mutex::new(ArchiveSink::new(
            path.clone(),
            file,
            self.settings.archive_cap,
        )));

        let outcome = run_pool(files, self.settings.zip_concurrency, cancel, |file| {
            self.pack_file(file, &sink, resolver, cancel)
        })
        .await;
        summary.cancelled |= outcome.was_cancelled();
        for result in &outcome.results {
            summary.add(result);
        }

        let sink = Arc::into_inner(sink)
            .ok_or_else(|| Error::Io(std::io::Error::other("archive writer still in use")))?
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        if sink.entries() == 0 {
            drop(sink);
            self.fs.remove_file(&path).await?;
            return Ok(());
        }
        let path = tokio::task::spawn_blocking(move || sink.finish())
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err)))??;
        self.bus.emit(JobEvent::ZipProgress {
            stage: Some(crate::agent::message::stage::ZIP.into()),
            message: Some("archive written".into()),
            path: Some(path.display().to_string()),
            failed: None,
        });
        log::info!("Wrote archive {}", path.display());
        summary.archives.push(path);
        Ok(())
    }

    async fn run_zip(
        &self,
        files: Vec<FileInfo>,
        resolver: &Resolver,
        cancel: &CancellationToken,
        summary: &mut TransferSummary,
    ) -> Result<()> {
        let cap = self.settings.archive_cap;
        let plan = plan_archives(files, cap);
        if let Some(warning) = plan.warning(cap) {
            log::warn!("{warning}");
            self.bus.emit(JobEvent::warn(warning));
        }
        summary.oversized = plan.oversized.len();

        for archive in plan.archives {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.pack_archive(archive, resolver, cancel, summary).await?;
        }
        if !cancel.is_cancelled() {
            self.save_all_individually(plan.oversized, resolver, cancel, summary)
                .await;
        }
        Ok(())
    }

    /// Transfers `files` according to the packing mode.
    ///
    /// # Errors
    ///
    /// Returns an error only if an archive file cannot be created or
    /// finalised. Per-file failures are recorded instead.
    pub async fn run(
        &self,
        files: Vec<FileInfo>,
        resolver: &Resolver,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary> {
        let mut summary = TransferSummary::default();
        if files.is_empty() {
            return Ok(summary);
        }
        log::info!("Transferring {} file(s) directly", files.len());
        match self.packing {
            PackingMode::Zip => self.run_zip(files, resolver, cancel, &mut summary).await?,
            PackingMode::Individual => {
                self.save_all_individually(files, resolver, cancel, &mut summary)
                    .await;
            }
        }
        summary.cancelled |= cancel.is_cancelled();
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
        Ok(summary)
    }
}

/// Mints a temporary URL for `key`. Up to three attempts; only
/// timeout-classified errors are retried, with linear backoff.
///
/// # Errors
///
/// Returns the last mint error.
pub async fn mint_with_retry(
    table: &dyn HostTable,
    key: &AttachmentKey,
    settings: &TransferConfig,
) -> std::result::Result<String, TransferError> {
    let mut attempt = 1;
    loop {
        match table.mint_url(key).await {
            Ok(url) => return Ok(url),
            Err(err) if attempt < MINT_ATTEMPTS && classify(&err) == ErrorType::Timeout => {
                log::debug!("Mint for {} timed out (attempt {attempt})", key.token);
                tokio::time::sleep(settings.backoff(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Outcome of a file whose transfer returned nothing.
fn stopped(cancel: &CancellationToken) -> FileOutcome {
    if cancel.is_cancelled() {
        FileOutcome::Skipped
    } else {
        FileOutcome::Failed
    }
}

/// Copies a staged file into the archive on the blocking pool, keeping
/// compression off the async workers.
async fn append(sink: &Arc<Mutex<ArchiveSink>>, entry: String, source: PathBuf, len: u64) -> Result<bool> {
    let sink = Arc::clone(sink);
    tokio::task::spawn_blocking(move || {
        let mut reader = std::fs::File::open(&source)?;
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(&entry, len, &mut reader)
    })
    .await
    .map_err(|err| Error::Io(std::io::Error::other(err)))?
}

/// Percentage while streaming; never reports 100 before verification.
#[allow(clippy::cast_possible_truncation)]
fn streaming_percentage(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (received.saturating_mul(100) / total).min(99) as u8
}
