//! One job's session with the local agent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::{DeliveryChannel, JobConfig, TransferConfig};
use crate::error::{Error, Result};
use crate::events::{EventBus, JobEvent};
use crate::failure::{FailureRecorder, TransferError};
use crate::file::FileInfo;
use crate::resolve::Resolver;
use crate::scheduler::run_pool;
use crate::singleflight::SingleFlight;
use crate::table::HostTable;
use crate::throttle::ProgressThrottler;
use crate::transfer::mint_with_retry;

use super::limiter::SlidingWindow;
use super::message::{
    AckData, AckStatus, ClientMessage, CompleteData, ConfigData, DownloadMode, LinkData, LinkItem,
    RefreshData, parse_agent_message, stage,
};
use super::outbound::{Outbound, spawn_writer};
use super::protocol::ProtocolGuard;
use super::version_at_least;

/// How long to wait for the writer to flush and close after the job ends.
const WRITER_SHUTDOWN: Duration = Duration::from_secs(5);

/// Totals of one agent session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSummary {
    /// Files pushed to the agent.
    pub pushed: usize,
    /// Files the agent reported as saved.
    pub succeeded: usize,
    /// Files the agent reported as failed.
    pub failed: usize,
    /// Refresh requests served.
    pub refreshed: usize,
    /// Version the agent reported, if any.
    pub agent_version: Option<String>,
}

#[derive(Debug, Default)]
struct ReaderTotals {
    succeeded: HashSet<u32>,
    failed: HashSet<u32>,
}

/// State shared by the sender, the reader and refresh tasks.
struct Shared {
    table: Arc<dyn HostTable>,
    transfer: TransferConfig,
    files: HashMap<u32, FileInfo>,
    failures: Arc<Mutex<FailureRecorder>>,
    bus: EventBus,
    outbound: Outbound,
    guard: Arc<Mutex<ProtocolGuard>>,
    refresh_flight: SingleFlight<u32, std::result::Result<String, String>>,
    refresh_permits: Option<Arc<Semaphore>>,
    backpressure: usize,
    cancel: CancellationToken,
    refreshed: AtomicUsize,
}

impl Shared {
    fn guard(&self) -> std::sync::MutexGuard<'_, ProtocolGuard> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new(
        session: &AgentSession<'_>,
        files: &[FileInfo],
        outbound: Outbound,
        guard: Arc<Mutex<ProtocolGuard>>,
        cancel: CancellationToken,
    ) -> Self {
        let agent = &session.config.agent;
        Self {
            table: Arc::clone(&session.table),
            transfer: session.config.transfer.clone(),
            files: files.iter().map(|f| (f.order, f.clone())).collect(),
            failures: Arc::clone(&session.failures),
            bus: session.bus.clone(),
            outbound,
            guard,
            refresh_flight: SingleFlight::new(),
            refresh_permits: agent.refresh_limit.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            backpressure: agent.backpressure_threshold,
            cancel,
            refreshed: AtomicUsize::new(0),
        }
    }

    /// Re-mints the URL of `order` and answers the agent. Concurrent
    /// requests for one order share a single mint, and only that mint
    /// holds a refresh permit.
    async fn serve_refresh(&self, order: u32) {
        let result = match self.files.get(&order) {
            Some(file) => {
                let table = Arc::clone(&self.table);
                let key = file.key.clone();
                let settings = self.transfer.clone();
                let permits = self.refresh_permits.clone();
                self.refresh_flight
                    .run(order, move || async move {
                        let _permit = match permits {
                            Some(permits) => Some(
                                permits
                                    .acquire_owned()
                                    .await
                                    .map_err(|err| err.to_string())?,
                            ),
                            None => None,
                        };
                        mint_with_retry(table.as_ref(), &key, &settings)
                            .await
                            .map_err(|err| err.to_string())
                    })
                    .await
            }
            None => Err(format!("unknown file order {order}")),
        };
        self.refreshed.fetch_add(1, Ordering::Relaxed);

        let data = match result {
            Ok(url) => RefreshData {
                order,
                download_url: Some(url),
                error: None,
            },
            Err(error) => {
                log::warn!("Refresh for file {order} failed: {error}");
                RefreshData {
                    order,
                    download_url: None,
                    error: Some(error),
                }
            }
        };
        if self
            .outbound
            .wait_for_drain(self.backpressure, &self.cancel)
            .await
            .is_err()
        {
            return;
        }
        if let Err(err) = self.outbound.send(&ClientMessage::Refresh(data)) {
            log::debug!("Dropping refresh answer for {order}: {err}");
        }
    }

    fn file_label(&self, order: u32) -> (Option<String>, Option<u64>) {
        self.files
            .get(&order)
            .map_or((None, None), |f| (Some(f.name.clone()), Some(f.size)))
    }

    /// Applies one ack. Returns true once the job is complete.
    fn handle_ack(
        self: &Arc<Self>,
        ack: AckData,
        throttler: &mut ProgressThrottler,
        totals: &mut ReaderTotals,
        refreshes: &mut JoinSet<()>,
        version: &watch::Sender<Option<String>>,
    ) -> Result<bool> {
        if self.guard().on_ack(&ack) {
            log::info!("Agent reported job complete");
            self.bus.emit(JobEvent::stage(stage::JOB_COMPLETE, ack.message()));
            return Ok(true);
        }
        match ack.status {
            AckStatus::Progress => {
                if let Some(order) = ack.order {
                    let (name, size) = self.file_label(order);
                    throttler.update(order, name, size, agent_percentage(ack.percentage));
                }
            }
            AckStatus::Success => match ack.stage.as_deref() {
                Some(stage::SERVER_INFO) => {
                    let reported = ack.version.clone();
                    log::info!("Agent version: {}", reported.as_deref().unwrap_or("unknown"));
                    version.send_replace(reported);
                }
                Some(stage::ZIP | stage::RETRY_FAILED_FILES) => {
                    self.bus.emit(JobEvent::ZipProgress {
                        stage: ack.stage.clone(),
                        message: ack.message.clone(),
                        path: ack.path.clone(),
                        failed: ack.failed,
                    });
                }
                _ => {
                    if let Some(order) = ack.order {
                        let (name, size) = self.file_label(order);
                        throttler.update(order, name, size, 100);
                        self.failures
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .resolve(order);
                        totals.failed.remove(&order);
                        totals.succeeded.insert(order);
                    } else if !ack.message().is_empty() {
                        self.bus.emit(JobEvent::info(ack.message()));
                    }
                }
            },
            AckStatus::Refresh => match ack.order {
                Some(order) => {
                    log::debug!("Agent asked to refresh file {order}");
                    let shared = Arc::clone(self);
                    refreshes.spawn(async move { shared.serve_refresh(order).await });
                }
                None => log::warn!("Refresh request without an order ignored"),
            },
            AckStatus::Error => {
                let Some(order) = ack.order else {
                    self.guard().fail();
                    return Err(Error::WebSocket(format!(
                        "agent reported an error: {}",
                        ack.message()
                    )));
                };
                throttler.discard(order);
                let message = ack.message().to_string();
                let error_type = self
                    .failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_failure(order, TransferError::new(message.clone()), 0);
                log::warn!("Agent failed file {order} ({error_type}): {message}");
                totals.succeeded.remove(&order);
                totals.failed.insert(order);
                self.bus.emit(JobEvent::Error {
                    index: order,
                    message,
                });
            }
            AckStatus::Unknown => log::debug!("Ignoring ack with unknown status"),
        }
        Ok(false)
    }
}

/// Maps an agent-reported percentage onto 0-99; 100 is reserved for the
/// file's success ack.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn agent_percentage(raw: Option<f64>) -> u8 {
    raw.unwrap_or(0.0).clamp(0.0, 99.0) as u8
}

async fn read_loop<S>(
    mut stream: S,
    shared: Arc<Shared>,
    version: watch::Sender<Option<String>>,
    interval: Duration,
) -> Result<ReaderTotals>
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut throttler = ProgressThrottler::new(shared.bus.clone(), interval);
    let mut totals = ReaderTotals::default();
    let mut refreshes = JoinSet::new();
    loop {
        while refreshes.try_join_next().is_some() {}
        let next = tokio::select! {
            () = shared.cancel.cancelled() => return Err(Error::Cancelled),
            next = stream.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                shared.guard().fail();
                return Err(err.into());
            }
            None => {
                shared.guard().on_close()?;
                return Ok(totals);
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                shared.guard().on_close()?;
                return Ok(totals);
            }
            _ => continue,
        };
        let ack = match parse_agent_message(text.as_str()) {
            Ok(Some(ack)) => ack,
            Ok(None) => continue,
            Err(err) => {
                log::warn!("Ignoring malformed agent message: {err}");
                continue;
            }
        };
        if shared.handle_ack(ack, &mut throttler, &mut totals, &mut refreshes, &version)? {
            return Ok(totals);
        }
    }
}

/// Pushes a job's files to the local agent and follows it to completion.
pub struct AgentSession<'a> {
    config: &'a JobConfig,
    table: Arc<dyn HostTable>,
    failures: Arc<Mutex<FailureRecorder>>,
    bus: EventBus,
}

impl<'a> AgentSession<'a> {
    /// Creates a session for `config`, which must use an agent channel.
    #[must_use]
    pub fn new(
        config: &'a JobConfig,
        table: Arc<dyn HostTable>,
        failures: Arc<Mutex<FailureRecorder>>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            table,
            failures,
            bus,
        }
    }

    const fn mode(&self) -> DownloadMode {
        match self.config.channel {
            DeliveryChannel::AgentToken => DownloadMode::Token,
            DeliveryChannel::AgentLink | DeliveryChannel::Direct => DownloadMode::Url,
        }
    }

    /// Runs the session: prepare, connect, `config`, links, `complete`,
    /// then wait for `job_complete`.
    ///
    /// # Errors
    ///
    /// Connection failures, an unexpected close, an agent-reported job
    /// error and protocol violations are returned as fatal errors.
    /// Per-file failures are recorded instead.
    pub async fn run(
        &self,
        files: Vec<FileInfo>,
        resolver: &Resolver,
        cancel: &CancellationToken,
    ) -> Result<AgentSummary> {
        let agent = &self.config.agent;
        let files = resolver
            .prepare_all(files, agent.link_concurrency, cancel)
            .await?;
        let pushed = files.len();

        let url = agent.url();
        log::info!("Connecting to agent at {url}");
        let connect = tokio::time::timeout(
            Duration::from_millis(agent.connect_timeout_ms),
            connect_async(url.as_str()),
        );
        let ws = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            connected = connect => match connected {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(err)) => {
                    return Err(Error::WebSocket(format!("could not connect to agent at {url}: {err}")));
                }
                Err(_) => return Err(Error::WebSocket(format!("timed out connecting to agent at {url}"))),
            },
        };
        let (sink, stream) = ws.split();

        let session_cancel = cancel.child_token();
        let guard = Arc::new(Mutex::new(ProtocolGuard::new()));
        let (outbound, queue) = Outbound::new(Arc::clone(&guard));
        let writer = spawn_writer(sink, queue);
        let shared = Arc::new(Shared::new(self, &files, outbound, guard, session_cancel.clone()));

        let (version_tx, mut version_rx) = watch::channel(None);
        let reader: JoinHandle<Result<ReaderTotals>> = {
            let shared = Arc::clone(&shared);
            let interval = self.config.transfer.progress_interval();
            tokio::spawn(async move {
                let result = read_loop(stream, Arc::clone(&shared), version_tx, interval).await;
                if result.is_err() {
                    shared.cancel.cancel();
                }
                result
            })
        };

        let sent = self.stream_files(&shared, &files, &mut version_rx).await;
        if sent.is_err() {
            session_cancel.cancel();
        }
        let read = reader
            .await
            .map_err(|err| Error::WebSocket(format!("agent reader stopped: {err}")))
            .and_then(|r| r);

        let refreshed = shared.refreshed.load(Ordering::Relaxed);
        drop(shared);
        if tokio::time::timeout(WRITER_SHUTDOWN, writer).await.is_err() {
            log::debug!("Agent writer did not shut down in time");
        }

        let totals = match (sent, read) {
            (_, Err(err)) if !matches!(err, Error::Cancelled) => return Err(err),
            (Err(err), _) | (Ok(()), Err(err)) => return Err(err),
            (Ok(()), Ok(totals)) => totals,
        };
        let agent_version = version_rx.borrow().clone();
        Ok(AgentSummary {
            pushed,
            succeeded: totals.succeeded.len(),
            failed: totals.failed.len(),
            refreshed,
            agent_version,
        })
    }

    /// The client half of the exchange: `config`, links, `complete`.
    async fn stream_files(
        &self,
        shared: &Shared,
        files: &[FileInfo],
        version: &mut watch::Receiver<Option<String>>,
    ) -> Result<()> {
        let agent = &self.config.agent;
        let mode = self.mode();
        let job_id = uuid::Uuid::new_v4().to_string();
        let token_mode = mode == DownloadMode::Token;

        shared.outbound.send(&ClientMessage::Config(ConfigData {
            concurrent: agent.download_concurrency,
            zip_after_download: agent.pack_after_download,
            job_id: job_id.clone(),
            zip_name: self.config.job_name.clone(),
            total: files.len(),
            download_mode: mode,
            app_token: token_mode.then(|| self.table.app_id().to_string()),
            table_id: token_mode.then(|| self.table.table_id().to_string()),
        }))?;

        if token_mode {
            self.check_version(version, &shared.cancel).await?;
            self.push_batches(shared, files).await?;
        } else {
            self.push_links(shared, files).await?;
        }

        if shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        shared
            .outbound
            .send(&ClientMessage::Complete(CompleteData { job_id }))?;
        log::info!("Pushed {} file(s) to the agent", files.len());
        Ok(())
    }

    /// Waits for `server_info` and enforces the minimum version.
    async fn check_version(
        &self,
        version: &mut watch::Receiver<Option<String>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let agent = &self.config.agent;
        let wait = Duration::from_millis(agent.server_info_timeout_ms);
        let reported = async {
            version
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|v| v.clone())
        };
        let found = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            found = tokio::time::timeout(wait, reported) => found.ok().flatten(),
        };
        match (&agent.min_version, found) {
            (Some(required), Some(found)) if !version_at_least(&found, required) => {
                Err(Error::AgentVersion {
                    found,
                    required: required.clone(),
                })
            }
            (Some(required), None) => Err(Error::WebSocket(format!(
                "agent did not report its version (need {required})"
            ))),
            (None, None) => {
                log::warn!("Agent did not report its version");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Url mode: mint concurrently and send one `link` per file.
    async fn push_links(&self, shared: &Shared, files: &[FileInfo]) -> Result<()> {
        let cancel = &shared.cancel;
        let limit = self.config.agent.link_concurrency;
        let items: Vec<&FileInfo> = files.iter().collect();
        let outcome = run_pool(items, limit, cancel, |file| async move {
            let sent = self.push_link(shared, file).await;
            if sent.is_err() {
                cancel.cancel();
            }
            sent
        })
        .await;
        for result in outcome.results {
            result?;
        }
        if outcome.unclaimed > 0 {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn push_link(&self, shared: &Shared, file: &FileInfo) -> Result<()> {
        shared
            .outbound
            .wait_for_drain(shared.backpressure, &shared.cancel)
            .await?;
        let url = match &file.file_url {
            Some(url) => Some(url.clone()),
            None => match mint_with_retry(self.table.as_ref(), &file.key, &self.config.transfer).await {
                Ok(url) => Some(url),
                Err(err) => {
                    log::debug!("Mint for {} failed, agent will ask again: {err}", file.name);
                    None
                }
            },
        };
        if shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        shared
            .outbound
            .send(&ClientMessage::Link(LinkData::Single(link_item(file, url, DownloadMode::Url))))
    }

    /// Token mode: batch identifiers under the rate limit.
    async fn push_batches(&self, shared: &Shared, files: &[FileInfo]) -> Result<()> {
        let agent = &self.config.agent;
        let cancel = &shared.cancel;
        let mut limiter = SlidingWindow::new(
            agent.rate_limit_files,
            Duration::from_millis(agent.rate_window_ms),
        );
        for batch in files.chunks(agent.token_batch_size.max(1)) {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = limiter.acquire(batch.len()) => {}
            }
            shared
                .outbound
                .wait_for_drain(shared.backpressure, cancel)
                .await?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let items = batch
                .iter()
                .map(|f| link_item(f, None, DownloadMode::Token))
                .collect();
            shared
                .outbound
                .send(&ClientMessage::Link(LinkData::Batch { files: items }))?;
            log::debug!("Pushed batch of {} file(s)", batch.len());
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

fn link_item(file: &FileInfo, url: Option<String>, mode: DownloadMode) -> LinkItem {
    let token_mode = mode == DownloadMode::Token;
    LinkItem {
        name: file.name.clone(),
        path: file.path.clone(),
        order: file.order,
        size: file.size,
        download_url: url,
        token: token_mode.then(|| file.key.token.clone()),
        field_id: token_mode.then(|| file.key.field_id.clone()),
        record_id: token_mode.then(|| file.key.record_id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::message::ACK_TYPE;
    use crate::agent::outbound::OutboundQueue;
    use crate::config::{AgentConfig, FolderConfig, NamingStrategy};
    use crate::file::AttachmentKey;
    use crate::table::{
        Manifest, ManifestAttachment, ManifestRecord, ManifestTable, PageRequest, Record, RecordPage,
    };
    use async_trait::async_trait;
    use futures::SinkExt;
    use std::time::Instant;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    /// Starts a scripted agent on a loopback port. `reply` maps every
    /// received message to the acks sent back; `None` closes the socket.
    async fn spawn_agent<F>(mut reply: F) -> (u16, JoinHandle<Vec<Value>>)
    where
        F: FnMut(&Value) -> Option<Vec<Value>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut seen = Vec::new();
            'read: while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                let replies = reply(&value);
                seen.push(value);
                let Some(replies) = replies else {
                    let _ = ws.close(None).await;
                    break;
                };
                for ack in replies {
                    if ws.send(Message::Text(ack.to_string().into())).await.is_err() {
                        break 'read;
                    }
                }
            }
            seen
        });
        (port, handle)
    }

    fn ack(data: Value) -> Value {
        json!({"type": ACK_TYPE, "data": data})
    }

    fn job_complete() -> Value {
        ack(json!({"status": "success", "stage": "job_complete", "order": null, "message": "done"}))
    }

    fn server_info(version: &str) -> Value {
        ack(json!({"status": "success", "stage": "server_info", "version": version, "order": null}))
    }

    fn kind(value: &Value) -> &str {
        value["type"].as_str().unwrap_or_default()
    }

    fn table(count: u32) -> Arc<ManifestTable> {
        let records = (1..=count)
            .map(|i| ManifestRecord {
                id: format!("rec{i}"),
                attachments: [(
                    "fldFiles".to_string(),
                    vec![ManifestAttachment {
                        token: format!("t{i}"),
                        name: format!("f{i}.bin"),
                        size: 8,
                        url: format!("http://files/t{i}"),
                    }],
                )]
                .into_iter()
                .collect(),
                ..ManifestRecord::default()
            })
            .collect();
        Arc::new(ManifestTable::new(Manifest {
            app_id: "app1".into(),
            table_id: "tbl1".into(),
            records,
        }))
    }

    fn files(count: u32) -> Vec<FileInfo> {
        (1..=count)
            .map(|i| {
                FileInfo::new(
                    AttachmentKey::new(format!("t{i}"), "fldFiles", format!("rec{i}")),
                    format!("f{i}.bin"),
                    8,
                    i,
                )
            })
            .collect()
    }

    /// Manifest table whose mints are slow and counted.
    struct SlowMints {
        inner: Arc<ManifestTable>,
        mints: AtomicUsize,
    }

    #[async_trait]
    impl HostTable for SlowMints {
        fn app_id(&self) -> &str {
            self.inner.app_id()
        }
        fn table_id(&self) -> &str {
            self.inner.table_id()
        }
        async fn list_records(&self, request: PageRequest) -> Result<RecordPage> {
            self.inner.list_records(request).await
        }
        async fn get_records(&self, ids: &[String]) -> Result<Vec<Record>> {
            self.inner.get_records(ids).await
        }
        async fn cell_string(&self, field: &str, record: &str) -> Result<String> {
            self.inner.cell_string(field, record).await
        }
        async fn mint_url(
            &self,
            key: &AttachmentKey,
        ) -> std::result::Result<String, TransferError> {
            self.mints.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.inner.mint_url(key).await
        }
    }

    fn with_urls(mut files: Vec<FileInfo>) -> Vec<FileInfo> {
        for file in &mut files {
            file.file_url = Some(format!("http://files/{}", file.key.token));
        }
        files
    }

    /// Builds session state around an outbound queue that already carries
    /// `config`, without a socket.
    fn detached_shared(
        session: &AgentSession<'_>,
        files: &[FileInfo],
    ) -> (Shared, OutboundQueue) {
        let guard = Arc::new(Mutex::new(ProtocolGuard::new()));
        let (outbound, queue) = Outbound::new(Arc::clone(&guard));
        outbound
            .send(&ClientMessage::Config(ConfigData {
                concurrent: 1,
                zip_after_download: false,
                job_id: "j".into(),
                zip_name: "photos".into(),
                total: files.len(),
                download_mode: session.mode(),
                app_token: None,
                table_id: None,
            }))
            .unwrap();
        let shared = Shared::new(session, files, outbound, guard, CancellationToken::new());
        (shared, queue)
    }

    /// Collects the text frames a writer delivers once `shared` is dropped.
    async fn frames_after(
        shared: Shared,
        queue: OutboundQueue,
    ) -> Vec<Value> {
        let (tx, rx) = futures::channel::mpsc::unbounded::<Message>();
        let sink = tx.sink_map_err(|_| tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        let writer = spawn_writer(sink, queue);
        drop(shared);
        writer.await.unwrap().unwrap();
        rx.filter_map(|m| async move {
            match m {
                Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
                _ => None,
            }
        })
        .collect()
        .await
    }

    fn job(channel: DeliveryChannel, port: u16) -> JobConfig {
        JobConfig::new()
            .with_job_name("photos")
            .with_attachment_fields(["fldFiles"])
            .with_channel(channel)
            .with_agent(AgentConfig {
                port,
                server_info_timeout_ms: 2_000,
                connect_timeout_ms: 2_000,
                ..AgentConfig::default()
            })
    }

    struct Run {
        result: Result<AgentSummary>,
        failures: Arc<Mutex<FailureRecorder>>,
        events: Vec<JobEvent>,
    }

    async fn run_session(config: &JobConfig, table: Arc<dyn HostTable>, files: Vec<FileInfo>) -> Run {
        let failures = Arc::new(Mutex::new(FailureRecorder::new()));
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let resolver = Resolver::new(table.clone(), NamingStrategy::Original, FolderConfig::default());
        let session = AgentSession::new(config, table, Arc::clone(&failures), bus);
        let cancel = CancellationToken::new();
        let result = session.run(files, &resolver, &cancel).await;
        drop(session);
        let events = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        Run {
            result,
            failures,
            events,
        }
    }

    #[tokio::test]
    async fn token_mode_batches_120_files_into_three_links() {
        let (port, agent) = spawn_agent(|msg| match kind(msg) {
            "feishu_attachment_config" => Some(vec![server_info("2.1.0")]),
            "feishu_attachment_complete" => Some(vec![job_complete()]),
            _ => Some(Vec::new()),
        })
        .await;
        let config = job(DeliveryChannel::AgentToken, port);
        let run = run_session(&config, table(120), files(120)).await;
        let summary = run.result.unwrap();
        assert_eq!(summary.pushed, 120);
        assert_eq!(summary.agent_version.as_deref(), Some("2.1.0"));

        let seen = agent.await.unwrap();
        assert_eq!(kind(&seen[0]), "feishu_attachment_config");
        assert_eq!(seen[0]["data"]["downloadMode"], "token");
        assert_eq!(seen[0]["data"]["appToken"], "app1");
        assert_eq!(seen[0]["data"]["total"], 120);
        let batches: Vec<usize> = seen
            .iter()
            .filter(|m| kind(m) == "feishu_attachment_link")
            .map(|m| m["data"]["files"].as_array().unwrap().len())
            .collect();
        assert_eq!(batches, vec![50, 50, 20]);
        assert_eq!(kind(seen.last().unwrap()), "feishu_attachment_complete");
        assert_eq!(seen[1]["data"]["files"][0]["recordId"], "rec1");
    }

    #[tokio::test]
    async fn url_mode_serves_refresh_requests() {
        let mut saw_complete = false;
        let mut saw_refresh = false;
        let (port, agent) = spawn_agent(move |msg| {
            let data = &msg["data"];
            match kind(msg) {
                "feishu_attachment_link" if data["order"] == 1 => Some(vec![ack(
                    json!({"status": "refresh", "stage": "refresh", "order": 1}),
                )]),
                "feishu_attachment_link" => Some(vec![ack(
                    json!({"status": "success", "stage": "file", "order": data["order"]}),
                )]),
                "feishu_attachment_refresh" => {
                    saw_refresh = true;
                    let mut replies = vec![ack(json!({"status": "success", "stage": "file", "order": 1}))];
                    if saw_complete {
                        replies.push(job_complete());
                    }
                    Some(replies)
                }
                "feishu_attachment_complete" => {
                    saw_complete = true;
                    Some(if saw_refresh { vec![job_complete()] } else { Vec::new() })
                }
                _ => Some(Vec::new()),
            }
        })
        .await;
        let config = job(DeliveryChannel::AgentLink, port);
        let run = run_session(&config, table(3), files(3)).await;
        let summary = run.result.unwrap();
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.refreshed, 1);

        let seen = agent.await.unwrap();
        let links: Vec<&Value> = seen
            .iter()
            .filter(|m| kind(m) == "feishu_attachment_link")
            .collect();
        assert_eq!(links.len(), 3);
        assert!(links.iter().all(|l| l["data"]["downloadUrl"].is_string()));
        let refresh = seen
            .iter()
            .find(|m| kind(m) == "feishu_attachment_refresh")
            .unwrap();
        assert_eq!(refresh["data"]["order"], 1);
        assert_eq!(refresh["data"]["downloadUrl"], "http://files/t1");

        let done = run
            .events
            .iter()
            .filter(|e| matches!(e, JobEvent::Progress { percentage: 100, .. }))
            .count();
        assert_eq!(done, 3);
    }

    #[tokio::test]
    async fn per_file_error_is_recorded_and_job_finishes() {
        let (port, _agent) = spawn_agent(|msg| match kind(msg) {
            "feishu_attachment_link" if msg["data"]["order"] == 2 => Some(vec![ack(
                json!({"status": "error", "stage": "file", "order": 2, "message": "HTTP 500"}),
            )]),
            "feishu_attachment_complete" => Some(vec![job_complete()]),
            _ => Some(Vec::new()),
        })
        .await;
        let config = job(DeliveryChannel::AgentLink, port);
        let run = run_session(&config, table(2), files(2)).await;
        let summary = run.result.unwrap();
        assert_eq!(summary.failed, 1);
        assert!(run.failures.lock().unwrap().get(2).is_some());
        assert!(run
            .events
            .iter()
            .any(|e| matches!(e, JobEvent::Error { index: 2, .. })));
    }

    #[tokio::test]
    async fn job_level_error_is_fatal() {
        let (port, _agent) = spawn_agent(|msg| match kind(msg) {
            "feishu_attachment_config" => Some(vec![ack(
                json!({"status": "error", "order": null, "message": "disk full"}),
            )]),
            _ => Some(Vec::new()),
        })
        .await;
        let config = job(DeliveryChannel::AgentLink, port);
        let run = run_session(&config, table(2), files(2)).await;
        let err = run.result.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn close_without_job_complete_is_fatal() {
        let (port, _agent) = spawn_agent(|msg| match kind(msg) {
            "feishu_attachment_complete" => None,
            _ => Some(Vec::new()),
        })
        .await;
        let config = job(DeliveryChannel::AgentLink, port);
        let run = run_session(&config, table(1), files(1)).await;
        assert!(matches!(run.result, Err(Error::WebSocket(_))));
    }

    #[tokio::test]
    async fn old_agent_is_rejected_in_token_mode() {
        let (port, agent) = spawn_agent(|msg| match kind(msg) {
            "feishu_attachment_config" => Some(vec![server_info("1.0.3")]),
            _ => Some(Vec::new()),
        })
        .await;
        let mut config = job(DeliveryChannel::AgentToken, port);
        config.agent.min_version = Some("1.2".into());
        let run = run_session(&config, table(5), files(5)).await;
        assert!(matches!(
            run.result,
            Err(Error::AgentVersion { ref found, .. }) if found == "1.0.3"
        ));
        let seen = agent.await.unwrap();
        assert!(seen.iter().all(|m| kind(m) != "feishu_attachment_link"));
    }

    #[tokio::test]
    async fn unreachable_agent_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let config = job(DeliveryChannel::AgentLink, port);
        let run = run_session(&config, table(1), files(1)).await;
        assert!(matches!(run.result, Err(Error::WebSocket(_))));
    }

    #[tokio::test]
    async fn concurrent_refreshes_for_one_file_share_a_mint() {
        let mut refreshes = 0;
        let mut saw_complete = false;
        let (port, agent) = spawn_agent(move |msg| match kind(msg) {
            "feishu_attachment_link" => {
                let refresh = ack(json!({"status": "refresh", "stage": "refresh", "order": 1}));
                Some(vec![refresh.clone(), refresh])
            }
            "feishu_attachment_refresh" => {
                refreshes += 1;
                let mut replies = Vec::new();
                if refreshes == 2 {
                    replies.push(ack(json!({"status": "success", "stage": "file", "order": 1})));
                    if saw_complete {
                        replies.push(job_complete());
                    }
                }
                Some(replies)
            }
            "feishu_attachment_complete" => {
                saw_complete = true;
                Some(if refreshes == 2 { vec![job_complete()] } else { Vec::new() })
            }
            _ => Some(Vec::new()),
        })
        .await;
        let mut config = job(DeliveryChannel::AgentLink, port);
        config.agent.refresh_limit = Some(1);
        let table = Arc::new(SlowMints {
            inner: table(1),
            mints: AtomicUsize::new(0),
        });
        let run = run_session(&config, table.clone(), with_urls(files(1))).await;
        let summary = run.result.unwrap();
        assert_eq!(summary.refreshed, 2);
        assert_eq!(table.mints.load(Ordering::SeqCst), 1);

        let seen = agent.await.unwrap();
        let answers: Vec<&Value> = seen
            .iter()
            .filter(|m| kind(m) == "feishu_attachment_refresh")
            .collect();
        assert_eq!(answers.len(), 2);
        assert!(answers.iter().all(|a| a["data"]["downloadUrl"] == "http://files/t1"));
    }

    #[tokio::test]
    async fn link_sends_wait_for_the_queue_to_drain() {
        let mut config = job(DeliveryChannel::AgentLink, 0);
        config.agent.backpressure_threshold = 0;
        let files = with_urls(files(1));
        let session = AgentSession::new(
            &config,
            table(1),
            Arc::new(Mutex::new(FailureRecorder::new())),
            EventBus::new(),
        );
        let (shared, queue) = detached_shared(&session, &files);
        let queued = shared.outbound.buffered_bytes();
        assert!(queued > 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(100), session.push_link(&shared, &files[0])).await;
        assert!(blocked.is_err());
        assert_eq!(shared.outbound.buffered_bytes(), queued);

        let frames = frames_after(shared, queue).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(kind(&frames[0]), "feishu_attachment_config");
    }

    #[tokio::test]
    async fn token_batches_respect_the_rate_window() {
        let mut config = job(DeliveryChannel::AgentToken, 0);
        config.agent.token_batch_size = 2;
        config.agent.rate_limit_files = 2;
        config.agent.rate_window_ms = 200;
        let files = files(6);
        let session = AgentSession::new(
            &config,
            table(6),
            Arc::new(Mutex::new(FailureRecorder::new())),
            EventBus::new(),
        );
        let (shared, queue) = detached_shared(&session, &files);

        let started = Instant::now();
        session.push_batches(&shared, &files).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));

        let frames = frames_after(shared, queue).await;
        let batches: Vec<usize> = frames
            .iter()
            .filter(|m| kind(m) == "feishu_attachment_link")
            .map(|m| m["data"]["files"].as_array().unwrap().len())
            .collect();
        assert_eq!(batches, vec![2, 2, 2]);
    }

    #[test]
    fn agent_percentage_is_capped() {
        assert_eq!(agent_percentage(None), 0);
        assert_eq!(agent_percentage(Some(42.7)), 42);
        assert_eq!(agent_percentage(Some(100.0)), 99);
        assert_eq!(agent_percentage(Some(-3.0)), 0);
    }
}
