//! Configuration types for download jobs.
//!
//! A [`JobConfig`] is built once (from TOML or with the `with_*` builders)
//! and then shared by reference for the whole run. Nothing in the engine
//! mutates it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default loopback address of the local agent.
pub const DEFAULT_AGENT_HOST: &str = "127.0.0.1";
/// Default port of the local agent.
pub const DEFAULT_AGENT_PORT: u16 = 11548;
/// Maximum size of a single zip archive (1 GiB).
pub const DEFAULT_ARCHIVE_CAP: u64 = 1024 * 1024 * 1024;

/// Where the records of a job come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// View to page through; `None` pages the whole table.
    pub view_id: Option<String>,
    /// Explicit record ids. When non-empty, paging is skipped.
    pub record_ids: Vec<String>,
    /// Records requested per page.
    pub page_size: usize,
}

impl SourceConfig {
    /// Returns the page size, falling back to 200 when unset.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        if self.page_size == 0 { 200 } else { self.page_size }
    }
}

/// How the final file name is derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NamingStrategy {
    /// Keep the attachment's own name.
    #[default]
    Original,
    /// Join the values of the given fields with `separator`, keeping the
    /// original extension.
    Fields {
        /// Fields whose cell text makes up the name, in order.
        field_ids: Vec<String>,
        /// Separator placed between non-empty parts.
        separator: String,
    },
}

/// Fields used to sort files into first/second level folders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    /// First-level folder field.
    pub first_level: Option<String>,
    /// Second-level folder field, nested under the first.
    pub second_level: Option<String>,
}

/// How transferred files are written on the direct channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackingMode {
    /// Pack into size-capped zip archives.
    #[default]
    Zip,
    /// Save every file on its own.
    Individual,
}

/// Which backend performs the transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    /// Fetch the bytes in-process.
    #[default]
    Direct,
    /// Push minted URLs to the local agent.
    AgentLink,
    /// Push attachment identifiers to the local agent, which mints URLs itself.
    AgentToken,
}

impl DeliveryChannel {
    /// Returns true for the two agent channels.
    #[must_use]
    pub const fn is_agent(self) -> bool {
        matches!(self, Self::AgentLink | Self::AgentToken)
    }
}

/// Settings for the direct channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory that receives archives and individually saved files.
    pub output_dir: PathBuf,
    /// Concurrent individual saves.
    pub concurrency: usize,
    /// Concurrent fetches feeding a zip archive.
    pub zip_concurrency: usize,
    /// Attempts per file, including the first.
    pub max_attempts: u32,
    /// Linear backoff unit in milliseconds (waits `unit * attempt`).
    pub retry_backoff_ms: u64,
    /// Allowed difference in bytes between declared and received size.
    /// `None` (`"off"` in TOML) disables the check.
    #[serde(with = "limit_format")]
    pub integrity_tolerance: Option<u64>,
    /// Maximum bytes per archive.
    pub archive_cap: u64,
    /// Minimum interval between progress updates per file, in milliseconds.
    pub progress_interval_ms: u64,
    /// Per-request timeout for byte fetches, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            concurrency: 5,
            zip_concurrency: 3,
            max_attempts: 3,
            retry_backoff_ms: 300,
            integrity_tolerance: Some(1024),
            archive_cap: DEFAULT_ARCHIVE_CAP,
            progress_interval_ms: 100,
            request_timeout_secs: 300,
        }
    }
}

impl TransferConfig {
    /// Backoff before retrying after the given (1-based) attempt.
    #[must_use]
    pub const fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    /// Throttle interval for progress events.
    #[must_use]
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Settings for the two agent channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent host.
    pub host: String,
    /// Agent port.
    pub port: u16,
    /// Concurrent URL mints feeding `link` messages (link mode).
    pub link_concurrency: usize,
    /// Download concurrency hint passed to the agent in `config`.
    pub download_concurrency: usize,
    /// Files per `link` message in token mode.
    pub token_batch_size: usize,
    /// Ask the agent to zip the job directory once everything is saved.
    pub pack_after_download: bool,
    /// Outbound bytes allowed to queue before sends pause.
    pub backpressure_threshold: usize,
    /// Outstanding refresh mints; `None` (`"off"` in TOML) is unlimited.
    #[serde(with = "limit_format")]
    pub refresh_limit: Option<usize>,
    /// Token mode: files pushed per rate window.
    pub rate_limit_files: usize,
    /// Token mode: length of the sliding rate window, in milliseconds.
    pub rate_window_ms: u64,
    /// Token mode: refuse agents older than this dotted version.
    pub min_version: Option<String>,
    /// How long to wait for the agent's `server_info`, in milliseconds.
    pub server_info_timeout_ms: u64,
    /// Connection timeout, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_AGENT_HOST.to_string(),
            port: DEFAULT_AGENT_PORT,
            link_concurrency: 20,
            download_concurrency: 5,
            token_batch_size: 50,
            pack_after_download: false,
            backpressure_threshold: 2 * 1024 * 1024,
            refresh_limit: Some(20),
            rate_limit_files: 500,
            rate_window_ms: 1000,
            min_version: None,
            server_info_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl AgentConfig {
    /// WebSocket URL of the agent.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Complete, immutable configuration of one download job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Job name, used for archive names and the agent job directory.
    pub job_name: String,
    /// Attachment fields to collect, in order.
    pub attachment_fields: Vec<String>,
    /// Record source.
    pub source: SourceConfig,
    /// File naming strategy.
    pub naming: NamingStrategy,
    /// Folder classification.
    pub folders: FolderConfig,
    /// Packing mode for the direct channel.
    pub packing: PackingMode,
    /// Delivery channel.
    pub channel: DeliveryChannel,
    /// Direct channel settings.
    pub transfer: TransferConfig,
    /// Agent channel settings.
    pub agent: AgentConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: "attachments".to_string(),
            attachment_fields: Vec::new(),
            source: SourceConfig::default(),
            naming: NamingStrategy::default(),
            folders: FolderConfig::default(),
            packing: PackingMode::default(),
            channel: DeliveryChannel::default(),
            transfer: TransferConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl JobConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.attachment_fields.is_empty() {
            return Err(Error::Config("no attachment field selected".into()));
        }
        if self.transfer.concurrency == 0 || self.transfer.zip_concurrency == 0 {
            return Err(Error::Config("transfer concurrency must be at least 1".into()));
        }
        if self.transfer.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.channel.is_agent() {
            if self.agent.host.trim().is_empty() {
                return Err(Error::Config("agent host is empty".into()));
            }
            if self.agent.link_concurrency == 0 || self.agent.token_batch_size == 0 {
                return Err(Error::Config(
                    "agent concurrency and batch size must be at least 1".into(),
                ));
            }
        }
        if let NamingStrategy::Fields { field_ids, .. } = &self.naming
            && field_ids.is_empty()
        {
            return Err(Error::Config("field naming needs at least one field".into()));
        }
        Ok(())
    }

    /// Sets the job name.
    #[must_use]
    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = name.into();
        self
    }

    /// Sets the attachment fields to collect.
    #[must_use]
    pub fn with_attachment_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attachment_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the naming strategy.
    #[must_use]
    pub fn with_naming(mut self, naming: NamingStrategy) -> Self {
        self.naming = naming;
        self
    }

    /// Sets the folder classification.
    #[must_use]
    pub fn with_folders(mut self, folders: FolderConfig) -> Self {
        self.folders = folders;
        self
    }

    /// Sets the packing mode.
    #[must_use]
    pub const fn with_packing(mut self, packing: PackingMode) -> Self {
        self.packing = packing;
        self
    }

    /// Sets the delivery channel.
    #[must_use]
    pub const fn with_channel(mut self, channel: DeliveryChannel) -> Self {
        self.channel = channel;
        self
    }

    /// Sets the record source.
    #[must_use]
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.source = source;
        self
    }

    /// Sets the direct channel settings.
    #[must_use]
    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Sets the agent channel settings.
    #[must_use]
    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }
}

/// Optional limits: a number, or `"off"` for none. TOML has no null.
mod limit_format {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const OFF: &str = "off";

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Limit<T> {
        Value(T),
        Word(String),
    }

    #[allow(clippy::ref_option)]
    pub fn serialize<S, T>(limit: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match limit {
            Some(value) => value.serialize(serializer),
            None => serializer.serialize_str(OFF),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        match Limit::<T>::deserialize(deserializer)? {
            Limit::Value(value) => Ok(Some(value)),
            Limit::Word(word) if word == OFF => Ok(None),
            Limit::Word(word) => Err(serde::de::Error::custom(format!(
                "expected a number or \"{OFF}\", got \"{word}\""
            ))),
        }
    }
}
