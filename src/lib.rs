//! attach-dl - bulk download of table attachments.
//!
//! The engine enumerates the attachments of a hosted table, resolves a
//! unique folder path and file name for each, and delivers the bytes through
//! one of two channels: in-process transfer into zip archives or individual
//! files, or a push to a local download agent over WebSocket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use attach_dl::{Job, JobConfig, ManifestTable};
//!
//! # async fn example() -> attach_dl::Result<()> {
//! let table = Arc::new(ManifestTable::load("table.json".as_ref())?);
//! let config = JobConfig::new()
//!     .with_job_name("photos")
//!     .with_attachment_fields(["fldAttachments"]);
//!
//! let job = Job::new(config, table);
//! let mut events = job.subscribe();
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! });
//!
//! let report = job.run().await?;
//! println!("{}", report.summary_line());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod failure;
pub mod file;
pub mod fs;
pub mod resolve;
pub mod scheduler;
pub mod singleflight;
pub mod stats;
pub mod table;
pub mod throttle;
pub mod transfer;

#[cfg(feature = "cli")]
pub mod cli;

pub use agent::{AgentSession, AgentSummary, query_version};
pub use config::{
    AgentConfig, DeliveryChannel, FolderConfig, JobConfig, NamingStrategy, PackingMode,
    SourceConfig, TransferConfig,
};
pub use engine::Job;
pub use error::{Error, Result};
pub use events::{EventBus, JobEvent};
pub use failure::{ErrorType, FailureRecord, FailureRecorder, TransferError, classify, should_refresh_url};
pub use file::{AttachmentKey, FileInfo};
pub use fs::{FileSystem, TokioFileSystem};
pub use resolve::Resolver;
pub use scheduler::{PoolOutcome, run_pool};
pub use singleflight::SingleFlight;
pub use stats::{JobReport, JobReportBuilder, format_bytes, format_duration};
pub use table::{HostTable, Manifest, ManifestTable};
pub use throttle::ProgressThrottler;
pub use transfer::{DirectBackend, TransferSummary};
