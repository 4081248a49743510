//! Typed events for the surrounding UI.
//!
//! The engine publishes [`JobEvent`]s on an [`EventBus`]; every subscriber
//! gets its own unbounded receiver and sees every event published after it
//! subscribed.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;

/// Events the engine emits while a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    /// Transfer progress of one file. `percentage` is 0-99 while bytes are
    /// still arriving and 100 only after the file is complete.
    Progress {
        index: u32,
        name: Option<String>,
        size: Option<u64>,
        percentage: u8,
    },
    /// A single file failed after exhausting its retries.
    Error { index: u32, message: String },
    /// A condition the user should know about; also used for job-fatal errors.
    Warn { message: String },
    /// Archive packing or agent-side job stage update.
    ZipProgress {
        stage: Option<String>,
        message: Option<String>,
        path: Option<String>,
        failed: Option<u32>,
    },
    /// The job ran to completion.
    Finished,
    /// The job was cancelled.
    Cancelled,
    /// Informational message.
    Info { message: String },
}

impl JobEvent {
    /// Shorthand for a [`JobEvent::Warn`].
    #[must_use]
    pub fn warn(message: impl Into<String>) -> Self {
        Self::Warn {
            message: message.into(),
        }
    }

    /// Shorthand for a [`JobEvent::Info`].
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }

    /// Shorthand for a [`JobEvent::ZipProgress`] carrying a stage and a message.
    #[must_use]
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ZipProgress {
            stage: Some(stage.into()),
            message: Some(message.into()),
            path: None,
            failed: None,
        }
    }
}

/// Publish/subscribe hub for [`JobEvent`]s. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Publishes an event, dropping subscribers whose receiver is gone.
    pub fn emit(&self, event: JobEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
