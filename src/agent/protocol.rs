//! Client-side sequencing rules of the agent protocol.
//!
//! The session runs every outgoing message through [`ProtocolGuard`]
//! before it reaches the socket, and reports every ack and the final
//! close to it. [`validate_transcript`] replays a recorded exchange through
//! the same guard.

use crate::error::{Error, Result};

use super::message::{AckData, AckStatus, ClientMessage, stage};

/// Connection state of one job session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Socket open, nothing sent yet.
    Connecting,
    /// `config` sent.
    Configured,
    /// At least one `link` sent.
    Streaming,
    /// `complete` sent; waiting for `job_complete`.
    Completing,
    /// `job_complete` received.
    Closed,
    /// The session ended abnormally.
    Failed,
}

/// Enforces `config → link* → complete` and tracks termination.
#[derive(Debug)]
pub struct ProtocolGuard {
    state: ProtocolState,
}

impl Default for ProtocolGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolGuard {
    /// Creates a guard for a freshly opened connection.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ProtocolState::Connecting,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ProtocolState {
        self.state
    }

    fn violation(&mut self, message: String) -> Error {
        self.state = ProtocolState::Failed;
        Error::Protocol(message)
    }

    /// Checks that `message` may be sent now and advances the state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] and moves to `Failed` if the message is
    /// out of order.
    pub fn before_send(&mut self, message: &ClientMessage) -> Result<()> {
        use ProtocolState::{Closed, Completing, Configured, Connecting, Failed, Streaming};

        let kind = message.kind();
        let next = match (self.state, message) {
            (Failed, _) => {
                return Err(Error::Protocol(format!("{kind} sent on a failed session")));
            }
            (Connecting, ClientMessage::Config(_)) => Configured,
            (Connecting, ClientMessage::VersionQuery {}) => Connecting,
            (Configured | Streaming, ClientMessage::Link(_)) => Streaming,
            (Configured | Streaming, ClientMessage::Complete(_)) => Completing,
            (Configured | Streaming | Completing, ClientMessage::Refresh(_)) => self.state,
            (Connecting, ClientMessage::Link(_)) => {
                return Err(self.violation("link sent before config".into()));
            }
            (Completing | Closed, ClientMessage::Link(_)) => {
                return Err(self.violation("link sent after complete".into()));
            }
            (state, _) => {
                return Err(self.violation(format!("{kind} not allowed in state {state:?}")));
            }
        };
        self.state = next;
        Ok(())
    }

    /// Observes an incoming ack. Returns true if it terminated the job.
    pub fn on_ack(&mut self, ack: &AckData) -> bool {
        if ack.status == AckStatus::Success && ack.is_stage(stage::JOB_COMPLETE) {
            if self.state == ProtocolState::Completing {
                self.state = ProtocolState::Closed;
                return true;
            }
            log::debug!("Ignoring job_complete in state {:?}", self.state);
        }
        false
    }

    /// Observes the end of the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] unless `job_complete` was seen first.
    pub fn on_close(&mut self) -> Result<()> {
        if self.state == ProtocolState::Closed {
            return Ok(());
        }
        self.state = ProtocolState::Failed;
        Err(Error::WebSocket(
            "agent closed the connection before the job completed".into(),
        ))
    }

    /// Marks the session failed.
    pub const fn fail(&mut self) {
        self.state = ProtocolState::Failed;
    }
}

/// One step of a recorded agent exchange.
#[derive(Debug, Clone)]
pub enum TranscriptEntry {
    /// A client to agent message.
    Sent(ClientMessage),
    /// An agent ack.
    Received(AckData),
    /// The connection closed.
    Closed,
}

/// Replays a transcript and rejects it if the client broke sequencing or
/// the exchange ended without `job_complete`.
///
/// # Errors
///
/// Returns the first protocol error found.
pub fn validate_transcript(entries: &[TranscriptEntry]) -> Result<()> {
    let mut guard = ProtocolGuard::new();
    for entry in entries {
        match entry {
            TranscriptEntry::Sent(message) => guard.before_send(message)?,
            TranscriptEntry::Received(ack) => {
                guard.on_ack(ack);
            }
            TranscriptEntry::Closed => return guard.on_close(),
        }
    }
    guard.on_close()
}
