//! Wire messages exchanged with the local agent.
//!
//! Every frame is a JSON text message shaped `{"type": ..., "data": {...}}`.

use serde::{Deserialize, Serialize};

/// `type` of a job configuration message.
pub const CONFIG_TYPE: &str = "feishu_attachment_config";
/// `type` of a link message.
pub const LINK_TYPE: &str = "feishu_attachment_link";
/// `type` of the completion message.
pub const COMPLETE_TYPE: &str = "feishu_attachment_complete";
/// `type` of a refresh response.
pub const REFRESH_TYPE: &str = "feishu_attachment_refresh";
/// `type` of a version query.
pub const VERSION_QUERY_TYPE: &str = "feishu_attachment_probe";
/// `type` of every agent to client message.
pub const ACK_TYPE: &str = "feishu_attachment_ack";

/// Ack stage names.
pub mod stage {
    /// Agent version report.
    pub const SERVER_INFO: &str = "server_info";
    /// Agent packed the job directory.
    pub const ZIP: &str = "zip";
    /// Agent is re-running its failed files.
    pub const RETRY_FAILED_FILES: &str = "retry_failed_files";
    /// The job is done; the only clean terminator.
    pub const JOB_COMPLETE: &str = "job_complete";
    /// Per-file result.
    pub const FILE: &str = "file";
    /// Agent asks for a fresh URL.
    pub const REFRESH: &str = "refresh";
}

/// How the agent obtains file bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Links carry a ready-to-use temporary URL.
    Url,
    /// Links carry attachment identifiers; the agent mints URLs itself.
    Token,
}

/// Payload of the `config` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigData {
    /// Download concurrency hint.
    pub concurrent: usize,
    /// Pack the job directory once every file is saved.
    pub zip_after_download: bool,
    /// Job identifier.
    pub job_id: String,
    /// Job name, used for the agent's job directory and archive.
    pub zip_name: String,
    /// Number of files the job will push.
    pub total: usize,
    /// Delivery mode.
    pub download_mode: DownloadMode,
    /// App identifier (token mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_token: Option<String>,
    /// Table identifier (token mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
}

/// One file in a `link` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkItem {
    /// Final file name.
    pub name: String,
    /// Folder path relative to the job directory.
    pub path: String,
    /// Correlation key.
    pub order: u32,
    /// Declared size in bytes.
    pub size: u64,
    /// Temporary URL (url mode). Absent when minting failed; the agent
    /// then asks for a refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Attachment token (token mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Field holding the attachment (token mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    /// Record holding the attachment (token mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

/// Payload of a `link` message: one file in url mode, a batch in token
/// mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkData {
    /// Token-mode batch.
    Batch {
        /// Files in this batch.
        files: Vec<LinkItem>,
    },
    /// Url-mode single file.
    Single(LinkItem),
}

impl LinkData {
    /// Number of files carried.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Batch { files } => files.len(),
            Self::Single(_) => 1,
        }
    }

    /// Returns true for an empty batch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Payload of the `complete` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteData {
    /// Job identifier.
    pub job_id: String,
}

/// Payload of a refresh response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshData {
    /// File the agent asked about.
    pub order: u32,
    /// Fresh temporary URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Why no URL could be minted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Client to agent messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Job configuration; always first.
    #[serde(rename = "feishu_attachment_config")]
    Config(ConfigData),
    /// One file or a batch of files.
    #[serde(rename = "feishu_attachment_link")]
    Link(LinkData),
    /// No more links follow.
    #[serde(rename = "feishu_attachment_complete")]
    Complete(CompleteData),
    /// Answer to an agent refresh request.
    #[serde(rename = "feishu_attachment_refresh")]
    Refresh(RefreshData),
    /// Asks the agent for its version.
    #[serde(rename = "feishu_attachment_probe")]
    VersionQuery {},
}

impl ClientMessage {
    /// The wire `type` of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => CONFIG_TYPE,
            Self::Link(_) => LINK_TYPE,
            Self::Complete(_) => COMPLETE_TYPE,
            Self::Refresh(_) => REFRESH_TYPE,
            Self::VersionQuery {} => VERSION_QUERY_TYPE,
        }
    }

    /// Serializes the message as a JSON text frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// `status` of an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Transfer progress of one file.
    Progress,
    /// Something finished.
    Success,
    /// The agent needs a fresh URL for `order`.
    Refresh,
    /// Something failed.
    Error,
    /// A status this client does not know.
    #[serde(other)]
    Unknown,
}

/// Payload of an agent ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckData {
    /// What kind of report this is.
    pub status: AckStatus,
    /// Free-form message.
    #[serde(default)]
    pub message: Option<String>,
    /// File this ack is about, if any.
    #[serde(default)]
    pub order: Option<u32>,
    /// Job stage the ack belongs to.
    #[serde(default)]
    pub stage: Option<String>,
    /// Agent version (`server_info`).
    #[serde(default)]
    pub version: Option<String>,
    /// Transfer percentage (`progress`).
    #[serde(default)]
    pub percentage: Option<f64>,
    /// Saved path or archive path.
    #[serde(default)]
    pub path: Option<String>,
    /// Number of failed files (`retry_failed_files`).
    #[serde(default)]
    pub failed: Option<u32>,
    /// Job identifier (`job_complete`).
    #[serde(default)]
    pub job_id: Option<String>,
}

impl AckData {
    /// Creates an ack with only a status set.
    #[must_use]
    pub const fn new(status: AckStatus) -> Self {
        Self {
            status,
            message: None,
            order: None,
            stage: None,
            version: None,
            percentage: None,
            path: None,
            failed: None,
            job_id: None,
        }
    }

    /// Returns true if the ack carries the given stage.
    #[must_use]
    pub fn is_stage(&self, stage: &str) -> bool {
        self.stage.as_deref() == Some(stage)
    }

    /// Message text, or an empty string.
    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// Envelope of an agent message.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEnvelope {
    /// Wire type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Parses an agent text frame. Returns `Ok(None)` for well-formed frames
/// of a type this client ignores.
///
/// # Errors
///
/// Returns an error if the frame is not valid JSON or the ack payload is
/// malformed.
pub fn parse_agent_message(text: &str) -> serde_json::Result<Option<AckData>> {
    let envelope: AgentEnvelope = serde_json::from_str(text)?;
    if envelope.kind != ACK_TYPE {
        return Ok(None);
    }
    serde_json::from_value(envelope.data).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_uses_wire_names() {
        let message = ClientMessage::Config(ConfigData {
            concurrent: 5,
            zip_after_download: true,
            job_id: "job-1".into(),
            zip_name: "photos".into(),
            total: 3,
            download_mode: DownloadMode::Token,
            app_token: Some("app".into()),
            table_id: Some("tbl".into()),
        });
        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], CONFIG_TYPE);
        assert_eq!(value["data"]["zipAfterDownload"], true);
        assert_eq!(value["data"]["downloadMode"], "token");
        assert_eq!(value["data"]["appToken"], "app");
    }

    #[test]
    fn url_link_is_flat_and_token_link_is_batched() {
        let item = LinkItem {
            name: "a.png".into(),
            path: "north".into(),
            order: 4,
            size: 10,
            download_url: Some("http://x".into()),
            token: None,
            field_id: None,
            record_id: None,
        };
        let single = serde_json::to_value(ClientMessage::Link(LinkData::Single(item.clone()))).unwrap();
        assert_eq!(single["data"]["downloadUrl"], "http://x");
        assert!(single["data"].get("token").is_none());

        let batch = serde_json::to_value(ClientMessage::Link(LinkData::Batch {
            files: vec![item.clone(), item],
        }))
        .unwrap();
        assert_eq!(batch["data"]["files"].as_array().unwrap().len(), 2);

        let parsed: ClientMessage = serde_json::from_value(batch).unwrap();
        assert!(matches!(parsed, ClientMessage::Link(LinkData::Batch { ref files }) if files.len() == 2));
    }

    #[test]
    fn version_query_has_empty_data() {
        let value = serde_json::to_value(ClientMessage::VersionQuery {}).unwrap();
        assert_eq!(value, json!({"type": VERSION_QUERY_TYPE, "data": {}}));
    }

    #[test]
    fn parses_acks() {
        let text = json!({
            "type": ACK_TYPE,
            "data": {"status": "progress", "message": "downloading", "order": 3, "percentage": 42}
        })
        .to_string();
        let ack = parse_agent_message(&text).unwrap().unwrap();
        assert_eq!(ack.status, AckStatus::Progress);
        assert_eq!(ack.order, Some(3));
        assert_eq!(ack.percentage, Some(42.0));

        let text = json!({
            "type": ACK_TYPE,
            "data": {"status": "success", "order": null, "stage": "server_info", "version": "1.4.2"}
        })
        .to_string();
        let ack = parse_agent_message(&text).unwrap().unwrap();
        assert!(ack.is_stage(stage::SERVER_INFO));
        assert_eq!(ack.version.as_deref(), Some("1.4.2"));
    }

    #[test]
    fn unknown_types_and_statuses_are_tolerated() {
        assert!(parse_agent_message(r#"{"type": "other", "data": {}}"#).unwrap().is_none());
        let ack = parse_agent_message(&json!({"type": ACK_TYPE, "data": {"status": "weird"}}).to_string())
            .unwrap()
            .unwrap();
        assert_eq!(ack.status, AckStatus::Unknown);
        assert!(parse_agent_message("not json").is_err());
    }
}
