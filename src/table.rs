//! Host table collaborator.
//!
//! The engine only talks to the hosted table through [`HostTable`]: paging
//! records, reading cell text, and minting temporary attachment URLs.
//! [`ManifestTable`] is a file-backed implementation used by the CLI and
//! by tests.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::failure::TransferError;
use crate::file::AttachmentKey;

/// One attachment stored in a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment token.
    pub token: String,
    /// Original file name.
    pub name: String,
    /// Size in bytes as declared by the host.
    #[serde(default)]
    pub size: u64,
}

/// A table record with its attachment cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record id.
    pub id: String,
    /// Attachment cells keyed by field id.
    #[serde(default)]
    pub attachments: HashMap<String, Vec<Attachment>>,
}

/// A page request against the host table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Records per page.
    pub page_size: usize,
    /// View to list, or the whole table.
    pub view_id: Option<String>,
    /// Continuation token from the previous page.
    pub page_token: Option<String>,
}

/// One page of records.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    /// Records on this page.
    pub records: Vec<Record>,
    /// Continuation token, present while more pages exist.
    pub page_token: Option<String>,
}

/// Read access to the hosted table.
#[async_trait]
pub trait HostTable: Send + Sync {
    /// Identifier of the app that owns the table.
    fn app_id(&self) -> &str;

    /// Identifier of the table.
    fn table_id(&self) -> &str;

    /// Lists one page of records.
    async fn list_records(&self, request: PageRequest) -> Result<RecordPage>;

    /// Fetches records by id, skipping ids that do not exist.
    async fn get_records(&self, record_ids: &[String]) -> Result<Vec<Record>>;

    /// Reads a cell as display text. Empty cells read as an empty string.
    async fn cell_string(&self, field_id: &str, record_id: &str) -> Result<String>;

    /// Mints a time-limited URL for one attachment.
    async fn mint_url(&self, key: &AttachmentKey) -> std::result::Result<String, TransferError>;
}

/// A table snapshot loaded from a JSON manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// App identifier.
    #[serde(default)]
    pub app_id: String,
    /// Table identifier.
    #[serde(default)]
    pub table_id: String,
    /// Records in table order.
    #[serde(default)]
    pub records: Vec<ManifestRecord>,
}

/// A record inside a [`Manifest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// Record id.
    pub id: String,
    /// Views that contain this record. Empty means every view.
    #[serde(default)]
    pub views: Vec<String>,
    /// Text cells keyed by field id.
    #[serde(default)]
    pub fields: HashMap<String, String>,
    /// Attachment cells keyed by field id.
    #[serde(default)]
    pub attachments: HashMap<String, Vec<ManifestAttachment>>,
}

/// An attachment inside a [`Manifest`], with the URL it resolves to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestAttachment {
    /// Attachment token.
    pub token: String,
    /// Original file name.
    pub name: String,
    /// Declared size in bytes.
    #[serde(default)]
    pub size: u64,
    /// URL handed out by `mint_url`.
    pub url: String,
}

/// [`HostTable`] backed by a [`Manifest`].
#[derive(Debug, Clone)]
pub struct ManifestTable {
    manifest: Manifest,
    index: HashMap<String, usize>,
}

impl ManifestTable {
    /// Wraps an in-memory manifest.
    #[must_use]
    pub fn new(manifest: Manifest) -> Self {
        let index = manifest
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self { manifest, index }
    }

    /// Loads a manifest from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&contents)?;
        Ok(Self::new(manifest))
    }

    fn record(&self, record_id: &str) -> Option<&ManifestRecord> {
        self.index.get(record_id).map(|&i| &self.manifest.records[i])
    }

    /// Ids of every field that holds attachments in some record, sorted.
    #[must_use]
    pub fn attachment_fields(&self) -> Vec<String> {
        let fields: BTreeSet<&String> = self
            .manifest
            .records
            .iter()
            .flat_map(|r| r.attachments.keys())
            .collect();
        fields.into_iter().cloned().collect()
    }
}

fn to_record(record: &ManifestRecord) -> Record {
    Record {
        id: record.id.clone(),
        attachments: record
            .attachments
            .iter()
            .map(|(field, list)| {
                let list = list
                    .iter()
                    .map(|a| Attachment {
                        token: a.token.clone(),
                        name: a.name.clone(),
                        size: a.size,
                    })
                    .collect();
                (field.clone(), list)
            })
            .collect(),
    }
}

#[async_trait]
impl HostTable for ManifestTable {
    fn app_id(&self) -> &str {
        &self.manifest.app_id
    }

    fn table_id(&self) -> &str {
        &self.manifest.table_id
    }

    async fn list_records(&self, request: PageRequest) -> Result<RecordPage> {
        let start = match request.page_token.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::Table(format!("invalid page token: {token}")))?,
            None => 0,
        };
        let in_view = |r: &&ManifestRecord| match &request.view_id {
            Some(view) => r.views.is_empty() || r.views.iter().any(|v| v == view),
            None => true,
        };
        let page_size = request.page_size.max(1);
        let matching: Vec<&ManifestRecord> = self.manifest.records.iter().filter(in_view).collect();
        let end = (start + page_size).min(matching.len());
        let records = matching
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|r| to_record(r))
            .collect();
        let page_token = (end < matching.len()).then(|| end.to_string());
        Ok(RecordPage { records, page_token })
    }

    async fn get_records(&self, record_ids: &[String]) -> Result<Vec<Record>> {
        Ok(record_ids
            .iter()
            .filter_map(|id| self.record(id))
            .map(to_record)
            .collect())
    }

    async fn cell_string(&self, field_id: &str, record_id: &str) -> Result<String> {
        let record = self
            .record(record_id)
            .ok_or_else(|| Error::Table(format!("record not found: {record_id}")))?;
        Ok(record.fields.get(field_id).cloned().unwrap_or_default())
    }

    async fn mint_url(&self, key: &AttachmentKey) -> std::result::Result<String, TransferError> {
        self.record(&key.record_id)
            .and_then(|r| r.attachments.get(&key.field_id))
            .and_then(|list| list.iter().find(|a| a.token == key.token))
            .map(|a| a.url.clone())
            .ok_or_else(|| TransferError::http(404, format!("attachment not found: {}", key.token)))
    }
}
