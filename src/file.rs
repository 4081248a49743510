//! Attachment instances and their enumeration from the host table.

use serde::{Deserialize, Serialize};

use crate::config::JobConfig;
use crate::error::Result;
use crate::table::{HostTable, PageRequest, Record};

/// Compound key of one attachment in the host table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentKey {
    /// Attachment token.
    pub token: String,
    /// Field holding the attachment.
    pub field_id: String,
    /// Record holding the attachment.
    pub record_id: String,
}

impl AttachmentKey {
    /// Creates a key from its three parts.
    #[must_use]
    pub fn new(
        token: impl Into<String>,
        field_id: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            field_id: field_id.into(),
            record_id: record_id.into(),
        }
    }
}

/// One attachment instance to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Host table identity.
    pub key: AttachmentKey,
    /// Current file name. Final once `unique_name_ready` is set.
    pub name: String,
    /// Name the attachment had in the table.
    pub original_name: String,
    /// Folder prefix without leading or trailing slash; may be empty.
    pub path: String,
    /// 1-based correlation key, assigned once at enumeration.
    pub order: u32,
    /// Declared size in bytes.
    pub size: u64,
    /// Cached temporary URL. `None` forces a fresh mint.
    pub file_url: Option<String>,
    /// Folder path has been computed.
    pub folder_path_ready: bool,
    /// Custom name has been computed.
    pub custom_name_ready: bool,
    /// Name has been de-duplicated and claimed.
    pub unique_name_ready: bool,
}

impl FileInfo {
    /// Creates a file with no presentation work done yet.
    #[must_use]
    pub fn new(key: AttachmentKey, name: impl Into<String>, size: u64, order: u32) -> Self {
        let name = name.into();
        Self {
            key,
            original_name: name.clone(),
            name,
            path: String::new(),
            order,
            size,
            file_url: None,
            folder_path_ready: false,
            custom_name_ready: false,
            unique_name_ready: false,
        }
    }

    /// Path and name joined with `/`, as written into archives and the
    /// agent's job directory.
    #[must_use]
    pub fn relative_path(&self) -> String {
        if self.path.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.path, self.name)
        }
    }

    /// Returns true once every preparation step has run.
    #[must_use]
    pub const fn is_prepared(&self) -> bool {
        self.folder_path_ready && self.custom_name_ready && self.unique_name_ready
    }
}

/// Turns records into files, assigning `order` over the whole set.
///
/// `next_order` is the order to hand out next; it is advanced past every
/// file produced so orders stay unique across pages.
pub fn files_from_records(
    records: &[Record],
    attachment_fields: &[String],
    next_order: &mut u32,
) -> Vec<FileInfo> {
    let mut files = Vec::new();
    for record in records {
        for field in attachment_fields {
            let Some(list) = record.attachments.get(field) else {
                continue;
            };
            for attachment in list {
                let key = AttachmentKey::new(&attachment.token, field, &record.id);
                files.push(FileInfo::new(key, &attachment.name, attachment.size, *next_order));
                *next_order += 1;
            }
        }
    }
    files
}

/// Enumerates every attachment selected by the job configuration.
///
/// Uses the explicit record-id list when one is configured, otherwise
/// pages through the configured view until the host stops returning a
/// continuation token.
///
/// # Errors
///
/// Returns an error if the host table rejects a listing request.
pub async fn enumerate_files(table: &dyn HostTable, config: &JobConfig) -> Result<Vec<FileInfo>> {
    let mut next_order = 1;
    let fields = &config.attachment_fields;

    if !config.source.record_ids.is_empty() {
        let records = table.get_records(&config.source.record_ids).await?;
        return Ok(files_from_records(&records, fields, &mut next_order));
    }

    let mut files = Vec::new();
    let mut page_token = None;
    loop {
        let page = table
            .list_records(PageRequest {
                page_size: config.source.page_size(),
                view_id: config.source.view_id.clone(),
                page_token,
            })
            .await?;
        files.extend(files_from_records(&page.records, fields, &mut next_order));
        match page.page_token {
            Some(token) if !page.records.is_empty() => page_token = Some(token),
            _ => break,
        }
    }
    log::debug!("Enumerated {} attachment(s)", files.len());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::table::{Manifest, ManifestAttachment, ManifestRecord, ManifestTable};

    fn attachment(token: &str, name: &str) -> ManifestAttachment {
        ManifestAttachment {
            token: token.into(),
            name: name.into(),
            size: 10,
            url: format!("http://host/{token}"),
        }
    }

    fn table() -> ManifestTable {
        let records = (1..=5)
            .map(|i| ManifestRecord {
                id: format!("rec{i}"),
                attachments: [
                    ("fldA".to_string(), vec![attachment(&format!("a{i}"), "a.txt")]),
                    ("fldB".to_string(), vec![attachment(&format!("b{i}"), "b.txt")]),
                ]
                .into_iter()
                .collect(),
                ..ManifestRecord::default()
            })
            .collect();
        ManifestTable::new(Manifest {
            app_id: "app".into(),
            table_id: "tbl".into(),
            records,
        })
    }

    #[test]
    fn relative_path_joins_folder() {
        let mut file = FileInfo::new(AttachmentKey::new("t", "f", "r"), "x.pdf", 1, 1);
        assert_eq!(file.relative_path(), "x.pdf");
        file.path = "north/2024".into();
        assert_eq!(file.relative_path(), "north/2024/x.pdf");
    }

    #[tokio::test]
    async fn orders_are_unique_across_pages() {
        let config = JobConfig::new()
            .with_attachment_fields(["fldA", "fldB"])
            .with_source(SourceConfig {
                page_size: 2,
                ..SourceConfig::default()
            });
        let files = enumerate_files(&table(), &config).await.unwrap();
        assert_eq!(files.len(), 10);
        let orders: Vec<u32> = files.iter().map(|f| f.order).collect();
        assert_eq!(orders, (1..=10).collect::<Vec<_>>());
        // Field order from the configuration is kept within a record.
        assert_eq!(files[0].key.field_id, "fldA");
        assert_eq!(files[1].key.field_id, "fldB");
    }

    #[tokio::test]
    async fn explicit_ids_skip_paging() {
        let config = JobConfig::new()
            .with_attachment_fields(["fldB"])
            .with_source(SourceConfig {
                record_ids: vec!["rec4".into(), "rec2".into()],
                ..SourceConfig::default()
            });
        let files = enumerate_files(&table(), &config).await.unwrap();
        let tokens: Vec<&str> = files.iter().map(|f| f.key.token.as_str()).collect();
        assert_eq!(tokens, vec!["b4", "b2"]);
        assert_eq!(files[1].order, 2);
    }
}
