//! Splitting a file list into size-capped archives.

use crate::file::FileInfo;

/// How a zip-mode job distributes its files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchivePlan {
    /// Files per archive, in the order archives are written.
    pub archives: Vec<Vec<FileInfo>>,
    /// Files larger than the cap on their own; saved individually.
    pub oversized: Vec<FileInfo>,
}

impl ArchivePlan {
    /// Returns true when the user should be told the output is split.
    #[must_use]
    pub fn needs_warning(&self) -> bool {
        self.archives.len() > 1 || !self.oversized.is_empty()
    }

    /// Human-readable warning describing the split, if any.
    #[must_use]
    pub fn warning(&self, cap: u64) -> Option<String> {
        if !self.needs_warning() {
            return None;
        }
        let cap = crate::stats::format_bytes(cap);
        let mut parts = Vec::new();
        if self.archives.len() > 1 {
            parts.push(format!(
                "output exceeds {cap} and is split into {} archives",
                self.archives.len()
            ));
        }
        if !self.oversized.is_empty() {
            parts.push(format!(
                "{} file(s) larger than {cap} will be saved individually",
                self.oversized.len()
            ));
        }
        Some(parts.join("; "))
    }
}

/// Greedily packs `files` in order into archives of at most `cap` declared
/// bytes each.
#[must_use]
pub fn plan_archives(files: Vec<FileInfo>, cap: u64) -> ArchivePlan {
    let mut plan = ArchivePlan::default();
    let mut current: Vec<FileInfo> = Vec::new();
    let mut current_size = 0u64;

    for file in files {
        if file.size > cap {
            plan.oversized.push(file);
            continue;
        }
        if !current.is_empty() && current_size + file.size > cap {
            plan.archives.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += file.size;
        current.push(file);
    }
    if !current.is_empty() {
        plan.archives.push(current);
    }
    plan
}

/// Base archive file name of a job. Later archives of the same job get a
/// `_2`, `_3`, ... suffix when written.
#[must_use]
pub fn archive_name(job_name: &str) -> String {
    let base = crate::resolve::sanitize_component(job_name);
    if base.is_empty() {
        "attachments.zip".to_string()
    } else {
        format!("{base}.zip")
    }
}
