//! File name and folder path resolution.
//!
//! Every file goes through three idempotent steps before it is written or
//! pushed: folder classification, custom naming, and de-duplication. The
//! readiness flags on [`FileInfo`] make repeated calls free.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::{FolderConfig, NamingStrategy};
use crate::error::Result;
use crate::file::FileInfo;
use crate::scheduler::run_pool;
use crate::table::HostTable;

/// Folder label used when the classification cell is empty.
pub const UNCATEGORIZED: &str = "uncategorized";

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|\x00-\x1f]+"#).expect("valid regex"));

/// Replaces path separators and reserved characters with `_` and trims
/// surrounding whitespace and dots.
#[must_use]
pub fn sanitize_component(value: &str) -> String {
    let replaced = UNSAFE_CHARS.replace_all(value.trim(), "_");
    replaced.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string()
}

/// Splits `name` into stem and extension (with its dot). Leading-dot names
/// such as `.env` have no extension.
#[must_use]
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(dot) => name.split_at(dot),
    }
}

#[derive(Debug, Default)]
struct ResolverState {
    claimed: HashSet<String>,
    assigned: HashMap<u32, String>,
    cells: HashMap<(String, String), String>,
}

/// Computes folder paths, custom names and unique names for one job.
pub struct Resolver {
    table: Arc<dyn HostTable>,
    naming: NamingStrategy,
    folders: FolderConfig,
    state: Mutex<ResolverState>,
}

impl Resolver {
    /// Creates a resolver with an empty name space and cell cache.
    #[must_use]
    pub fn new(table: Arc<dyn HostTable>, naming: NamingStrategy, folders: FolderConfig) -> Self {
        Self {
            table,
            naming,
            folders,
            state: Mutex::new(ResolverState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads a cell, consulting the per-job cache first.
    async fn cell(&self, field_id: &str, record_id: &str) -> Result<String> {
        let key = (field_id.to_string(), record_id.to_string());
        if let Some(value) = self.state().cells.get(&key) {
            return Ok(value.clone());
        }
        let value = self.table.cell_string(field_id, record_id).await?;
        self.state().cells.insert(key, value.clone());
        Ok(value)
    }

    /// Computes the folder path of `file` if not done yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a classification cell cannot be read.
    pub async fn prepare_folder(&self, file: &mut FileInfo) -> Result<()> {
        if file.folder_path_ready {
            return Ok(());
        }
        let mut parts = Vec::new();
        for field in [&self.folders.first_level, &self.folders.second_level]
            .into_iter()
            .flatten()
        {
            let label = sanitize_component(&self.cell(field, &file.key.record_id).await?);
            parts.push(if label.is_empty() {
                UNCATEGORIZED.to_string()
            } else {
                label
            });
        }
        file.path = parts.join("/");
        file.folder_path_ready = true;
        Ok(())
    }

    /// Applies the naming strategy to `file` if not done yet. The result is
    /// always a single safe path component.
    ///
    /// # Errors
    ///
    /// Returns an error if a naming cell cannot be read.
    pub async fn prepare_custom_name(&self, file: &mut FileInfo) -> Result<()> {
        if file.custom_name_ready {
            return Ok(());
        }
        if let NamingStrategy::Fields {
            field_ids,
            separator,
        } = &self.naming
        {
            let mut parts = Vec::with_capacity(field_ids.len());
            for field in field_ids {
                let value = self.cell(field, &file.key.record_id).await?;
                let value = sanitize_component(&value);
                if !value.is_empty() {
                    parts.push(value);
                }
            }
            if !parts.is_empty() {
                let (_, extension) = split_extension(&file.original_name);
                file.name = format!("{}{extension}", parts.join(separator));
            }
        }
        let name = sanitize_component(&file.name);
        file.name = if name.is_empty() {
            format!("attachment_{}", file.order)
        } else {
            name
        };
        file.custom_name_ready = true;
        Ok(())
    }

    /// Claims a name for `file` that no other file in the same folder has.
    ///
    /// On collision a `_N` suffix is inserted before the extension, counting
    /// up from 1. A file whose `order` already holds a claim gets the same
    /// name back.
    pub fn claim_unique_name(&self, file: &mut FileInfo) {
        if file.unique_name_ready {
            return;
        }
        let mut state = self.state();
        if let Some(name) = state.assigned.get(&file.order) {
            file.name = name.clone();
            file.unique_name_ready = true;
            return;
        }
        let (stem, extension) = split_extension(&file.name);
        let mut candidate = file.name.clone();
        let mut counter = 1u32;
        while state.claimed.contains(&claim_key(&file.path, &candidate)) {
            candidate = format!("{stem}_{counter}{extension}");
            counter += 1;
        }
        state.claimed.insert(claim_key(&file.path, &candidate));
        state.assigned.insert(file.order, candidate.clone());
        drop(state);
        file.name = candidate;
        file.unique_name_ready = true;
    }

    /// Runs all three steps for one file. Used on the direct channel right
    /// before the file transfers.
    ///
    /// # Errors
    ///
    /// Returns an error if a cell read fails. The file keeps whatever steps
    /// completed, so a later call resumes where this one stopped.
    pub async fn prepare(&self, file: &mut FileInfo) -> Result<()> {
        self.prepare_folder(file).await?;
        self.prepare_custom_name(file).await?;
        self.claim_unique_name(file);
        Ok(())
    }

    /// Prepares every file up front. Folder and naming reads run
    /// concurrently; unique names are then claimed in `order` so the result
    /// does not depend on completion order.
    ///
    /// # Errors
    ///
    /// Returns the first cell read error encountered.
    pub async fn prepare_all(
        &self,
        files: Vec<FileInfo>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileInfo>> {
        let outcome = run_pool(files, concurrency, cancel, |mut file| async move {
            self.prepare_folder(&mut file).await?;
            self.prepare_custom_name(&mut file).await?;
            Ok::<_, crate::Error>(file)
        })
        .await;
        if outcome.was_cancelled() {
            return Err(crate::Error::Cancelled);
        }
        let mut prepared = outcome.results.into_iter().collect::<Result<Vec<_>>>()?;
        prepared.sort_by_key(|f| f.order);
        for file in &mut prepared {
            self.claim_unique_name(file);
        }
        Ok(prepared)
    }

    /// Number of names claimed so far.
    #[must_use]
    pub fn claimed_count(&self) -> usize {
        self.state().claimed.len()
    }
}

fn claim_key(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}/{name}")
    }
}
