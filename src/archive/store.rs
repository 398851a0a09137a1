//! File-system persistence for the archive.
//!
//! ```text
//! <root>/
//! ├── index.json            # Archive, dates ascending
//! ├── latest.json           # copy of the most recent day's document
//! └── archive/
//!     └── YYYY-MM-DD.json   # one DailyDocument per date
//! ```
//!
//! [`ArchiveStore::commit`] stages every file next to its target first and
//! only then renames them into place. When a rename fails, the ones already
//! done are undone, so a failed commit leaves the previous state on disk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tokio::fs;
use tracing::{error, info, instrument, warn};

use super::document_path;
use crate::error::PersistenceError;
use crate::models::{Archive, DailyDocument};
use crate::utils::ensure_writable_dir;

const INDEX_FILE: &str = "index.json";
const LATEST_FILE: &str = "latest.json";
const STAGING_SUFFIX: &str = "tmp";
const ARCHIVE_DIR: &str = "archive";

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

/// One file to be swapped into place.
struct Staged {
    target: PathBuf,
    temp: PathBuf,
}

/// What a target held before it was replaced.
struct Replaced {
    target: PathBuf,
    previous: Option<Vec<u8>>,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }

    pub fn document_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(document_path(date))
    }

    /// Create the root if needed and check that it is writable.
    ///
    /// Returns `true` when the root did not exist before this call.
    pub async fn prepare(&self) -> Result<bool, PersistenceError> {
        let existed = fs::try_exists(&self.root).await.unwrap_or(false);
        ensure_writable_dir(&self.root).await?;
        Ok(!existed)
    }

    /// Remove the root again if it holds nothing but an empty `archive/`.
    pub async fn discard_if_empty(&self) {
        let _ = fs::remove_dir(self.root.join(ARCHIVE_DIR)).await;
        if fs::remove_dir(&self.root).await.is_ok() {
            info!(root = %self.root.display(), "Removed empty output directory");
        }
    }

    /// Read `index.json`. A missing index is an empty archive; an unreadable
    /// or unordered one is an error.
    #[instrument(level = "info", skip_all, fields(root = %self.root.display()))]
    pub async fn load_index(&self) -> Result<Archive, PersistenceError> {
        let path = self.index_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No archive index yet, starting empty");
                return Ok(Archive::default());
            }
            Err(e) => return Err(PersistenceError::io(path, e)),
        };

        let archive: Archive =
            serde_json::from_slice(&bytes).map_err(|e| PersistenceError::CorruptIndex {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if let Some(pair) = archive.entries.windows(2).find(|w| w[0].date >= w[1].date) {
            return Err(PersistenceError::CorruptIndex {
                path,
                reason: format!(
                    "entries out of order or duplicated at {} -> {}",
                    pair[0].date, pair[1].date
                ),
            });
        }
        info!(entries = archive.entries.len(), "Loaded archive index");
        Ok(archive)
    }

    /// Read one archived document, `None` if that date was never written.
    #[cfg(test)]
    pub async fn load_document(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DailyDocument>, PersistenceError> {
        let path = self.document_path(date);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io(path, e)),
        }
    }

    /// Persist `doc` together with the already merged `archive`.
    ///
    /// Rename order is document, index, then `latest.json`. The latter is
    /// only touched when `doc` is the newest entry of `archive`.
    #[instrument(level = "info", skip_all, fields(root = %self.root.display(), date = %doc.date))]
    pub async fn commit(&self, archive: &Archive, doc: &DailyDocument) -> Result<(), PersistenceError> {
        let document = serde_json::to_vec_pretty(doc)?;
        let index = serde_json::to_vec_pretty(archive)?;

        let mut files = vec![
            (self.document_path(doc.date), document.clone()),
            (self.index_path(), index),
        ];
        if archive.latest().map(|e| e.date) == Some(doc.date) {
            files.push((self.latest_path(), document));
        } else {
            info!("Document is older than the newest archived day, latest.json left as is");
        }

        let doc_dir = self.document_path(doc.date);
        if let Some(dir) = doc_dir.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| PersistenceError::io(dir, e))?;
        }

        let staged = stage(files).await?;
        swap_into_place(&staged).await?;
        info!(
            entries = archive.entries.len(),
            news = doc.news_count(),
            "Committed daily document"
        );
        Ok(())
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".");
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

async fn stage(files: Vec<(PathBuf, Vec<u8>)>) -> Result<Vec<Staged>, PersistenceError> {
    let mut staged = Vec::with_capacity(files.len());
    for (target, bytes) in files {
        let temp = temp_path(&target);
        if let Err(e) = fs::write(&temp, bytes).await {
            let _ = fs::remove_file(&temp).await;
            discard(&staged).await;
            return Err(PersistenceError::io(temp, e));
        }
        staged.push(Staged { target, temp });
    }
    Ok(staged)
}

async fn swap_into_place(staged: &[Staged]) -> Result<(), PersistenceError> {
    let mut replaced: Vec<Replaced> = Vec::with_capacity(staged.len());
    for (i, file) in staged.iter().enumerate() {
        if let Err(e) = replace(file, &mut replaced).await {
            error!(path = %file.target.display(), error = %e, "Commit failed, rolling back");
            rollback(&replaced).await;
            discard(&staged[i..]).await;
            return Err(e);
        }
    }
    Ok(())
}

async fn replace(file: &Staged, replaced: &mut Vec<Replaced>) -> Result<(), PersistenceError> {
    let previous = match fs::read(&file.target).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(PersistenceError::io(&file.target, e)),
    };
    fs::rename(&file.temp, &file.target)
        .await
        .map_err(|e| PersistenceError::io(&file.target, e))?;
    replaced.push(Replaced {
        target: file.target.clone(),
        previous,
    });
    Ok(())
}

async fn rollback(replaced: &[Replaced]) {
    for file in replaced.iter().rev() {
        let result = match &file.previous {
            Some(bytes) => fs::write(&file.target, bytes).await,
            None => fs::remove_file(&file.target).await,
        };
        if let Err(e) = result {
            warn!(path = %file.target.display(), error = %e, "Rollback step failed");
        }
    }
}

async fn discard(staged: &[Staged]) {
    for file in staged {
        let _ = fs::remove_file(&file.temp).await;
    }
}
