//! The server's file catalog: an ordered list of library-relative paths.
//!
//! A catalog is immutable once built. Refreshing means scanning again and publishing a new
//! `Arc<Catalog>`; sessions that already hold the previous one keep serving from it.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use audio_stream_proto::{MAX_ENTRY_NAME_LEN, ProtocolError};

/// Extensions (lowercase, without the dot) the scanner admits.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "wav", "flac", "mp3", "ogg", "opus", "m4a", "aac", "aiff",
];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("library root {0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("scan {path:?}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    root: PathBuf,
    entries: Vec<String>,
}

impl Catalog {
    /// Walk `root` recursively and collect every supported regular file.
    ///
    /// Entries are `/`-joined paths relative to `root`, sorted so that indices are stable
    /// across rescans of an unchanged tree.
    pub fn scan(root: &Path) -> Result<Self, CatalogError> {
        if !root.is_dir() {
            return Err(CatalogError::NotADirectory(root.to_path_buf()));
        }
        let mut entries = Vec::new();
        scan_dir(root, "", &mut entries)?;
        entries.sort();
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn from_entries(root: impl Into<PathBuf>, entries: Vec<String>) -> Self {
        Self {
            root: root.into(),
            entries,
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Map a wire index to the file on disk.
    pub fn resolve(&self, index: u32) -> Result<PathBuf, ProtocolError> {
        let rel = self
            .entries
            .get(index as usize)
            .ok_or(ProtocolError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            })?;
        Ok(self.root.join(rel))
    }
}

pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(ext))
}

fn join_rel(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn scan_dir(root: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), CatalogError> {
    let dir = if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };
    let scan_err = |source| CatalogError::Scan {
        path: dir.clone(),
        source,
    };

    for entry in fs::read_dir(&dir).map_err(scan_err)? {
        let entry = entry.map_err(scan_err)?;
        let file_type = entry.file_type().map_err(scan_err)?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            tracing::warn!(path = ?entry.path(), "skipping non-UTF-8 name");
            continue;
        };
        if name.contains(['\r', '\n']) {
            tracing::warn!(path = ?entry.path(), "skipping name containing a line break");
            continue;
        }

        if file_type.is_dir() {
            tracing::debug!(dir = %join_rel(rel, name), "descending");
            scan_dir(root, &join_rel(rel, name), out)?;
        } else if file_type.is_file() {
            let supported = Path::new(name)
                .extension()
                .and_then(OsStr::to_str)
                .map(is_supported_extension)
                .unwrap_or(false);
            if !supported {
                continue;
            }
            let entry_rel = join_rel(rel, name);
            if entry_rel.len() > MAX_ENTRY_NAME_LEN {
                tracing::warn!(
                    path = ?entry.path(),
                    len = entry_rel.len(),
                    max = MAX_ENTRY_NAME_LEN,
                    "skipping path too long to list"
                );
                continue;
            }
            out.push(entry_rel);
        }
    }
    Ok(())
}
