//! Filesystem access abstraction.
//!
//! Every component that touches the filesystem (directive parser, resolver, graph
//! collector, state diffing) goes through this trait rather than `std::fs` directly, so
//! the whole pipeline can be exercised against an in-memory fixture in tests without
//! touching disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::model::FileStat;

#[derive(Debug, thiserror::Error)]
pub enum FileProviderError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub trait FileProvider: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn is_directory(&self, path: &Path) -> bool;
    fn read_file(&self, path: &Path) -> Result<String, FileProviderError>;
    fn stat(&self, path: &Path) -> Result<FileStat, FileProviderError>;
    /// Non-recursive listing of a directory's immediate entries.
    fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>, FileProviderError>;
    fn canonicalize(&self, path: &Path) -> Result<PathBuf, FileProviderError>;
}

impl<T: FileProvider + ?Sized> FileProvider for Arc<T> {
    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }
    fn is_directory(&self, path: &Path) -> bool {
        (**self).is_directory(path)
    }
    fn read_file(&self, path: &Path) -> Result<String, FileProviderError> {
        (**self).read_file(path)
    }
    fn stat(&self, path: &Path) -> Result<FileStat, FileProviderError> {
        (**self).stat(path)
    }
    fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>, FileProviderError> {
        (**self).list_directory(path)
    }
    fn canonicalize(&self, path: &Path) -> Result<PathBuf, FileProviderError> {
        (**self).canonicalize(path)
    }
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeFileProvider;

impl FileProvider for NativeFileProvider {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_directory(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_file(&self, path: &Path) -> Result<String, FileProviderError> {
        std::fs::read_to_string(path).map_err(|source| FileProviderError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn stat(&self, path: &Path) -> Result<FileStat, FileProviderError> {
        let meta = std::fs::metadata(path).map_err(|source| FileProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(FileStat {
            mtime,
            size: meta.len(),
        })
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>, FileProviderError> {
        let entries = std::fs::read_dir(path).map_err(|source| FileProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| FileProviderError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            out.push(entry.path());
        }
        Ok(out)
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf, FileProviderError> {
        std::fs::canonicalize(path).map_err(|_| FileProviderError::NotFound(path.to_path_buf()))
    }
}

/// An in-memory fixture, used by every test in this crate. Paths are compared
/// structurally, so callers don't need to worry about symlinks or `..` components —
/// `canonicalize` here is identity plus existence checking, which is sufficient for the
/// resolver/collector logic under test.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileProvider {
    files: Arc<Mutex<HashMap<PathBuf, (String, FileStat)>>>,
    directories: Arc<Mutex<HashSet<PathBuf>>>,
}

impl InMemoryFileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file with an explicit stat (tests that exercise diffing need control over
    /// `mtime`/`size` independent of content length).
    pub fn add_file_with_stat(&self, path: impl Into<PathBuf>, content: impl Into<String>, stat: FileStat) {
        let path = path.into();
        let mut current = path.parent();
        while let Some(dir) = current {
            self.directories.lock().unwrap().insert(dir.to_path_buf());
            current = dir.parent();
        }
        self.files
            .lock()
            .unwrap()
            .insert(path, (content.into(), stat));
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        let content = content.into();
        let stat = FileStat {
            mtime: 1,
            size: content.len() as u64,
        };
        self.add_file_with_stat(path, content, stat);
    }

    pub fn remove_file(&self, path: &Path) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn touch(&self, path: &Path, stat: FileStat) {
        let mut files = self.files.lock().unwrap();
        if let Some((_, existing)) = files.get_mut(path) {
            *existing = stat;
        }
    }
}

impl FileProvider for InMemoryFileProvider {
    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path) || self.is_directory(path)
    }

    fn is_directory(&self, path: &Path) -> bool {
        self.directories.lock().unwrap().contains(path)
    }

    fn read_file(&self, path: &Path) -> Result<String, FileProviderError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(content, _)| content.clone())
            .ok_or_else(|| FileProviderError::NotFound(path.to_path_buf()))
    }

    fn stat(&self, path: &Path) -> Result<FileStat, FileProviderError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(_, stat)| *stat)
            .ok_or_else(|| FileProviderError::NotFound(path.to_path_buf()))
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>, FileProviderError> {
        if !self.is_directory(path) {
            return Err(FileProviderError::NotFound(path.to_path_buf()));
        }
        let files = self.files.lock().unwrap();
        let dirs = self.directories.lock().unwrap();
        let mut out: Vec<PathBuf> = files
            .keys()
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .chain(dirs.iter().filter(|p| p.parent() == Some(path)).cloned())
            .collect();
        out.sort();
        Ok(out)
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf, FileProviderError> {
        if self.exists(path) {
            Ok(path.to_path_buf())
        } else {
            Err(FileProviderError::NotFound(path.to_path_buf()))
        }
    }
}
