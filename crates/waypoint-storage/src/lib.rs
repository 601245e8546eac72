//! Filesystem storage primitives backing the payload cache.
//!
//! The Cache Manager (`spec.md` §4.4) lays payloads out under a working
//! directory during acquisition and a completed, read-only, content-
//! addressed directory once verified. This crate provides the
//! [`StorageBackend`] trait the Cache Manager programs against and the one
//! implementation the engine ships: [`FileStorage`], a local-filesystem
//! backend with atomic, rename-based writes.
//!
//! # Example
//!
//! ```
//! use waypoint_storage::{StorageBackend, FileStorage};
//! use std::path::PathBuf;
//!
//! let storage = FileStorage::new(PathBuf::from("/var/cache/waypoint"));
//!
//! storage.write("abc123/payload.msi", b"payload bytes").expect("write");
//! let data = storage.read("abc123/payload.msi").expect("read");
//! assert_eq!(data, b"payload bytes");
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Common trait for cache storage backends.
///
/// A single implementation ships today (local filesystem); the trait exists
/// so the Cache Manager's acquisition and layout logic never names
/// `FileStorage` directly, matching `spec.md`'s explicit non-goal of baking
/// in a storage medium.
pub trait StorageBackend: Send + Sync {
    /// Read data from storage at the given path.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write data to storage at the given path, atomically.
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Delete data from storage at the given path. Absent paths are not an error.
    fn delete(&self, path: &str) -> Result<()>;

    /// Check if data exists at the given path.
    fn exists(&self, path: &str) -> Result<bool>;

    /// List all paths matching a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the base path within the storage.
    fn base_path(&self) -> &str;

    /// Copy data from one path to another within the same storage.
    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let data = self.read(from)?;
        self.write(to, &data)
    }

    /// Move data from one path to another within the same storage.
    fn mv(&self, from: &str, to: &str) -> Result<()> {
        self.copy(from, to)?;
        self.delete(from)
    }

    /// Mark the leaf at `path` read-only, matching the completed-cache
    /// attribute the Cache Manager sets once a payload is verified.
    fn set_readonly(&self, path: &str) -> Result<()>;
}

/// Filesystem-based storage backend.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    /// Create a new `FileStorage` rooted at `base_path`.
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Get the base path.
    pub fn path(&self) -> &PathBuf {
        &self.base_path
    }

    /// Get the full path for a relative path.
    pub fn full_path(&self, relative_path: &str) -> PathBuf {
        self.base_path.join(relative_path)
    }

    /// Ensure the base directory exists.
    pub fn ensure_base_dir(&self) -> Result<()> {
        if !self.base_path.exists() {
            std::fs::create_dir_all(&self.base_path)
                .with_context(|| format!("failed to create directory: {}", self.base_path.display()))?;
        }
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.base_path.join(path);
        std::fs::read(&full_path)
            .with_context(|| format!("failed to read file: {}", full_path.display()))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.base_path.join(path);

        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }

        // Write to a temp file first, then rename for atomicity — the
        // completed cache must never expose a partially-written payload.
        let tmp_path = full_path.with_extension("tmp");
        std::fs::write(&tmp_path, data)
            .with_context(|| format!("failed to write file: {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, &full_path)
            .with_context(|| format!("failed to rename file to: {}", full_path.display()))?;

        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.base_path.join(path);
        if full_path.exists() {
            std::fs::remove_file(&full_path)
                .with_context(|| format!("failed to delete file: {}", full_path.display()))?;
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.base_path.join(path);
        Ok(full_path.exists())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.base_path.join(prefix);
        let mut results = Vec::new();

        if !base.exists() {
            return Ok(results);
        }

        fn collect_files(dir: &PathBuf, base: &PathBuf, results: &mut Vec<String>) -> Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();

                if path.is_dir() {
                    collect_files(&path, base, results)?;
                } else if let Ok(relative) = path.strip_prefix(base)
                    && let Some(s) = relative.to_str()
                {
                    results.push(s.replace('\\', "/"));
                }
            }
            Ok(())
        }

        collect_files(&base, &self.base_path, &mut results)?;
        Ok(results)
    }

    fn base_path(&self) -> &str {
        self.base_path.to_str().unwrap_or("")
    }

    fn set_readonly(&self, path: &str) -> Result<()> {
        let full_path = self.base_path.join(path);
        let mut perms = std::fs::metadata(&full_path)
            .with_context(|| format!("failed to stat file: {}", full_path.display()))?
            .permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&full_path, perms)
            .with_context(|| format!("failed to set permissions on: {}", full_path.display()))
    }
}

/// Create the default filesystem storage for the current working directory,
/// used in tests and as a development fallback before `waypoint-config`
/// resolves the real per-user or per-machine cache root.
pub fn default_storage() -> FileStorage {
    FileStorage::new(PathBuf::from(".waypoint-cache"))
}
