//! Exclusion lock enforcing `spec.md` §4.7 step 1 and the "no concurrent bundles" non-goal.
//!
//! The lock is a JSON file under the bundle's scope root (machine or user) recording the
//! holder's pid, hostname, and the bundle id being applied. A second `Apply` attempt against
//! the same scope fails fast with `bundle-already-applying` instead of corrupting shared
//! cache/registration state.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "apply.lock";

/// Information stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub bundle_id: Option<String>,
}

/// Exclusion lock handle; releases automatically on drop.
#[derive(Debug)]
pub struct ExclusionLock {
    path: PathBuf,
    file: Option<File>,
}

impl ExclusionLock {
    /// Acquire the lock under `scope_root` (a per-machine or per-user root directory).
    ///
    /// Fails with `bundle-already-applying` if a lock is already held and not stale.
    pub fn acquire(scope_root: &Path) -> Result<Self> {
        let lock_path = scope_root.join(LOCK_FILE);

        fs::create_dir_all(scope_root)
            .with_context(|| format!("failed to create scope root {}", scope_root.display()))?;

        if lock_path.exists() {
            let existing = Self::read_lock_info(scope_root)?;
            bail!(
                "bundle-already-applying: held by pid {} on {} since {} (bundle_id: {:?})",
                existing.pid,
                existing.hostname,
                existing.acquired_at,
                existing.bundle_id
            );
        }

        let pid = std::process::id();
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let info = LockInfo { pid, hostname, acquired_at: Utc::now(), bundle_id: None };
        write_lock_info(&lock_path, &info)?;

        Ok(Self { path: lock_path, file: None })
    }

    /// Acquire the lock, treating any lock older than `timeout` as abandoned and removing it.
    /// A bundle process that died mid-Apply (e.g. killed, crashed) leaves a stale lock behind;
    /// resume handling depends on being able to recover from that without manual intervention.
    pub fn acquire_with_timeout(scope_root: &Path, timeout: Duration) -> Result<Self> {
        let lock_path = scope_root.join(LOCK_FILE);

        if lock_path.exists() {
            if let Ok(info) = Self::read_lock_info(scope_root) {
                let age = Utc::now() - info.acquired_at;
                if age.num_seconds().unsigned_abs() > timeout.as_secs() {
                    fs::remove_file(&lock_path).with_context(|| {
                        format!("failed to remove stale lock {}", lock_path.display())
                    })?;
                } else {
                    bail!(
                        "bundle-already-applying: held by pid {} on {} since {} (age: {:?})",
                        info.pid,
                        info.hostname,
                        info.acquired_at,
                        age
                    );
                }
            } else {
                fs::remove_file(&lock_path).with_context(|| {
                    format!("failed to remove corrupt lock {}", lock_path.display())
                })?;
            }
        }

        Self::acquire(scope_root)
    }

    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock {}", self.path.display()))?;
        }
        self.file = None;
        Ok(())
    }

    /// Record which bundle this lock is currently guarding, for diagnostics.
    pub fn set_bundle_id(&self, bundle_id: &str) -> Result<()> {
        if !self.path.exists() {
            bail!("lock file does not exist at {}", self.path.display());
        }
        let mut info = read_lock_info_from_path(&self.path)?;
        info.bundle_id = Some(bundle_id.to_string());
        write_lock_info(&self.path, &info)
    }

    pub fn is_locked(scope_root: &Path) -> Result<bool> {
        Ok(scope_root.join(LOCK_FILE).exists())
    }

    pub fn read_lock_info(scope_root: &Path) -> Result<LockInfo> {
        read_lock_info_from_path(&scope_root.join(LOCK_FILE))
    }
}

impl Drop for ExclusionLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_info(path: &Path, info: &LockInfo) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create lock tmp file {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock tmp file {}", tmp_path.display()))?;
        file.sync_all().context("failed to sync lock file")?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename lock file to {}", path.display()))?;
    Ok(())
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))
}

pub fn lock_path(scope_root: &Path) -> PathBuf {
    scope_root.join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn acquire_creates_and_release_removes_lock() {
        let td = tempdir().expect("tempdir");
        let mut lock = ExclusionLock::acquire(td.path()).expect("acquire");
        assert!(lock_path(td.path()).exists());
        lock.release().expect("release");
        assert!(!lock_path(td.path()).exists());
    }

    #[test]
    fn second_acquire_fails_with_bundle_already_applying() {
        let td = tempdir().expect("tempdir");
        let _lock1 = ExclusionLock::acquire(td.path()).expect("first acquire");

        let err = ExclusionLock::acquire(td.path()).unwrap_err();
        assert!(err.to_string().contains("bundle-already-applying"));
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().expect("tempdir");
        {
            let _lock = ExclusionLock::acquire(td.path()).expect("acquire");
            assert!(lock_path(td.path()).exists());
        }
        assert!(!lock_path(td.path()).exists());
    }

    #[test]
    fn set_bundle_id_updates_lock() {
        let td = tempdir().expect("tempdir");
        let lock = ExclusionLock::acquire(td.path()).expect("acquire");
        lock.set_bundle_id("acme.bundle").expect("set bundle id");

        let info = ExclusionLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.bundle_id, Some("acme.bundle".to_string()));
    }

    #[test]
    fn acquire_with_timeout_recovers_stale_lock() {
        let td = tempdir().expect("tempdir");
        let path = lock_path(td.path());
        let stale = LockInfo {
            pid: 99999,
            hostname: "dead-host".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            bundle_id: None,
        };
        write_lock_info(&path, &stale).expect("write stale");

        let _lock = ExclusionLock::acquire_with_timeout(td.path(), Duration::from_secs(3600))
            .expect("recovers stale lock");
        let info = ExclusionLock::read_lock_info(td.path()).expect("read info");
        assert_ne!(info.pid, 99999);
    }

    #[test]
    fn acquire_with_timeout_respects_fresh_lock() {
        let td = tempdir().expect("tempdir");
        let _lock1 = ExclusionLock::acquire(td.path()).expect("first acquire");
        let err = ExclusionLock::acquire_with_timeout(td.path(), Duration::from_secs(3600))
            .unwrap_err();
        assert!(err.to_string().contains("bundle-already-applying"));
    }
}
