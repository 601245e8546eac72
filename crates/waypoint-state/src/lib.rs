//! Registration & Resume state for a bundle's apply session.
//!
//! This crate tracks per-package progress across a single Apply, persists it
//! to disk so a crashed or interrupted session can be resumed (`spec.md`
//! §4.5, §4.9), and produces an `ApplySessionReceipt` summarizing the
//! outcome once the session reaches a terminal state.
//!
//! # Example
//!
//! ```
//! use waypoint_state::{RegistrationState, StateStore, state_path};
//! use waypoint_types::{CurrentState, ResumeMode};
//! use std::path::Path;
//!
//! let mut state = RegistrationState::new("{11111111-1111-1111-1111-111111111111}");
//! state.set_package_state("pkgA", CurrentState::Present);
//!
//! let store = StateStore::new(Path::new("/var/lib/waypoint/bundles/mybundle"));
//! store.save(&state).expect("save");
//!
//! let loaded = store.load().expect("load");
//! assert_eq!(loaded.bundle_id(), "{11111111-1111-1111-1111-111111111111}");
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use waypoint_types::{CurrentState, EngineError, ResumeMode};

/// Default state file name.
pub const STATE_FILE: &str = "registration.json";

/// Get the state file path for a bundle's state directory.
pub fn state_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATE_FILE)
}

/// Per-package outcome recorded in a `RegistrationState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PackageOutcome {
    Pending,
    Current(CurrentState),
    Failed { message: String },
    Skipped { reason: String },
}

/// Persisted, resumable state of one bundle's apply session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationState {
    /// The bundle's stable identity (`spec.md` §3, `BundleIdentity.bundle_id`).
    bundle_id: String,
    /// When this state was first created.
    created_at: DateTime<Utc>,
    /// When this state was last updated.
    updated_at: DateTime<Utc>,
    /// Current resume mode for this bundle (`spec.md` §4.9).
    resume_mode: ResumeMode,
    /// Outcome of each package, keyed by package id.
    packages: HashMap<String, PackageOutcome>,
    /// Number of apply attempts made against this registration.
    attempt_count: u32,
    /// Message from the most recent failure, if any.
    last_error: Option<String>,
}

impl RegistrationState {
    /// Create a new registration state for `bundle_id`.
    pub fn new(bundle_id: &str) -> Self {
        let now = Utc::now();
        Self {
            bundle_id: bundle_id.to_string(),
            created_at: now,
            updated_at: now,
            resume_mode: ResumeMode::None,
            packages: HashMap::new(),
            attempt_count: 0,
            last_error: None,
        }
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn resume_mode(&self) -> ResumeMode {
        self.resume_mode
    }

    pub fn set_resume_mode(&mut self, mode: ResumeMode) {
        self.resume_mode = mode;
        self.updated_at = Utc::now();
    }

    /// Record that a package reached `state` (a terminal, non-error outcome).
    pub fn set_package_state(&mut self, package_id: &str, state: CurrentState) {
        self.packages.insert(package_id.to_string(), PackageOutcome::Current(state));
        self.updated_at = Utc::now();
    }

    pub fn get_package_outcome(&self, package_id: &str) -> Option<&PackageOutcome> {
        self.packages.get(package_id)
    }

    pub fn packages(&self) -> &HashMap<String, PackageOutcome> {
        &self.packages
    }

    pub fn mark_failed(&mut self, package_id: &str, error: &EngineError) {
        self.packages.insert(
            package_id.to_string(),
            PackageOutcome::Failed { message: error.to_string() },
        );
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    pub fn mark_skipped(&mut self, package_id: &str, reason: &str) {
        self.packages
            .insert(package_id.to_string(), PackageOutcome::Skipped { reason: reason.to_string() });
        self.updated_at = Utc::now();
    }

    pub fn increment_attempts(&mut self) {
        self.attempt_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// All packages reached a terminal outcome (no `Pending` left).
    pub fn is_complete(&self) -> bool {
        self.packages.values().all(|o| !matches!(o, PackageOutcome::Pending))
    }

    pub fn pending_packages(&self) -> Vec<&str> {
        self.packages
            .iter()
            .filter(|(_, o)| matches!(o, PackageOutcome::Pending))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn failed_packages(&self) -> Vec<&str> {
        self.packages
            .iter()
            .filter(|(_, o)| matches!(o, PackageOutcome::Failed { .. }))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn succeeded_packages(&self) -> Vec<&str> {
        self.packages
            .iter()
            .filter(|(_, o)| matches!(o, PackageOutcome::Current(CurrentState::Present)))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Reset all per-package progress, keeping identity and attempt history.
    /// Used when a bundle is re-applied from scratch rather than resumed.
    pub fn clear_progress(&mut self) {
        self.packages.clear();
        self.last_error = None;
        self.updated_at = Utc::now();
    }
}

/// Persistent, atomic-write store for one bundle's `RegistrationState`.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a new state store rooted at `state_dir` (typically
    /// `<root>/Bundles/<bundle_id>`, `spec.md` §6).
    pub fn new(state_dir: &Path) -> Self {
        Self { path: state_path(state_dir) }
    }

    pub fn save(&self, state: &RegistrationState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("tmp");

        let json =
            serde_json::to_string_pretty(state).context("failed to serialize registration state")?;

        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write state file {}", tmp_path.display()))?;

        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename state file to {}", self.path.display()))?;

        Ok(())
    }

    pub fn load(&self) -> Result<RegistrationState> {
        if !self.path.exists() {
            anyhow::bail!("registration state not found: {}", self.path.display());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state file {}", self.path.display()))?;

        let state: RegistrationState = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse registration state from {}", self.path.display()))?;

        Ok(state)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to delete state file {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Summary of a completed apply session, appended to a per-bundle log so a
/// later `waypoint-cli` invocation (or a support engineer) can see apply
/// history without replaying the full event trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySessionReceipt {
    pub bundle_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub succeeded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub total_attempts: u32,
    pub success: bool,
}

impl ApplySessionReceipt {
    pub fn from_state(state: &RegistrationState) -> Self {
        let succeeded = state.succeeded_packages().into_iter().map(String::from).collect();
        let failed = state.failed_packages().into_iter().map(String::from).collect();
        let skipped = state
            .packages()
            .iter()
            .filter(|(_, o)| matches!(o, PackageOutcome::Skipped { .. }))
            .map(|(id, _)| id.clone())
            .collect();

        Self {
            bundle_id: state.bundle_id().to_string(),
            started_at: state.created_at(),
            completed_at: state.updated_at(),
            succeeded,
            skipped,
            failed,
            total_attempts: state.attempt_count(),
            success: state.failed_packages().is_empty(),
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// Get the receipts log path for a bundle's state directory.
pub fn receipts_path(state_dir: &Path) -> PathBuf {
    state_dir.join("receipts.jsonl")
}

/// Append a receipt to the per-bundle receipts log.
pub fn append_receipt(state_dir: &Path, receipt: &ApplySessionReceipt) -> Result<()> {
    let path = receipts_path(state_dir);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state dir {}", parent.display()))?;
    }

    let line = serde_json::to_string(receipt).context("failed to serialize receipt")?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open receipts file {}", path.display()))?;

    use std::io::Write;
    writeln!(file, "{line}").with_context(|| format!("failed to write receipt to {}", path.display()))?;

    Ok(())
}
