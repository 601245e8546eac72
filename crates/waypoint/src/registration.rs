//! Registration & Resume (`spec.md` §4.5).
//!
//! Wraps [`waypoint_state`]'s per-bundle `RegistrationState`/`StateStore` with
//! the identity/ARP/provider-dependent bookkeeping and the resume-mode state
//! machine, persisting providers through [`waypoint_store`]'s `FileStore`.
//! Hidden variable values are the sensitive part of engine state; those are
//! persisted (and optionally encrypted through [`waypoint_encrypt`]) alongside
//! the rest of Variables in [`crate::session`], not here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use waypoint_state::{ApplySessionReceipt, RegistrationState};
use waypoint_store::FileStore;
use waypoint_types::{ArpMetadata, BundleIdentity, CurrentState, EngineError, Provider, ResumeMode, ResumeType};

const PROVIDERS_FILE: &str = "providers.json";

/// Providers this bundle has registered, and the dependents recorded against each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderRegistry {
    providers: HashMap<String, Provider>,
}

impl ProviderRegistry {
    pub fn register(&mut self, key: &str, provider: Provider) {
        self.providers.insert(key.to_string(), provider);
    }

    pub fn unregister(&mut self, key: &str) -> Option<Provider> {
        self.providers.remove(key)
    }

    pub fn add_dependent(&mut self, provider_key: &str, dependent_bundle_id: &str) -> Result<()> {
        let provider = self
            .providers
            .get_mut(provider_key)
            .with_context(|| format!("no such provider: {provider_key}"))?;
        if !provider.dependents.iter().any(|d| d == dependent_bundle_id) {
            provider.dependents.push(dependent_bundle_id.to_string());
        }
        Ok(())
    }

    pub fn remove_dependent(&mut self, provider_key: &str, dependent_bundle_id: &str) -> Result<()> {
        let provider = self
            .providers
            .get_mut(provider_key)
            .with_context(|| format!("no such provider: {provider_key}"))?;
        provider.dependents.retain(|d| d != dependent_bundle_id);
        Ok(())
    }

    /// Dependents remaining on a provider other than `excluding_bundle_id`; used to implement
    /// the "DependentPresent" refusal when uninstalling a package other bundles still need.
    pub fn remaining_dependents(&self, provider_key: &str, excluding_bundle_id: &str) -> Vec<String> {
        self.providers
            .get(provider_key)
            .map(|p| p.dependents.iter().filter(|d| d.as_str() != excluding_bundle_id).cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Provider> {
        self.providers.get(key)
    }
}

/// Orchestrates a bundle's registration directory: identity/ARP, resume mode, per-package
/// outcomes, and the provider/dependent graph.
pub struct RegistrationManager {
    state_dir: PathBuf,
    identity: BundleIdentity,
    arp: ArpMetadata,
    state: RegistrationState,
    providers: ProviderRegistry,
}

impl RegistrationManager {
    /// Load existing registration state for `identity`, or start a fresh one.
    pub fn open(state_dir: &Path, identity: BundleIdentity, arp: ArpMetadata) -> Result<Self> {
        let store = waypoint_state::StateStore::new(state_dir);
        let state = if store.exists() {
            store.load().context("failed to load registration state")?
        } else {
            RegistrationState::new(&identity.id)
        };

        let providers = FileStore::new(state_dir.to_path_buf())
            .load_json::<ProviderRegistry>(PROVIDERS_FILE)
            .context("failed to load provider registry")?
            .unwrap_or_default();

        Ok(RegistrationManager { state_dir: state_dir.to_path_buf(), identity, arp, state, providers })
    }

    pub fn identity(&self) -> &BundleIdentity {
        &self.identity
    }

    pub fn arp(&self) -> &ArpMetadata {
        &self.arp
    }

    pub fn resume_mode(&self) -> ResumeMode {
        self.state.resume_mode()
    }

    /// Begin (or resume) an apply session: bump the attempt counter and persist immediately so
    /// a crash right after this call still leaves a record that an attempt was made.
    pub fn register_begin(&mut self) -> Result<()> {
        self.state.increment_attempts();
        self.set_resume_mode(ResumeMode::Active)?;
        self.persist()
    }

    /// End an apply session: drop back to `None` (success/clean finish) or `Arp` (failures the
    /// user should be able to retry from Add/Remove Programs), and append the session receipt.
    pub fn register_end(&mut self, had_failures: bool) -> Result<ApplySessionReceipt> {
        self.set_resume_mode(if had_failures { ResumeMode::Arp } else { ResumeMode::None })?;
        let receipt = ApplySessionReceipt::from_state(&self.state);
        waypoint_state::append_receipt(&self.state_dir, &receipt)?;
        self.persist()?;
        Ok(receipt)
    }

    pub fn set_resume_mode(&mut self, mode: ResumeMode) -> Result<()> {
        let from = self.state.resume_mode();
        if !is_valid_resume_transition(from, mode) {
            bail!("invalid resume mode transition: {from:?} -> {mode:?}");
        }
        self.state.set_resume_mode(mode);
        Ok(())
    }

    pub fn set_package_state(&mut self, package_id: &str, state: CurrentState) -> Result<()> {
        self.state.set_package_state(package_id, state);
        self.persist()
    }

    pub fn mark_failed(&mut self, package_id: &str, error: &EngineError) -> Result<()> {
        self.state.mark_failed(package_id, error);
        self.persist()
    }

    pub fn mark_skipped(&mut self, package_id: &str, reason: &str) -> Result<()> {
        self.state.mark_skipped(package_id, reason);
        self.persist()
    }

    pub fn providers_mut(&mut self) -> &mut ProviderRegistry {
        &mut self.providers
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn pending_packages(&self) -> Vec<&str> {
        self.state.pending_packages()
    }

    /// Reset per-package progress for a fresh (non-resumed) apply of the same bundle.
    pub fn clear_progress(&mut self) -> Result<()> {
        self.state.clear_progress();
        self.persist()
    }

    pub fn persist(&self) -> Result<()> {
        waypoint_state::StateStore::new(&self.state_dir)
            .save(&self.state)
            .context("failed to persist registration state")?;
        FileStore::new(self.state_dir.clone())
            .save_json(PROVIDERS_FILE, &self.providers)
            .context("failed to persist provider registry")
    }
}

/// Whether `from -> to` is a legal resume-mode transition (`spec.md` §4.5, §4.9):
/// `None -> Active`, `Active -> {None, Suspend, Arp, RebootPending}`, `Suspend -> Active`,
/// `RebootPending -> Active`, and every mode may return to itself (a redundant re-apply).
pub fn is_valid_resume_transition(from: ResumeMode, to: ResumeMode) -> bool {
    use ResumeMode::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (None, Active)
            | (Active, ResumeMode::None)
            | (Active, Suspend)
            | (Active, Arp)
            | (Active, RebootPending)
            | (Suspend, Active)
            | (RebootPending, Active)
            | (Arp, Active)
    )
}

/// Classify why the engine is starting up given the persisted resume mode and whether a
/// pending reboot was detected on the host (`spec.md` §4.9 `detect_resume_type`).
pub fn detect_resume_type(mode: ResumeMode, reboot_pending_on_host: bool) -> ResumeType {
    match mode {
        ResumeMode::None => ResumeType::None,
        ResumeMode::Active if reboot_pending_on_host => ResumeType::RebootPending,
        ResumeMode::Active => ResumeType::Unexpected,
        ResumeMode::Suspend => ResumeType::Suspend,
        ResumeMode::Arp => ResumeType::Arp,
        ResumeMode::RebootPending => ResumeType::Reboot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use waypoint_types::{ArpModifyPolicy, Version};

    fn identity() -> BundleIdentity {
        BundleIdentity {
            id: "{11111111-1111-1111-1111-111111111111}".into(),
            provider_key: "Acme.Bundle".into(),
            version: Version(1, 0, 0, 0),
            tag: None,
            upgrade_codes: Vec::new(),
            detect_codes: Vec::new(),
            addon_codes: Vec::new(),
            patch_codes: Vec::new(),
            per_machine: false,
        }
    }

    fn arp() -> ArpMetadata {
        ArpMetadata {
            display_name: "Acme Bundle".into(),
            display_version: "1.0.0".into(),
            publisher: "Acme".into(),
            help_url: None,
            modify_policy: ArpModifyPolicy::Enabled,
        }
    }

    #[test]
    fn register_begin_then_end_round_trips_through_disk() {
        let td = tempdir().unwrap();
        let mut mgr = RegistrationManager::open(td.path(), identity(), arp()).unwrap();
        mgr.register_begin().unwrap();
        assert_eq!(mgr.resume_mode(), ResumeMode::Active);

        mgr.set_package_state("PkgA", CurrentState::Present).unwrap();
        let receipt = mgr.register_end(false).unwrap();
        assert!(receipt.success);
        assert_eq!(mgr.resume_mode(), ResumeMode::None);

        let reloaded = RegistrationManager::open(td.path(), identity(), arp()).unwrap();
        assert_eq!(reloaded.resume_mode(), ResumeMode::None);
    }

    #[test]
    fn register_end_with_failures_goes_to_arp() {
        let td = tempdir().unwrap();
        let mut mgr = RegistrationManager::open(td.path(), identity(), arp()).unwrap();
        mgr.register_begin().unwrap();
        mgr.mark_failed("PkgA", &EngineError::PackageFailed {
            package_id: "PkgA".into(),
            class: waypoint_types::ExitCodeClass::Error,
        })
        .unwrap();
        let receipt = mgr.register_end(true).unwrap();
        assert!(!receipt.success);
        assert_eq!(mgr.resume_mode(), ResumeMode::Arp);
    }

    #[test]
    fn invalid_resume_transition_rejected() {
        assert!(!is_valid_resume_transition(ResumeMode::None, ResumeMode::Suspend));
        assert!(!is_valid_resume_transition(ResumeMode::Arp, ResumeMode::Suspend));
        assert!(is_valid_resume_transition(ResumeMode::None, ResumeMode::Active));
        assert!(is_valid_resume_transition(ResumeMode::Active, ResumeMode::Suspend));
    }

    #[test]
    fn detect_resume_type_matches_table() {
        assert_eq!(detect_resume_type(ResumeMode::None, false), ResumeType::None);
        assert_eq!(detect_resume_type(ResumeMode::Active, false), ResumeType::Unexpected);
        assert_eq!(detect_resume_type(ResumeMode::Active, true), ResumeType::RebootPending);
        assert_eq!(detect_resume_type(ResumeMode::Suspend, false), ResumeType::Suspend);
        assert_eq!(detect_resume_type(ResumeMode::Arp, false), ResumeType::Arp);
        assert_eq!(detect_resume_type(ResumeMode::RebootPending, false), ResumeType::Reboot);
    }

    #[test]
    fn provider_registry_tracks_dependents() {
        let td = tempdir().unwrap();
        let mut mgr = RegistrationManager::open(td.path(), identity(), arp()).unwrap();
        mgr.providers_mut().register(
            "Acme.Bundle",
            Provider { key: "Acme.Bundle".into(), version: Some(Version(1, 0, 0, 0)), display_name: "Acme".into(), dependents: Vec::new() },
        );
        mgr.providers_mut().add_dependent("Acme.Bundle", "{OTHER-BUNDLE}").unwrap();
        assert_eq!(mgr.providers().remaining_dependents("Acme.Bundle", "{SELF}"), vec!["{OTHER-BUNDLE}".to_string()]);

        mgr.providers_mut().remove_dependent("Acme.Bundle", "{OTHER-BUNDLE}").unwrap();
        assert!(mgr.providers().remaining_dependents("Acme.Bundle", "{SELF}").is_empty());
    }

    #[test]
    fn providers_persist_across_reopen() {
        let td = tempdir().unwrap();
        let mut mgr = RegistrationManager::open(td.path(), identity(), arp()).unwrap();
        mgr.providers_mut().register(
            "Acme.Bundle",
            Provider { key: "Acme.Bundle".into(), version: None, display_name: "Acme".into(), dependents: vec!["{X}".into()] },
        );
        mgr.persist().unwrap();

        let reloaded = RegistrationManager::open(td.path(), identity(), arp()).unwrap();
        assert_eq!(reloaded.providers().get("Acme.Bundle").unwrap().dependents, vec!["{X}".to_string()]);
    }

    #[test]
    fn pending_packages_and_completion_tracking() {
        let td = tempdir().unwrap();
        let mut mgr = RegistrationManager::open(td.path(), identity(), arp()).unwrap();
        assert!(mgr.is_complete());
        mgr.set_package_state("PkgA", CurrentState::Present).unwrap();
        assert!(mgr.pending_packages().is_empty());
    }
}
