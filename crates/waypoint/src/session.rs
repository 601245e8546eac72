//! Session / Lifecycle (`spec.md` §4.9): the top-level `CoreInitialize →
//! CoreDetect → CorePlan → CoreElevate → CoreApply → CoreQuit` sequence that
//! drives a single run of the bundle in `normal` mode, plus the engine-state
//! serialization the sequence checkpoints against before anything that could
//! fail catastrophically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use waypoint_types::{BundleIdentity, CurrentState, EngineEvent, Package, Payload, RequestedAction, ResumeMode, ResumeType, SessionMode};

use crate::cache::{CacheManager, CacheRoots};
use crate::encrypt::{EncryptionConfig, StateEncryption};
use crate::executor::{self, ApplyOutcome, ExecuteListContext, PackageDriver};
use crate::plan::{self, PlanInput, PlanItem};
use crate::registration::RegistrationManager;
use crate::variables::Variables;

/// Environment variable carrying the passphrase for encrypting persisted hidden
/// variable values (`spec.md` §4.5). Unset means `variables.bin` stays plaintext.
const ENCRYPT_KEY_ENV: &str = "WAYPOINT_ENCRYPT_KEY";

fn state_encryption() -> StateEncryption {
    StateEncryption::new(EncryptionConfig::from_env(ENCRYPT_KEY_ENV.to_string()))
        .expect("encryption config construction is infallible")
}

/// Callbacks the host (UI thread or CLI front-end) supplies for the notification points
/// `spec.md` §4.9 describes — each returns a policy decision synchronously, mirroring the
/// "notification window message, synchronous return value" shape of the original sequence.
pub trait SessionHost {
    fn on_startup(&mut self) {}
    fn on_detect_complete(&mut self, _resume_type: ResumeType) {}
    fn on_plan_complete(&mut self, _plan: &waypoint_types::Plan) {}
    fn on_apply_complete(&mut self, _outcome: &ApplyOutcome) {}
    fn on_event(&mut self, _event: EngineEvent) {}
}

/// A host that ignores every notification; useful for non-interactive callers (the `runonce`
/// relaunch, `embedded` mode driven entirely by its parent, or tests).
pub struct SilentHost;
impl SessionHost for SilentHost {}

/// The fixed inputs a session needs before `CoreInitialize` — everything the manifest loader
/// would otherwise have produced (`spec.md` §6 notes the loader is out of core's scope).
pub struct SessionConfig {
    pub identity: BundleIdentity,
    pub arp: waypoint_types::ArpMetadata,
    pub state_dir: PathBuf,
    pub scope_root: PathBuf,
    pub mode: SessionMode,
    pub original_args: Vec<String>,
}

/// Live state threaded through a session: the registration directory, the variable store, and
/// the packages/providers/boundaries the detect phase will populate from the manifest.
pub struct Session {
    config: SessionConfig,
    pub variables: Variables,
    pub registration: RegistrationManager,
    packages: HashMap<String, Package>,
    payloads: HashMap<String, Payload>,
    boundaries: Vec<waypoint_types::RollbackBoundary>,
    searches: Vec<waypoint_search::Search>,
    cache: Arc<CacheManager>,
}

impl Session {
    /// `CoreInitialize`: open (or create) the registration directory, load persisted variables
    /// if any, and report what resume state we're starting from.
    pub fn initialize(config: SessionConfig, host: &mut impl SessionHost) -> Result<Self> {
        host.on_startup();

        let registration = RegistrationManager::open(&config.state_dir, config.identity.clone(), config.arp.clone())
            .context("failed to open registration state")?;

        let variables = Variables::new();
        let serialized_path = config.state_dir.join("variables.bin");
        if serialized_path.exists() {
            let content = state_encryption()
                .read_file(&serialized_path)
                .context("failed to read persisted variables")?;
            variables.deserialize(content.as_bytes(), true).context("failed to deserialize persisted variables")?;
        }

        let cache = Arc::new(CacheManager::new(CacheRoots {
            working_root: config.scope_root.join("cache").join("work"),
            completed_root: config.scope_root.join("cache").join("completed"),
        }));

        Ok(Session {
            config,
            variables,
            registration,
            packages: HashMap::new(),
            payloads: HashMap::new(),
            boundaries: Vec::new(),
            searches: Vec::new(),
            cache,
        })
    }

    pub fn mode(&self) -> SessionMode {
        self.config.mode
    }

    /// Register the packages, payloads, searches, and rollback boundaries this run operates
    /// over. Stands in for the manifest-driven population `spec.md` §6 assigns to the external
    /// loader.
    pub fn load_manifest(
        &mut self,
        packages: Vec<Package>,
        payloads: Vec<Payload>,
        searches: Vec<waypoint_search::Search>,
        boundaries: Vec<waypoint_types::RollbackBoundary>,
    ) {
        self.packages = packages.into_iter().map(|p| (p.id.clone(), p)).collect();
        self.payloads = payloads.into_iter().map(|p| (p.key.clone(), p)).collect();
        self.searches = searches;
        self.boundaries = boundaries;
    }

    /// Apply `Name=Value` command-line overrides against the manifest's declared overridable
    /// variables, logging a warning event for any rejected name. Must run before `detect` so
    /// the overridden value is visible to every condition the session evaluates afterward.
    pub fn apply_command_line_overrides(
        &mut self,
        overrides: &[(String, String)],
        overridable: &std::collections::HashSet<String>,
        host: &mut impl SessionHost,
    ) {
        for name in self.variables.apply_command_line_overrides(overrides, overridable) {
            host.on_event(EngineEvent::VariableOverrideRejected { name });
        }
    }

    /// `CoreDetect`: classify why we're starting (fresh run vs resumed) from the persisted
    /// resume mode and whether a reboot is pending on the host, then notify the caller.
    pub fn detect(&mut self, reboot_pending_on_host: bool, host: &mut impl SessionHost) -> Result<ResumeType> {
        for search in &self.searches {
            let should_run = match &search.condition {
                Some(expr) => self
                    .variables
                    .evaluate_condition(expr)
                    .with_context(|| format!("search '{}' condition failed to evaluate", search.key))?,
                None => true,
            };
            if !should_run {
                continue;
            }

            let mut raw: HashMap<String, String> = HashMap::new();
            waypoint_search::execute(search, &mut raw)
                .with_context(|| format!("search '{}' failed", search.key))?;
            if let Some(value) = raw.get(&search.target_variable) {
                self.variables.set_string(&search.target_variable, value.clone())?;
            }
            host.on_event(EngineEvent::SearchExecuted { key: search.key.clone(), target_variable: search.target_variable.clone() });
        }

        let resume_type = crate::registration::detect_resume_type(self.registration.resume_mode(), reboot_pending_on_host);
        host.on_detect_complete(resume_type);
        Ok(resume_type)
    }

    /// `CorePlan`: compute the plan for `action` over the currently loaded packages.
    pub fn plan(&mut self, action: RequestedAction, host: &mut impl SessionHost) -> Result<waypoint_types::Plan> {
        let items: Vec<PlanItem> = self
            .packages
            .values()
            .cloned()
            .map(|package| {
                let rollback_boundary_id = package.rollback_boundary_ref.clone();
                PlanItem { package, rollback_boundary_id }
            })
            .collect();

        let providers = self
            .registration
            .providers()
            .get(&self.registration.identity().provider_key)
            .cloned()
            .map(|p| (p.key.clone(), p))
            .into_iter()
            .collect();

        let input = PlanInput {
            action,
            items,
            boundaries: self.boundaries.clone(),
            providers,
            self_bundle_id: self.registration.identity().id.clone(),
            original_args: self.config.original_args.clone(),
        };

        let computed = plan::compute_plan(&input).context("failed to compute plan")?;
        host.on_event(EngineEvent::PlanComputed {
            action: format!("{:?}", action),
            packages_total: computed.totals.packages_total,
        });
        host.on_plan_complete(&computed);
        Ok(computed)
    }

    /// Does this plan touch per-machine state and therefore need `CoreElevate` before Apply.
    pub fn needs_elevation(&self) -> bool {
        self.config.mode == SessionMode::Normal && self.packages.values().any(|p| p.per_machine)
    }

    /// `CoreElevate`: generate the one-time secret and nonce an elevated child would need, and
    /// return them for the host to pass on the child's launch command line. Establishing the
    /// pipe transport itself is left to the host (`spec.md` §4.8 step 1-3 are OS-specific).
    pub fn elevate(&mut self) -> (String, Vec<u8>) {
        let secret = crate::elevation::generate_secret();
        let nonce = secret.as_bytes().to_vec();
        (secret, nonce)
    }

    /// `CoreApply`: serialize engine state first (so a crash mid-apply can still resume from the
    /// last checkpoint), acquire the exclusion lock, run the execute list, and persist the
    /// outcome through Registration.
    pub fn apply(
        &mut self,
        plan: &waypoint_types::Plan,
        driver: &dyn PackageDriver,
        host: &mut impl SessionHost,
    ) -> Result<ApplyOutcome> {
        self.serialize_engine_state().context("failed to checkpoint engine state before apply")?;

        self.registration.register_begin().context("failed to begin apply session")?;

        let scope_root = self.config.scope_root.clone();
        let bundle_id = self.registration.identity().id.clone();
        let ctx = ExecuteListContext {
            cache_actions: plan.cache_actions.clone(),
            packages: self.packages.clone(),
            payloads: self.payloads.clone(),
            cache: Arc::clone(&self.cache),
            bundle_id: bundle_id.clone(),
            source_dir: scope_root.clone(),
        };
        let registration = &mut self.registration;
        let host_ref = &mut *host;

        let outcome = executor::with_exclusion_lock(&scope_root, &bundle_id, move || {
            executor::run_execute_list(
                &ctx,
                &plan.execute_actions,
                &plan.rollback_actions,
                &plan.registration_actions,
                driver,
                registration,
                |event| host_ref.on_event(event),
            )
        })
        .map_err(|e| anyhow::anyhow!("apply failed to acquire exclusion lock or run: {e:?}"))?;

        self.registration.register_end(outcome.failed.is_some()).context("failed to close apply session")?;
        host.on_apply_complete(&outcome);
        Ok(outcome)
    }

    /// `CoreQuit`: map the apply outcome to a process exit code, following the same
    /// reboot-aware classification the package drivers use for individual exit codes.
    pub fn quit(&self, outcome: &ApplyOutcome) -> i32 {
        match &outcome.failed {
            None => waypoint_types::exit_code_for(waypoint_types::ExitCodeClass::Ok, false),
            Some(waypoint_types::EngineError::Cancelled) => {
                waypoint_types::exit_code_for(waypoint_types::ExitCodeClass::Ok, true)
            }
            Some(waypoint_types::EngineError::PackageFailed { class, .. }) => {
                waypoint_types::exit_code_for(*class, false)
            }
            Some(_) => waypoint_types::exit_code_for(waypoint_types::ExitCodeClass::Error, false),
        }
    }

    /// `CoreSerializeEngineState`: write every persisted variable plus enough session state to
    /// resume to `<state_dir>/variables.bin`.
    pub fn serialize_engine_state(&self) -> Result<()> {
        let bytes = self.variables.serialize(true).context("failed to serialize variables")?;
        std::fs::create_dir_all(&self.config.state_dir)
            .with_context(|| format!("failed to create state dir {}", self.config.state_dir.display()))?;
        let path = self.config.state_dir.join("variables.bin");
        state_encryption().write_file(&path, &bytes).with_context(|| format!("failed to write {}", path.display()))
    }

    /// `CoreSaveEngineState`: push the serialized blob to Registration. In `normal` mode with a
    /// per-machine bundle this would cross the elevated channel (`spec.md` §4.9); unprivileged
    /// per-user bundles and already-elevated sessions write it directly.
    pub fn save_engine_state(&mut self, channel: Option<&mut crate::elevation::Channel<impl std::io::Read + std::io::Write>>) -> Result<()> {
        self.serialize_engine_state()?;
        if let Some(channel) = channel {
            let bytes = self.variables.serialize(true).context("failed to serialize variables")?;
            channel
                .send(&crate::elevation::Message { message_type: crate::elevation::MessageType::ElevatedOperation, payload: bytes })
                .context("failed to push engine state over elevated channel")?;
        }
        Ok(())
    }

    pub fn package(&self, id: &str) -> Option<&Package> {
        self.packages.get(id)
    }

    pub fn set_package_current_state(&mut self, id: &str, state: CurrentState) -> Result<()> {
        if let Some(pkg) = self.packages.get_mut(id) {
            pkg.current_state = state;
        }
        self.registration.set_package_state(id, state)
    }

    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_types::{ArpMetadata, ArpModifyPolicy, ExitCodeClass, PackageAction, PackageKind, Version};

    fn config(dir: &Path) -> SessionConfig {
        SessionConfig {
            identity: BundleIdentity {
                id: "{22222222-2222-2222-2222-222222222222}".into(),
                provider_key: "Acme.Bundle".into(),
                version: Version(1, 0, 0, 0),
                tag: None,
                upgrade_codes: Vec::new(),
                detect_codes: Vec::new(),
                addon_codes: Vec::new(),
                patch_codes: Vec::new(),
                per_machine: false,
            },
            arp: ArpMetadata {
                display_name: "Acme Bundle".into(),
                display_version: "1.0.0".into(),
                publisher: "Acme".into(),
                help_url: None,
                modify_policy: ArpModifyPolicy::Enabled,
            },
            state_dir: dir.to_path_buf(),
            scope_root: dir.to_path_buf(),
            mode: SessionMode::Normal,
            original_args: vec!["bundle.exe".into()],
        }
    }

    struct AlwaysOk;
    impl PackageDriver for AlwaysOk {
        fn execute(&self, _package: &Package, _action: PackageAction) -> Result<ExitCodeClass, waypoint_types::EngineError> {
            Ok(ExitCodeClass::Ok)
        }
    }

    #[test]
    fn initialize_creates_fresh_session_with_no_prior_state() {
        let td = tempfile::tempdir().unwrap();
        let mut host = SilentHost;
        let session = Session::initialize(config(td.path()), &mut host).unwrap();
        assert_eq!(session.registration.resume_mode(), ResumeMode::None);
    }

    #[test]
    fn detect_reports_none_for_fresh_bundle() {
        let td = tempfile::tempdir().unwrap();
        let mut host = SilentHost;
        let mut session = Session::initialize(config(td.path()), &mut host).unwrap();
        assert_eq!(session.detect(false, &mut host).unwrap(), ResumeType::None);
    }

    #[test]
    fn full_lifecycle_install_succeeds_and_quits_zero() {
        let td = tempfile::tempdir().unwrap();
        let mut host = SilentHost;
        let mut session = Session::initialize(config(td.path()), &mut host).unwrap();
        session.load_manifest(vec![Package::new("PkgA", PackageKind::Msi, "PkgA.cache")], vec![], vec![], vec![]);
        session.detect(false, &mut host).unwrap();

        let computed = session.plan(RequestedAction::Install, &mut host).unwrap();
        assert!(!session.needs_elevation());

        let outcome = session.apply(&computed, &AlwaysOk, &mut host).unwrap();
        assert!(outcome.failed.is_none());
        assert_eq!(session.quit(&outcome), 0);
    }

    #[test]
    fn serialize_engine_state_round_trips_persisted_variables() {
        let td = tempfile::tempdir().unwrap();
        let mut host = SilentHost;
        let session = Session::initialize(config(td.path()), &mut host).unwrap();
        session.variables.set_string("InstallFolder", "C:\\Acme").unwrap();
        session.variables.set_persisted("InstallFolder", true);
        session.serialize_engine_state().unwrap();

        let reloaded = Session::initialize(config(td.path()), &mut host).unwrap();
        assert_eq!(reloaded.variables.get_string("InstallFolder").as_deref(), Some("C:\\Acme"));
    }

    #[test]
    fn detect_runs_searches_and_populates_variables() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("marker.txt"), b"present").unwrap();
        let mut host = SilentHost;
        let mut session = Session::initialize(config(td.path()), &mut host).unwrap();

        let unconditional = waypoint_search::Search {
            key: "FindMarker".into(),
            target_variable: "MarkerExists".into(),
            condition: None,
            body: waypoint_search::SearchBody::FileExists { path: td.path().join("marker.txt").to_string_lossy().into_owned() },
        };
        let skipped = waypoint_search::Search {
            key: "NeverRuns".into(),
            target_variable: "ShouldStayUnset".into(),
            condition: Some("0".into()),
            body: waypoint_search::SearchBody::FileExists { path: "/nonexistent".into() },
        };
        session.load_manifest(vec![], vec![], vec![unconditional, skipped], vec![]);

        struct RecordingHost {
            executed: Vec<String>,
        }
        impl SessionHost for RecordingHost {
            fn on_event(&mut self, event: EngineEvent) {
                if let EngineEvent::SearchExecuted { key, .. } = event {
                    self.executed.push(key);
                }
            }
        }
        let mut recorder = RecordingHost { executed: Vec::new() };

        session.detect(false, &mut recorder).unwrap();

        assert_eq!(session.variables.get_string("MarkerExists").as_deref(), Some("1"));
        assert_eq!(session.variables.get_string("ShouldStayUnset"), None);
        assert_eq!(recorder.executed, vec!["FindMarker".to_string()]);
    }

    #[test]
    fn needs_elevation_reflects_per_machine_packages() {
        let td = tempfile::tempdir().unwrap();
        let mut host = SilentHost;
        let mut session = Session::initialize(config(td.path()), &mut host).unwrap();
        let mut pkg = Package::new("PkgA", PackageKind::Msi, "PkgA.cache");
        pkg.per_machine = true;
        session.load_manifest(vec![pkg], vec![], vec![], vec![]);
        assert!(session.needs_elevation());
    }
}
