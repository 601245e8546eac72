//! End-to-end scenario coverage for the bundle lifecycle, exercising the public
//! `Session`/`RegistrationManager`/`CacheManager` surfaces together the way a single bundle run
//! would, rather than one module in isolation.

use std::collections::HashSet;

use waypoint::cache::{CacheManager, CacheRoots};
use waypoint::executor::PackageDriver;
use waypoint::registration::RegistrationManager;
use waypoint::session::{Session, SessionConfig, SessionHost, SilentHost};
use waypoint_types::{
    ArpMetadata, ArpModifyPolicy, BundleIdentity, CurrentState, EngineError, ExitCodeClass, Package,
    PackageAction, PackageKind, Packaging, Payload, PayloadState, Provider, RequestedAction, SessionMode,
    Version,
};

fn identity(id: &str, per_machine: bool) -> BundleIdentity {
    BundleIdentity {
        id: id.into(),
        provider_key: format!("{id}.Provider"),
        version: Version(1, 0, 0, 0),
        tag: None,
        upgrade_codes: Vec::new(),
        detect_codes: Vec::new(),
        addon_codes: Vec::new(),
        patch_codes: Vec::new(),
        per_machine,
    }
}

fn arp(name: &str) -> ArpMetadata {
    ArpMetadata {
        display_name: name.into(),
        display_version: "1.0.0".into(),
        publisher: "Acme".into(),
        help_url: None,
        modify_policy: ArpModifyPolicy::Enabled,
    }
}

fn config(dir: &std::path::Path, id: &str, per_machine: bool) -> SessionConfig {
    SessionConfig {
        identity: identity(id, per_machine),
        arp: arp(id),
        state_dir: dir.to_path_buf(),
        scope_root: dir.to_path_buf(),
        mode: SessionMode::Normal,
        original_args: vec!["waypoint.exe".into()],
    }
}

struct AlwaysOk;
impl PackageDriver for AlwaysOk {
    fn execute(&self, _package: &Package, _action: PackageAction) -> Result<ExitCodeClass, EngineError> {
        Ok(ExitCodeClass::Ok)
    }
}

/// Fails every `Install` of `target`, succeeds (and records) everything else, including its own
/// rollback `Uninstall`.
struct FailsInstallOf {
    target: String,
}
impl PackageDriver for FailsInstallOf {
    fn execute(&self, package: &Package, action: PackageAction) -> Result<ExitCodeClass, EngineError> {
        if package.id == self.target && action == PackageAction::Install {
            return Err(EngineError::PackageFailed { package_id: package.id.clone(), class: ExitCodeClass::Error });
        }
        Ok(ExitCodeClass::Ok)
    }
}

/// S1 — single EXE install, no reboot: plan acquires the payload, installs the package, and
/// registers its provider; resume-mode ends at `arp`.
#[test]
fn s1_single_exe_install_registers_provider_and_ends_at_arp() {
    let td = tempfile::tempdir().unwrap();
    let mut host = SilentHost;
    let mut session = Session::initialize(config(td.path(), "{P}", false), &mut host).unwrap();

    let mut pkg = Package::new("P", PackageKind::Exe, "P.cache");
    pkg.payload_refs = vec!["P.payload".into()];
    pkg.providers = vec!["P.Provider".into()];

    std::fs::write(td.path().join("payload.bin"), b"exe-bytes").unwrap();
    let hash = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"exe-bytes");
        hex::encode(hasher.finalize())
    };
    let payload = Payload {
        key: "P.payload".into(),
        packaging: Packaging::Embedded,
        container_id: None,
        file_path_relative: "payload.bin".into(),
        expected_size: b"exe-bytes".len() as u64,
        expected_hash: Some(hash),
        certificate_identifier: None,
        catalog: None,
        state: PayloadState::None,
    };

    session.load_manifest(vec![pkg], vec![payload], vec![], vec![]);
    session.detect(false, &mut host).unwrap();

    let plan = session.plan(RequestedAction::Install, &mut host).unwrap();
    assert_eq!(plan.totals.packages_total, 1);

    let outcome = session.apply(&plan, &AlwaysOk, &mut host).unwrap();
    assert!(outcome.failed.is_none());
    assert_eq!(outcome.succeeded, vec!["P".to_string()]);
    assert_eq!(session.quit(&outcome), 0);

    // spec.md §8 invariant 1: a successful apply leaves the payload in the completed cache.
    let completed = td.path().join("cache").join("completed").join("P.cache").join("payload.bin");
    assert!(completed.exists(), "payload should be present in the completed cache after apply");
}

/// S2 — two packages in one boundary; the second fails and rollback undoes the first.
#[test]
fn s2_msi_install_fails_and_rolls_back_prior_package() {
    let td = tempfile::tempdir().unwrap();
    let mut host = SilentHost;
    let mut session = Session::initialize(config(td.path(), "{AB}", false), &mut host).unwrap();

    let a = Package::new("A", PackageKind::Msi, "A.cache");
    let b = Package::new("B", PackageKind::Msi, "B.cache");
    session.load_manifest(vec![a, b], vec![], vec![], vec![]);
    session.detect(false, &mut host).unwrap();

    let plan = session.plan(RequestedAction::Install, &mut host).unwrap();
    let driver = FailsInstallOf { target: "B".to_string() };
    let outcome = session.apply(&plan, &driver, &mut host).unwrap();

    assert!(outcome.failed.is_some());
    assert!(outcome.rolled_back);
    assert_eq!(outcome.succeeded, vec!["A".to_string()]);
    // quit() maps a package failure to the Error exit class, not success.
    assert_ne!(session.quit(&outcome), 0);
}

/// S4 — uninstalling a package another bundle still depends on is refused at plan time, while
/// uninstalling it once that bundle is the only remaining dependent proceeds.
#[test]
fn s4_uninstall_blocked_while_other_bundle_depends_on_provider_then_allowed_once_alone() {
    let td = tempfile::tempdir().unwrap();
    let mut mgr = RegistrationManager::open(td.path(), identity("{X}", false), arp("X")).unwrap();
    mgr.providers_mut().register(
        "K",
        Provider { key: "K".into(), version: Some(Version(1, 0, 0, 0)), display_name: "K".into(), dependents: vec!["{Y}".into()] },
    );
    mgr.persist().unwrap();

    let mut pkg = Package::new("P", PackageKind::Msi, "P.cache");
    pkg.current_state = CurrentState::Present;
    pkg.vital = true;
    pkg.providers = vec!["K".into()];

    let mut providers = std::collections::BTreeMap::new();
    providers.insert("K".to_string(), mgr.providers().get("K").cloned().unwrap());

    let blocked_input = waypoint::plan::PlanInput {
        action: RequestedAction::Uninstall,
        items: vec![waypoint::plan::PlanItem { package: pkg.clone(), rollback_boundary_id: None }],
        boundaries: vec![],
        providers: providers.clone(),
        self_bundle_id: "{X}".into(),
        original_args: vec!["waypoint.exe".into()],
    };
    assert!(waypoint::plan::compute_plan(&blocked_input).is_err());

    // `{Y}` uninstalls first; the provider now has no dependents besides `{X}` itself.
    mgr.providers_mut().remove_dependent("K", "{Y}").unwrap();
    mgr.persist().unwrap();
    providers.insert("K".to_string(), mgr.providers().get("K").cloned().unwrap());

    let allowed_input = waypoint::plan::PlanInput { providers, ..blocked_input };
    let plan = waypoint::plan::compute_plan(&allowed_input).unwrap();
    assert!(plan.execute_actions.iter().any(|a| matches!(
        a,
        waypoint_types::ExecuteAction::ExecutePackage { action: PackageAction::Uninstall, .. }
    )));
}

/// S5 — a command-line override of an overridable variable takes effect before Detect; an
/// override of a non-overridable variable is rejected and the manifest default is kept.
#[test]
fn s5_command_line_override_applies_before_detect_and_rejects_non_overridable() {
    let td = tempfile::tempdir().unwrap();
    let mut host = SilentHost;
    let mut session = Session::initialize(config(td.path(), "{V}", false), &mut host).unwrap();
    session.variables.set_string("InstallFolder", "C:\\Default").unwrap();
    session.variables.set_string("SecretKey", "manifest-default").unwrap();

    let overridable: HashSet<String> = ["InstallFolder".to_string()].into_iter().collect();
    let overrides = vec![
        ("InstallFolder".to_string(), "C:\\Custom".to_string()),
        ("SecretKey".to_string(), "xyz".to_string()),
    ];

    struct RecordingHost {
        rejected: Vec<String>,
    }
    impl SessionHost for RecordingHost {
        fn on_event(&mut self, event: waypoint_types::EngineEvent) {
            if let waypoint_types::EngineEvent::VariableOverrideRejected { name } = event {
                self.rejected.push(name);
            }
        }
    }
    let mut recorder = RecordingHost { rejected: Vec::new() };

    session.apply_command_line_overrides(&overrides, &overridable, &mut recorder);
    session.detect(false, &mut host).unwrap();

    assert_eq!(session.variables.get_string("InstallFolder").as_deref(), Some("C:\\Custom"));
    assert_eq!(session.variables.get_string("SecretKey").as_deref(), Some("manifest-default"));
    assert_eq!(recorder.rejected, vec!["SecretKey".to_string()]);
}

/// S6 — a payload fails verification (size mismatch) on the first attempt and succeeds once
/// rewritten with the correct bytes; exactly one file ends up at the completed cache path.
#[test]
fn s6_cache_verification_failure_then_successful_retry_leaves_one_completed_file() {
    let td = tempfile::tempdir().unwrap();
    let roots = CacheRoots { working_root: td.path().join("work"), completed_root: td.path().join("done") };
    let manager = CacheManager::new(roots);

    let package = Package::new("P", PackageKind::Exe, "P.cache");
    let mut payload = Payload {
        key: "P.payload".into(),
        packaging: Packaging::Embedded,
        container_id: None,
        file_path_relative: "payload.bin".into(),
        expected_size: 4,
        expected_hash: None,
        certificate_identifier: None,
        catalog: None,
        state: PayloadState::Acquired,
    };

    let unverified = manager.calculate_working_path("{P}", waypoint::cache::WorkingPathKind::Payload(payload.file_path_relative.clone())).unwrap();
    manager.ensure_working_folder("{P}").unwrap();

    // First attempt: wrong size, verification fails and nothing is cached.
    std::fs::write(&unverified, b"bad").unwrap();
    let first = manager.complete_payload(false, &mut payload, &package, &unverified, true);
    assert!(matches!(first, Err(EngineError::VerifyFailed { .. })));

    // Retry: correct bytes, verification succeeds.
    std::fs::write(&unverified, b"good").unwrap();
    manager.complete_payload(false, &mut payload, &package, &unverified, true).unwrap();
    assert_eq!(payload.state, PayloadState::Cached);

    let completed = manager.completed_payload_path(false, &package, &payload).unwrap();
    assert!(completed.exists());
    assert_eq!(std::fs::read(&completed).unwrap(), b"good");
}
