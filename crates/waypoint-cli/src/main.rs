use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use waypoint::executor::PackageDriver;
use waypoint::session::{Session, SessionConfig, SessionHost};
use waypoint_types::{ArpMetadata, BundleIdentity, EngineError, ExitCodeClass, Package, PackageAction, Payload, RequestedAction, RollbackBoundary, SessionMode};

mod progress;

/// The manifest format this CLI reads in place of the out-of-scope declarative loader
/// (`spec.md` §6 notes the real manifest is "consumed by the external loader, not core" — this
/// is the JSON shape that loader would hand the engine).
#[derive(Debug, Deserialize)]
struct Manifest {
    identity: BundleIdentity,
    arp: ArpMetadata,
    packages: Vec<Package>,
    #[serde(default)]
    payloads: Vec<Payload>,
    #[serde(default)]
    searches: Vec<waypoint_search::Search>,
    #[serde(default)]
    boundaries: Vec<RollbackBoundary>,
    /// Variable names the manifest permits overriding from the command line.
    #[serde(default)]
    overridable_variables: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(name = "waypoint", version)]
#[command(about = "Chained-package bundle installer engine")]
struct Cli {
    /// Path to the bundle's JSON manifest.
    #[arg(long, default_value = "manifest.json")]
    manifest: PathBuf,

    /// Directory for registration and resume state (default: .waypoint-state)
    #[arg(long, default_value = ".waypoint-state")]
    state_dir: PathBuf,

    /// Parent bundle id, when launched as a dependent bundle (`-parent <id>`).
    #[arg(long = "parent")]
    parent: Option<String>,

    /// Rerun self from the cache after first-launch copy (`-clean-room`).
    #[arg(long = "clean-room")]
    clean_room: bool,

    /// Run in elevated mode: `-elevated <pipe-name> <secret> <parent-pid>`.
    #[arg(long = "elevated", num_args = 3, value_names = ["PIPE", "SECRET", "PARENT_PID"])]
    elevated: Option<Vec<String>>,

    /// Run in embedded mode: `-embedded <pipe-name> <secret> <parent-pid>`.
    #[arg(long = "embedded", num_args = 3, value_names = ["PIPE", "SECRET", "PARENT_PID"])]
    embedded: Option<Vec<String>>,

    /// Resume from stored state after a reboot (`-runonce`).
    #[arg(long = "runonce")]
    runonce: bool,

    /// Append (not overwrite) the log file (`-log-append <path>`).
    #[arg(long = "log-append")]
    log_append: Option<PathBuf>,

    /// Override the dependent-present check for the named providers (`-ignoredependencies`).
    #[arg(long = "ignoredependencies", value_delimiter = ';')]
    ignore_dependencies: Vec<String>,

    /// Ancestor bundle-id chain, used to detect relaunch cycles (`-ancestors`).
    #[arg(long = "ancestors", value_delimiter = ';')]
    ancestors: Vec<String>,

    /// `Name=Value` variable override, checked against the manifest's
    /// `overridable_variables` list. May be passed more than once.
    #[arg(long = "var")]
    vars: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

/// Parses trailing `Name=Value` CLI arguments, skipping (and keeping silent about) any argument
/// with no `=` rather than treating it as a malformed override.
fn parse_variable_overrides(vars: &[String]) -> Vec<(String, String)> {
    vars.iter()
        .filter_map(|arg| arg.split_once('=').map(|(name, value)| (name.to_string(), value.to_string())))
        .collect()
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute and print the plan without applying it.
    Plan,
    /// Install the bundle's packages.
    Install,
    /// Uninstall the bundle's packages.
    Uninstall,
    /// Repair already-present packages.
    Repair,
    /// Run modify actions against already-present packages.
    Modify,
    /// Print resume mode and per-package registration status.
    Status,
    /// Print environment and state-directory diagnostics.
    Doctor,
}

/// Dispatches each `ExecutePackage` action to the package's driver executable, named by
/// convention as `<package_id>-driver` on `PATH` (the concrete driver program is named by the
/// manifest in a real deployment; this CLI's minimal stand-in keeps that naming convention).
struct ProcessPackageDriver {
    working_dir: PathBuf,
}

impl PackageDriver for ProcessPackageDriver {
    fn execute(&self, package: &Package, action: PackageAction) -> Result<ExitCodeClass, EngineError> {
        let verb = match action {
            PackageAction::Install => "install",
            PackageAction::Uninstall => "uninstall",
            PackageAction::Repair => "repair",
            PackageAction::Modify => "modify",
            PackageAction::None => return Ok(ExitCodeClass::Ok),
        };
        let program = format!("{}-driver", package.id);
        if !waypoint_process::driver_exists(&program) {
            return Err(EngineError::PackageFailed { package_id: package.id.clone(), class: ExitCodeClass::Error });
        }
        let output = waypoint_process::run_driver(&program, &[verb], &self.working_dir, None)
            .map_err(|e| EngineError::FatalSystem(e.to_string()))?;
        Ok(package.exit_code_map.classify(output.exit_code))
    }
}

struct CliHost {
    progress: Option<progress::ProgressReporter>,
}

impl SessionHost for CliHost {
    fn on_startup(&mut self) {
        eprintln!("[info] waypoint engine starting");
    }

    fn on_detect_complete(&mut self, resume_type: waypoint_types::ResumeType) {
        eprintln!("[info] detect complete: resume_type={resume_type:?}");
    }

    fn on_plan_complete(&mut self, plan: &waypoint_types::Plan) {
        eprintln!("[info] plan complete: {} package(s), estimated size {} bytes", plan.totals.packages_total, plan.totals.estimated_size);
        self.progress = Some(progress::ProgressReporter::new(plan.totals.packages_total as usize));
    }

    fn on_event(&mut self, event: waypoint_types::EngineEvent) {
        if let waypoint_types::EngineEvent::PackageExecuteStarted { package_id } = &event {
            if let Some(reporter) = &mut self.progress {
                reporter.set_package(1, package_id, "");
            }
        }
        if let waypoint_types::EngineEvent::VariableOverrideRejected { name } = &event {
            eprintln!("[warn] rejected command-line override for non-overridable variable {name}");
            return;
        }
        eprintln!("[event] {event:?}");
    }

    fn on_apply_complete(&mut self, outcome: &waypoint::executor::ApplyOutcome) {
        if let Some(reporter) = self.progress.take() {
            reporter.finish();
        }
        match &outcome.failed {
            None => eprintln!("[info] apply complete: {} package(s) succeeded", outcome.succeeded.len()),
            Some(err) => eprintln!("[error] apply failed: {err:?} (rolled_back={})", outcome.rolled_back),
        }
    }
}

fn load_manifest(path: &PathBuf) -> Result<Manifest> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read manifest {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse manifest {}", path.display()))
}

fn session_mode(cli: &Cli) -> SessionMode {
    if cli.elevated.is_some() {
        SessionMode::Elevated
    } else if cli.embedded.is_some() {
        SessionMode::Embedded
    } else if cli.runonce {
        SessionMode::RunOnce
    } else {
        SessionMode::Normal
    }
}

fn action_for(cmd: &Commands) -> Option<RequestedAction> {
    match cmd {
        Commands::Install => Some(RequestedAction::Install),
        Commands::Uninstall => Some(RequestedAction::Uninstall),
        Commands::Repair => Some(RequestedAction::Repair),
        Commands::Modify => Some(RequestedAction::Modify),
        Commands::Plan => Some(RequestedAction::Install),
        Commands::Status | Commands::Doctor => None,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let original_args: Vec<String> = std::env::args().collect();

    match &cli.cmd {
        Commands::Status => return run_status(&cli),
        Commands::Doctor => return run_doctor(&cli),
        _ => {}
    }

    let manifest = load_manifest(&cli.manifest)?;
    let scope_root = cli.state_dir.clone();

    let config = SessionConfig {
        identity: manifest.identity,
        arp: manifest.arp,
        state_dir: cli.state_dir.clone(),
        scope_root,
        mode: session_mode(&cli),
        original_args,
    };

    let mut host = CliHost { progress: None };
    let mut session = Session::initialize(config, &mut host)?;
    session.load_manifest(manifest.packages, manifest.payloads, manifest.searches, manifest.boundaries);

    let overridable: std::collections::HashSet<String> = manifest.overridable_variables.into_iter().collect();
    let overrides = parse_variable_overrides(&cli.vars);
    session.apply_command_line_overrides(&overrides, &overridable, &mut host);

    let reboot_pending = false;
    session.detect(reboot_pending, &mut host)?;

    let action = action_for(&cli.cmd).expect("status/doctor handled above");
    let computed = session.plan(action, &mut host)?;

    if matches!(cli.cmd, Commands::Plan) {
        print_plan(&computed);
        return Ok(());
    }

    if session.needs_elevation() {
        eprintln!("[info] plan touches per-machine state; would relaunch elevated (not performed by this demo CLI)");
    }

    let driver = ProcessPackageDriver { working_dir: cli.state_dir.clone() };
    let outcome = session.apply(&computed, &driver, &mut host)?;
    let exit_code = session.quit(&outcome);
    std::process::exit(exit_code);
}

fn print_plan(plan: &waypoint_types::Plan) {
    println!("action: {:?}", plan.action);
    println!("packages_total: {}", plan.totals.packages_total);
    println!("estimated_size: {}", plan.totals.estimated_size);
    println!();
    for action in &plan.execute_actions {
        println!("{action:?}");
    }
}

fn run_status(cli: &Cli) -> Result<()> {
    let manifest = load_manifest(&cli.manifest)?;
    let store = waypoint::state::StateStore::new(&cli.state_dir);
    if !store.exists() {
        println!("no registration state found under {}", cli.state_dir.display());
        return Ok(());
    }
    let state = store.load().context("failed to load registration state")?;
    println!("bundle_id: {}", manifest.identity.id);
    println!("resume_mode: {:?}", state.resume_mode());
    for package in &manifest.packages {
        match state.get_package_outcome(&package.id) {
            Some(outcome) => println!("{}: {outcome:?}", package.id),
            None => println!("{}: pending", package.id),
        }
    }
    Ok(())
}

fn run_doctor(cli: &Cli) -> Result<()> {
    println!("state_dir: {}", cli.state_dir.display());
    println!("state_dir_exists: {}", cli.state_dir.exists());
    println!("lock_held: {}", waypoint::lock::ExclusionLock::is_locked(&cli.state_dir).unwrap_or(false));
    println!("manifest: {}", cli.manifest.display());
    println!("manifest_readable: {}", load_manifest(&cli.manifest).is_ok());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_mode_prefers_elevated_over_other_flags() {
        let cli = Cli {
            manifest: "m.json".into(),
            state_dir: ".state".into(),
            parent: None,
            clean_room: false,
            elevated: Some(vec!["pipe".into(), "secret".into(), "123".into()]),
            embedded: None,
            runonce: true,
            log_append: None,
            ignore_dependencies: vec![],
            ancestors: vec![],
            vars: vec![],
            cmd: Commands::Install,
        };
        assert_eq!(session_mode(&cli), SessionMode::Elevated);
    }

    #[test]
    fn session_mode_defaults_to_normal() {
        let cli = Cli {
            manifest: "m.json".into(),
            state_dir: ".state".into(),
            parent: None,
            clean_room: false,
            elevated: None,
            embedded: None,
            runonce: false,
            log_append: None,
            ignore_dependencies: vec![],
            ancestors: vec![],
            vars: vec![],
            cmd: Commands::Install,
        };
        assert_eq!(session_mode(&cli), SessionMode::Normal);
    }

    #[test]
    fn action_for_maps_each_command() {
        assert_eq!(action_for(&Commands::Install), Some(RequestedAction::Install));
        assert_eq!(action_for(&Commands::Uninstall), Some(RequestedAction::Uninstall));
        assert_eq!(action_for(&Commands::Repair), Some(RequestedAction::Repair));
        assert_eq!(action_for(&Commands::Modify), Some(RequestedAction::Modify));
        assert_eq!(action_for(&Commands::Status), None);
        assert_eq!(action_for(&Commands::Doctor), None);
    }

    #[test]
    fn parse_variable_overrides_splits_on_first_equals_and_skips_malformed() {
        let vars = vec!["InstallFolder=C:\\Custom".to_string(), "SecretKey=xyz".to_string(), "no-equals-sign".to_string()];
        let parsed = parse_variable_overrides(&vars);
        assert_eq!(
            parsed,
            vec![
                ("InstallFolder".to_string(), "C:\\Custom".to_string()),
                ("SecretKey".to_string(), "xyz".to_string()),
            ]
        );
    }

    #[test]
    fn load_manifest_reports_missing_file() {
        let result = load_manifest(&PathBuf::from("does-not-exist.json"));
        assert!(result.is_err());
    }

    #[test]
    fn load_manifest_parses_minimal_bundle() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{
                "identity": {
                    "id": "{X}", "provider_key": "Acme", "version": [1,0,0,0], "tag": null,
                    "upgrade_codes": [], "detect_codes": [], "addon_codes": [], "patch_codes": [],
                    "per_machine": false
                },
                "arp": {
                    "display_name": "Acme", "display_version": "1.0", "publisher": "Acme",
                    "help_url": null, "modify_policy": "Enabled"
                },
                "packages": [],
                "boundaries": []
            }"#,
        )
        .unwrap();
        let manifest = load_manifest(&path).unwrap();
        assert_eq!(manifest.identity.id, "{X}");
        assert!(manifest.packages.is_empty());
    }
}
