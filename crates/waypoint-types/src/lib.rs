//! Core domain types for the waypoint bundle engine.
//!
//! This crate defines the data model shared by every other `waypoint*`
//! crate: bundle identity, containers, payloads, packages, the plan
//! produced by the planner, the variant-typed variable store, and the
//! error taxonomy the executor and cache manager classify failures
//! into. Nothing here performs I/O; it is pure data plus the small
//! amount of logic (variant comparison, state-transition tables) that
//! has to live next to the types it operates on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Four-field version, matching the `v<0..65535>.<0..65535>.<0..65535>.<0..65535>` literal
/// grammar used in condition expressions and package version comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u16, pub u16, pub u16, pub u16);

impl Version {
    pub const ZERO: Version = Version(0, 0, 0, 0);

    /// Packs the four fields into the `u64` layout the original engine uses on the wire.
    pub fn as_packed(&self) -> u64 {
        (self.0 as u64) << 48 | (self.1 as u64) << 32 | (self.2 as u64) << 16 | self.3 as u64
    }

    pub fn from_packed(packed: u64) -> Self {
        Version(
            ((packed >> 48) & 0xffff) as u16,
            ((packed >> 32) & 0xffff) as u16,
            ((packed >> 16) & 0xffff) as u16,
            (packed & 0xffff) as u16,
        )
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0, self.1, self.2, self.3)
    }
}

/// The tagged union a [`Variable`] holds, matching `BURN_VARIANT` in the original engine's
/// header: at most one of numeric, string, or version is present at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Variant {
    None,
    Numeric(i64),
    String(String),
    Version(Version),
}

impl Variant {
    /// Truthiness used when a bare identifier appears as a condition operand: empty string,
    /// zero, and zero version are false; `None` is false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Variant::None => false,
            Variant::Numeric(n) => *n != 0,
            Variant::String(s) => !s.is_empty(),
            Variant::Version(v) => *v != Version::ZERO,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::None => "none",
            Variant::Numeric(_) => "numeric",
            Variant::String(_) => "string",
            Variant::Version(_) => "version",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::None => write!(f, ""),
            Variant::Numeric(n) => write!(f, "{n}"),
            Variant::String(s) => write!(f, "{s}"),
            Variant::Version(v) => write!(f, "{v}"),
        }
    }
}

/// A single entry in the Variables store.
///
/// `generation` increments every time [`Variant`] changes, so callers can detect "has this
/// changed since I last looked" without a string comparison (mirrors `BURN_VARIABLE.dwVersion`
/// in the original engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: Variant,
    pub hidden: bool,
    pub literal: bool,
    pub persisted: bool,
    pub built_in: bool,
    pub generation: u64,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: Variant) -> Self {
        Variable {
            name: name.into(),
            value,
            hidden: false,
            literal: false,
            persisted: false,
            built_in: false,
            generation: 0,
        }
    }
}

/// Packaging source of a [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packaging {
    Embedded,
    External,
    Download,
}

/// State machine a payload moves through during acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadState {
    None,
    Acquired,
    Cached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub key: String,
    pub packaging: Packaging,
    pub container_id: Option<String>,
    pub file_path_relative: String,
    pub expected_size: u64,
    pub expected_hash: Option<String>,
    pub certificate_identifier: Option<String>,
    pub catalog: Option<String>,
    pub state: PayloadState,
}

/// Container attribute kind: a cabinet-like archive allowing random access, or a generic
/// sequential archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerType {
    CabinetLike,
    GenericArchive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub container_type: ContainerType,
    pub primary: bool,
    pub attached: bool,
    pub attached_offset: Option<u64>,
    pub expected_size: u64,
    pub expected_hash: Option<String>,
}

/// The four package drivers the core dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageKind {
    Exe,
    Msi,
    Msp,
    Msu,
}

/// Outcome an external driver's exit code is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCodeClass {
    Ok,
    Error,
    ScheduleReboot,
    ForceReboot,
}

/// Maps a raw process exit code to an [`ExitCodeClass`]. Packages without an explicit mapping
/// use the convention `0 => Ok`, `3010 => ScheduleReboot`, `1641 => ForceReboot`, anything else
/// `Error` — the same convention the original engine's default exit-code map uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitCodeMap {
    pub entries: std::collections::BTreeMap<i32, ExitCodeClass>,
}

impl ExitCodeMap {
    pub fn classify(&self, code: i32) -> ExitCodeClass {
        if let Some(class) = self.entries.get(&code) {
            return *class;
        }
        match code {
            0 => ExitCodeClass::Ok,
            3010 => ExitCodeClass::ScheduleReboot,
            1641 => ExitCodeClass::ForceReboot,
            _ => ExitCodeClass::Error,
        }
    }
}

/// Detected, pre-plan state of a package on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrentState {
    Absent,
    Cached,
    Present,
    Superseded,
    Obsolete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheState {
    None,
    Partial,
    Complete,
}

/// What the planner decided should happen to a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestedState {
    None,
    Present,
    Absent,
    Repair,
}

/// A concrete, directed action the executor performs for one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageAction {
    None,
    Install,
    Uninstall,
    Repair,
    Modify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub kind: PackageKind,
    pub cache_id: String,
    pub per_machine: bool,
    pub uninstallable: bool,
    pub vital: bool,
    pub permanent: bool,
    pub install_size: u64,
    pub payload_refs: Vec<String>,
    pub providers: Vec<String>,
    pub detect_condition: Option<String>,
    pub install_condition: Option<String>,
    pub rollback_boundary_ref: Option<String>,
    pub exit_code_map: ExitCodeMap,

    // Post-detect mutable state.
    pub current_state: CurrentState,
    pub cache_state: CacheState,

    // Post-plan mutable state.
    pub expected_state: CurrentState,
    pub requested_state: RequestedState,
    pub execute_action: PackageAction,
    pub rollback_action: PackageAction,
}

impl Package {
    pub fn new(id: impl Into<String>, kind: PackageKind, cache_id: impl Into<String>) -> Self {
        Package {
            id: id.into(),
            kind,
            cache_id: cache_id.into(),
            per_machine: false,
            uninstallable: true,
            vital: false,
            permanent: false,
            install_size: 0,
            payload_refs: Vec::new(),
            providers: Vec::new(),
            detect_condition: None,
            install_condition: None,
            rollback_boundary_ref: None,
            exit_code_map: ExitCodeMap::default(),
            current_state: CurrentState::Absent,
            cache_state: CacheState::None,
            expected_state: CurrentState::Absent,
            requested_state: RequestedState::None,
            execute_action: PackageAction::None,
            rollback_action: PackageAction::None,
        }
    }
}

/// A provider key registered by a bundle or package, and the bundle ids depending on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provider {
    pub key: String,
    pub version: Option<Version>,
    pub display_name: String,
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackBoundary {
    pub id: String,
    pub vital: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleIdentity {
    pub id: String,
    pub provider_key: String,
    pub version: Version,
    pub tag: Option<String>,
    pub upgrade_codes: Vec<String>,
    pub detect_codes: Vec<String>,
    pub addon_codes: Vec<String>,
    pub patch_codes: Vec<String>,
    pub per_machine: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArpMetadata {
    pub display_name: String,
    pub display_version: String,
    pub publisher: String,
    pub help_url: Option<String>,
    pub modify_policy: ArpModifyPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArpModifyPolicy {
    Enabled,
    Disabled,
    ButtonHidden,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub identity: BundleIdentity,
    pub arp: ArpMetadata,
}

/// Requested top-level action, the planner's sole input besides detected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestedAction {
    Install,
    Repair,
    Modify,
    Uninstall,
    Layout,
    Help,
    UpdateReplace,
}

/// One step in a cache, execute, rollback, registration, or clean action list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheAction {
    AcquireContainer { container_id: String },
    ExtractContainer { container_id: String },
    AcquirePayload { payload_key: String },
    CachePayload { payload_key: String, package_id: String },
    LayoutPayload { payload_key: String, dest: String },
    PackageStart { package_id: String },
    PackageStop { package_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecuteAction {
    Checkpoint { id: u64 },
    RollbackBoundaryBegin { boundary_id: String },
    RollbackBoundaryComplete { boundary_id: String },
    WaitSyncPoint { package_id: String },
    ExecutePackage { package_id: String, action: PackageAction },
    PackageProvider { package_id: String, provider_key: String, register: bool },
    PackageDependency { package_id: String, dependent_id: String, register: bool },
    UncachePackage { package_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RollbackAction {
    ExecutePackage { package_id: String, action: PackageAction },
    PackageProvider { package_id: String, provider_key: String, register: bool },
    PackageDependency { package_id: String, dependent_id: String, register: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistrationAction {
    WriteArp { package_id: String },
    RemoveArp { package_id: String },
    RegisterProvider { package_id: String, provider_key: String },
    UnregisterProvider { package_id: String, provider_key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CleanAction {
    RemovePackageCache { package_id: String, cache_id: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanTotals {
    pub packages_total: u64,
    pub progress_ticks_total: u64,
    pub estimated_size: i64,
    pub cache_size_total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub action: RequestedAction,
    pub cache_actions: Vec<CacheAction>,
    pub rollback_cache_actions: Vec<CacheAction>,
    pub execute_actions: Vec<ExecuteAction>,
    pub rollback_actions: Vec<RollbackAction>,
    pub clean_actions: Vec<CleanAction>,
    pub registration_actions: Vec<RegistrationAction>,
    pub rollback_registration_actions: Vec<RegistrationAction>,
    pub totals: PlanTotals,
    pub resume_command_line: Vec<String>,
}

impl Plan {
    pub fn empty(action: RequestedAction) -> Self {
        Plan {
            action,
            cache_actions: Vec::new(),
            rollback_cache_actions: Vec::new(),
            execute_actions: Vec::new(),
            rollback_actions: Vec::new(),
            clean_actions: Vec::new(),
            registration_actions: Vec::new(),
            rollback_registration_actions: Vec::new(),
            totals: PlanTotals::default(),
            resume_command_line: Vec::new(),
        }
    }
}

/// Persisted resume mode, the state machine in registration §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeMode {
    None,
    Active,
    Suspend,
    Arp,
    RebootPending,
}

/// Result of `detect_resume_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeType {
    None,
    Invalid,
    Unexpected,
    RebootPending,
    Reboot,
    Suspend,
    Arp,
}

/// Session mode, `spec.md` §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    Untrusted,
    Normal,
    Elevated,
    Embedded,
    RunOnce,
}

/// Executor-level failure taxonomy, `spec.md` §4.7.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    Cancelled,
    InvalidManifest(String),
    DownloadFailed { payload_key: String, reason: String },
    ExtractFailed { container_id: String, reason: String },
    VerifyFailed { payload_key: String, reason: String },
    PackageFailed { package_id: String, class: ExitCodeClass },
    FileInUse { files: Vec<String> },
    DependentPresent { package_id: String, dependents: Vec<String> },
    PipeDisconnect,
    LockContention,
    RollbackBoundaryFailed { boundary_id: String },
    FatalSystem(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Cancelled => write!(f, "apply cancelled by user"),
            EngineError::InvalidManifest(msg) => write!(f, "invalid manifest: {msg}"),
            EngineError::DownloadFailed { payload_key, reason } => {
                write!(f, "download failed for payload {payload_key}: {reason}")
            }
            EngineError::ExtractFailed { container_id, reason } => {
                write!(f, "extract failed for container {container_id}: {reason}")
            }
            EngineError::VerifyFailed { payload_key, reason } => {
                write!(f, "verify failed for payload {payload_key}: {reason}")
            }
            EngineError::PackageFailed { package_id, class } => {
                write!(f, "package {package_id} failed with class {class:?}")
            }
            EngineError::FileInUse { files } => write!(f, "files in use: {}", files.join(", ")),
            EngineError::DependentPresent { package_id, dependents } => write!(
                f,
                "package {package_id} has remaining dependents: {}",
                dependents.join(", ")
            ),
            EngineError::PipeDisconnect => write!(f, "elevated process pipe disconnected"),
            EngineError::LockContention => write!(f, "bundle-already-applying"),
            EngineError::RollbackBoundaryFailed { boundary_id } => {
                write!(f, "rollback boundary {boundary_id} failed")
            }
            EngineError::FatalSystem(msg) => write!(f, "fatal system error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Exit code the process returns, per `spec.md` §6.
pub fn exit_code_for(class: ExitCodeClass, cancelled: bool) -> i32 {
    if cancelled {
        return 1602;
    }
    match class {
        ExitCodeClass::Ok => 0,
        ExitCodeClass::ScheduleReboot => 3010,
        ExitCodeClass::ForceReboot => 1641,
        ExitCodeClass::Error => 1,
    }
}

/// Timestamped envelope used by every persisted record that needs a creation/update pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Timestamps {
    pub fn new(now: DateTime<Utc>) -> Self {
        Timestamps { created_at: now, updated_at: now }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// One structured record in the ambient event trail (`waypoint-events`).
///
/// This is the internal replacement for the out-of-scope UI progress/log sink named in
/// `spec.md` §1: every component appends here instead of calling a concrete logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    PlanComputed { action: String, packages_total: u64 },
    SearchExecuted { key: String, target_variable: String },
    CacheAcquireStarted { payload_key: String },
    CacheAcquireFinished { payload_key: String, ok: bool },
    PackageExecuteStarted { package_id: String },
    PackageExecuteFinished { package_id: String, class: ExitCodeClass },
    RollbackBoundaryFired { boundary_id: String },
    ElevationConnected { child_pid: Option<u32> },
    ElevationRejected { reason: String },
    ResumeModeChanged { from: ResumeMode, to: ResumeMode },
    VariableOverrideRejected { name: String },
}

impl EngineEvent {
    /// The package this event is about, if any — used for per-package event filtering.
    pub fn package_id(&self) -> Option<&str> {
        match self {
            EngineEvent::CacheAcquireStarted { payload_key } => Some(payload_key),
            EngineEvent::CacheAcquireFinished { payload_key, .. } => Some(payload_key),
            EngineEvent::PackageExecuteStarted { package_id } => Some(package_id),
            EngineEvent::PackageExecuteFinished { package_id, .. } => Some(package_id),
            _ => None,
        }
    }
}
