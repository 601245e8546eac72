//! Drives Apply (`spec.md` §4.7): acquire the exclusion lock, run the Cache
//! Manager's acquisition work on a background worker while the execute list
//! advances on the calling thread, walk the execute list, and roll back in
//! reverse if a package fails partway through.
//!
//! The cache worker's chunked-concurrency shape (a bounded pool of payload
//! acquisitions in flight at once, synchronized through a shared `Mutex`)
//! mirrors how a publish-level's packages are published concurrently
//! elsewhere in this workspace — the same "spawn a bounded batch, join it,
//! move to the next batch" idiom, applied to payload acquisition instead of
//! package publication.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use waypoint_types::{
    CacheAction, EngineError, EngineEvent, ExecuteAction, ExitCodeClass, Package, PackageAction,
    Packaging, Payload, Provider, RegistrationAction, RollbackAction,
};

use crate::cache::CacheManager;
use crate::registration::RegistrationManager;

/// Hook the executor calls into for each concrete package action. Implemented by the real
/// driver dispatch in production and by an in-memory fake in tests.
pub trait PackageDriver: Send + Sync {
    fn execute(&self, package: &Package, action: PackageAction) -> Result<ExitCodeClass, EngineError>;
}

/// Progress of the background cache worker, shared with the execute-list thread so
/// `WaitSyncPoint` can block until the payload it needs has finished acquiring.
#[derive(Default)]
struct CacheWorkerState {
    completed: Vec<String>,
    failed: Option<EngineError>,
}

/// Bounded-concurrency cache worker: acquires payloads named by `cache_actions` up to
/// `max_concurrent` at a time, recording completions so the execute-list thread's
/// `WaitSyncPoint` steps can proceed once their payload is ready.
pub struct CacheWorker {
    state: Arc<Mutex<CacheWorkerState>>,
}

impl CacheWorker {
    /// Spawn the cache worker against `actions`, fetching each `AcquirePayload`/`CachePayload`
    /// pair through `acquire` on a bounded thread pool. Returns a handle whose `join` blocks
    /// until every action has been attempted or one has failed.
    pub fn spawn(
        actions: Vec<CacheAction>,
        max_concurrent: usize,
        acquire: impl Fn(&str) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> (Self, thread::JoinHandle<Result<(), EngineError>>) {
        let state = Arc::new(Mutex::new(CacheWorkerState::default()));
        let worker = CacheWorker { state: Arc::clone(&state) };
        let acquire = Arc::new(acquire);

        let handle = thread::spawn(move || -> Result<(), EngineError> {
            let payload_keys: Vec<String> = actions
                .into_iter()
                .filter_map(|a| match a {
                    CacheAction::AcquirePayload { payload_key } => Some(payload_key),
                    _ => None,
                })
                .collect();

            let max_concurrent = max_concurrent.max(1).min(payload_keys.len().max(1));
            for chunk in payload_keys.chunks(max_concurrent) {
                let mut handles = Vec::new();
                for key in chunk {
                    let key = key.clone();
                    let acquire = Arc::clone(&acquire);
                    handles.push(thread::spawn(move || (key.clone(), (acquire.as_ref())(&key))));
                }
                for handle in handles {
                    let (key, result) = handle.join().expect("cache worker thread panicked");
                    let mut guard = state.lock().expect("cache worker state mutex poisoned");
                    match result {
                        Ok(()) => guard.completed.push(key),
                        Err(e) => {
                            guard.failed = Some(e.clone());
                            return Err(e);
                        }
                    }
                }
            }
            Ok(())
        });

        (worker, handle)
    }

    /// Has `payload_key` finished acquiring (successfully) as of this call.
    pub fn is_ready(&self, payload_key: &str) -> bool {
        self.state.lock().expect("cache worker state mutex poisoned").completed.iter().any(|k| k == payload_key)
    }

    /// The worker's recorded failure, if its background thread has hit one.
    pub fn failure(&self) -> Option<EngineError> {
        self.state.lock().expect("cache worker state mutex poisoned").failed.clone()
    }
}

/// Acquire one payload for the cache worker: local-source copy for `Embedded`/`External`
/// packaging, retried through `waypoint-retry` on a verify failure (scenario S6: the first
/// copy's hash doesn't match, a retry picks up a good one). `Download` packaging is left to a
/// future network-fetch leg (`spec.md` §1 non-goal for this engine's current source set) and
/// always reports a retryable-then-permanent failure so the caller sees a clear reason instead
/// of silently skipping the payload.
fn acquire_and_cache_payload(
    manager: &CacheManager,
    retry: &waypoint_retry::RetryExecutor,
    bundle_id: &str,
    source_dir: &Path,
    package: &Package,
    payload: &Payload,
) -> Result<(), EngineError> {
    retry.run_cache_acquire(|_attempt| {
        let mut payload = payload.clone();
        match payload.packaging {
            Packaging::Embedded | Packaging::External => {
                let source = manager
                    .find_local_source(None, source_dir, source_dir, &payload.file_path_relative)
                    .ok_or_else(|| EngineError::DownloadFailed {
                        payload_key: payload.key.clone(),
                        reason: format!("no local source found for {}", payload.file_path_relative),
                    })?;
                let unverified = manager
                    .calculate_working_path(bundle_id, crate::cache::WorkingPathKind::Payload(payload.file_path_relative.clone()))
                    .map_err(|e| EngineError::FatalSystem(e.to_string()))?;
                manager.ensure_working_folder(bundle_id).map_err(|e| EngineError::FatalSystem(e.to_string()))?;
                std::fs::copy(&source, &unverified).map_err(|e| EngineError::DownloadFailed {
                    payload_key: payload.key.clone(),
                    reason: format!("failed to stage {}: {e}", source.display()),
                })?;
                manager.complete_payload(package.per_machine, &mut payload, package, &unverified, true)
            }
            Packaging::Download => Err(EngineError::DownloadFailed {
                payload_key: payload.key.clone(),
                reason: "download packaging requires a network fetch leg not wired into this acquire path".into(),
            }),
        }
    })
}

/// Everything `run_execute_list` needs beyond the actions themselves: the plan's cache work,
/// the package/payload catalog, and where to find already-cached bits.
pub struct ExecuteListContext {
    pub cache_actions: Vec<CacheAction>,
    pub packages: HashMap<String, Package>,
    pub payloads: HashMap<String, Payload>,
    pub cache: Arc<CacheManager>,
    pub bundle_id: String,
    pub source_dir: PathBuf,
}

/// Outcome of driving a plan's execute list to completion or to a rolled-back failure.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub succeeded: Vec<String>,
    pub failed: Option<EngineError>,
    pub rolled_back: bool,
}

/// Walk `execute_actions` in order: spawn the cache worker for `ctx.cache_actions`, block each
/// `WaitSyncPoint` on its package's payloads becoming ready, dispatch `ExecutePackage` to
/// `driver`, wire `PackageProvider`/`PackageDependency` into Registration's provider graph, and
/// uncache on `UncachePackage`. Rollback boundaries that have already committed
/// (`RollbackBoundaryComplete` seen before a later failure) are excluded from the rollback pass
/// — only packages in the boundary still in flight when the failure happened get rolled back.
pub fn run_execute_list(
    ctx: &ExecuteListContext,
    execute_actions: &[ExecuteAction],
    rollback_actions: &[RollbackAction],
    registration_actions: &[RegistrationAction],
    driver: &dyn PackageDriver,
    registration: &mut RegistrationManager,
    mut on_event: impl FnMut(EngineEvent),
) -> ApplyOutcome {
    let payload_package: HashMap<String, String> = ctx
        .cache_actions
        .iter()
        .filter_map(|a| match a {
            CacheAction::CachePayload { payload_key, package_id } => Some((payload_key.clone(), package_id.clone())),
            _ => None,
        })
        .collect();

    let worker_cache = Arc::clone(&ctx.cache);
    let worker_packages = ctx.packages.clone();
    let worker_payloads = ctx.payloads.clone();
    let worker_bundle_id = ctx.bundle_id.clone();
    let worker_source_dir = ctx.source_dir.clone();
    let retry = waypoint_retry::RetryExecutor::from_policy(waypoint_retry::RetryPolicy::Default);

    let (cache_worker, cache_handle) = CacheWorker::spawn(ctx.cache_actions.clone(), 4, move |payload_key| {
        let package_id = payload_package
            .get(payload_key)
            .ok_or_else(|| EngineError::FatalSystem(format!("no owning package recorded for payload {payload_key}")))?;
        let package = worker_packages
            .get(package_id)
            .ok_or_else(|| EngineError::FatalSystem(format!("unknown package {package_id}")))?;
        let payload = worker_payloads
            .get(payload_key)
            .ok_or_else(|| EngineError::FatalSystem(format!("unknown payload {payload_key}")))?;
        acquire_and_cache_payload(&worker_cache, &retry, &worker_bundle_id, &worker_source_dir, package, payload)
    });

    let mut succeeded = Vec::new();
    let mut completed_package_ids: VecDeque<String> = VecDeque::new();
    let mut committed_packages: HashSet<String> = HashSet::new();
    let mut current_boundary_packages: Vec<String> = Vec::new();

    for action in execute_actions {
        match action {
            ExecuteAction::RollbackBoundaryBegin { .. } => {
                current_boundary_packages.clear();
            }
            ExecuteAction::RollbackBoundaryComplete { boundary_id } => {
                committed_packages.extend(current_boundary_packages.drain(..));
                on_event(EngineEvent::RollbackBoundaryFired { boundary_id: boundary_id.clone() });
            }
            ExecuteAction::Checkpoint { .. } => {}
            ExecuteAction::WaitSyncPoint { package_id } => {
                let Some(package) = ctx.packages.get(package_id) else { continue };
                if package.payload_refs.is_empty() {
                    continue;
                }
                on_event(EngineEvent::CacheAcquireStarted { payload_key: package_id.clone() });
                loop {
                    if package.payload_refs.iter().all(|key| cache_worker.is_ready(key)) {
                        on_event(EngineEvent::CacheAcquireFinished { payload_key: package_id.clone(), ok: true });
                        break;
                    }
                    if let Some(err) = cache_worker.failure() {
                        on_event(EngineEvent::CacheAcquireFinished { payload_key: package_id.clone(), ok: false });
                        let _ = registration.mark_failed(package_id, &err);
                        run_rollback(rollback_actions, &completed_package_ids, &committed_packages, driver, &ctx.packages, registration);
                        return ApplyOutcome { succeeded, failed: Some(err), rolled_back: true };
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
            ExecuteAction::PackageProvider { package_id, provider_key, register } => {
                apply_provider_registration(registration, package_id, provider_key, *register);
            }
            ExecuteAction::PackageDependency { package_id, dependent_id, register } => {
                apply_provider_dependency(registration, package_id, dependent_id, *register);
            }
            ExecuteAction::UncachePackage { package_id } => {
                if let Some(package) = ctx.packages.get(package_id) {
                    let _ = ctx.cache.remove_package(package_id, &package.cache_id);
                }
            }
            ExecuteAction::ExecutePackage { package_id, action } => {
                current_boundary_packages.push(package_id.clone());
                let Some(package) = ctx.packages.get(package_id) else { continue };
                on_event(EngineEvent::PackageExecuteStarted { package_id: package_id.clone() });

                match driver.execute(package, *action) {
                    Ok(class) => {
                        on_event(EngineEvent::PackageExecuteFinished { package_id: package_id.clone(), class });
                        let _ = registration.set_package_state(package_id, package.current_state);
                        succeeded.push(package_id.clone());
                        completed_package_ids.push_back(package_id.clone());
                    }
                    Err(err) => {
                        let _ = registration.mark_failed(package_id, &err);
                        run_rollback(rollback_actions, &completed_package_ids, &committed_packages, driver, &ctx.packages, registration);
                        return ApplyOutcome { succeeded, failed: Some(err), rolled_back: true };
                    }
                }
            }
        }
    }

    for reg_action in registration_actions {
        apply_registration_action(registration, reg_action);
    }

    // Every action ran; the worker has nothing left to do, so this join is immediate.
    let _ = cache_handle.join();

    ApplyOutcome { succeeded, failed: None, rolled_back: false }
}

fn apply_provider_registration(registration: &mut RegistrationManager, package_id: &str, provider_key: &str, register: bool) {
    if register {
        registration.providers_mut().register(
            provider_key,
            Provider { key: provider_key.to_string(), version: None, display_name: package_id.to_string(), dependents: Vec::new() },
        );
    } else {
        registration.providers_mut().unregister(provider_key);
    }
}

fn apply_provider_dependency(registration: &mut RegistrationManager, provider_key: &str, dependent_id: &str, register: bool) {
    let result = if register {
        registration.providers_mut().add_dependent(provider_key, dependent_id)
    } else {
        registration.providers_mut().remove_dependent(provider_key, dependent_id)
    };
    let _ = result;
}

fn apply_registration_action(registration: &mut RegistrationManager, action: &RegistrationAction) {
    match action {
        RegistrationAction::WriteArp { package_id } | RegistrationAction::RegisterProvider { package_id, .. } => {
            let _ = registration.set_package_state(package_id, waypoint_types::CurrentState::Present);
        }
        RegistrationAction::RemoveArp { package_id } | RegistrationAction::UnregisterProvider { package_id, .. } => {
            let _ = registration.set_package_state(package_id, waypoint_types::CurrentState::Absent);
        }
    }
}

/// Compensate for everything in `completed` by running its matching `rollback_actions` entry,
/// skipping packages the forward pass never reached and packages whose rollback boundary had
/// already committed before this failure occurred.
fn run_rollback(
    rollback_actions: &[RollbackAction],
    completed: &VecDeque<String>,
    committed_packages: &HashSet<String>,
    driver: &dyn PackageDriver,
    packages: &HashMap<String, Package>,
    registration: &mut RegistrationManager,
) {
    for action in rollback_actions {
        match action {
            RollbackAction::ExecutePackage { package_id, action } => {
                if !completed.contains(package_id) || committed_packages.contains(package_id) {
                    continue;
                }
                if let Some(package) = packages.get(package_id) {
                    let _ = driver.execute(package, *action);
                }
            }
            RollbackAction::PackageProvider { package_id, provider_key, register } => {
                if committed_packages.contains(package_id) {
                    continue;
                }
                apply_provider_registration(registration, package_id, provider_key, *register);
            }
            RollbackAction::PackageDependency { package_id, dependent_id, register } => {
                if committed_packages.contains(package_id) {
                    continue;
                }
                apply_provider_dependency(registration, package_id, dependent_id, *register);
            }
        }
    }
}

/// Exclusion-lock-guarded entry point: acquires the lock under `scope_root` for the duration of
/// `f`, returning `LockContention` if another apply session already holds it. The lock is
/// released on drop (or explicitly at the end of `f`, whichever comes first).
pub fn with_exclusion_lock<T>(
    scope_root: &std::path::Path,
    bundle_id: &str,
    f: impl FnOnce() -> T,
) -> Result<T, EngineError> {
    let lock = waypoint_lock::ExclusionLock::acquire(scope_root).map_err(|_| EngineError::LockContention)?;
    lock.set_bundle_id(bundle_id).map_err(|e| EngineError::FatalSystem(e.to_string()))?;
    let result = f();
    drop(lock);
    Ok(result)
}
