//! The Planner (`spec.md` §4.6).
//!
//! Turns a bundle's packages (with their detected [`CurrentState`]) plus a
//! [`RequestedAction`] into a [`Plan`]: cache actions to acquire everything
//! the execute list needs, an execute list bracketed by rollback boundaries
//! and checkpoints, and the compensating rollback list run backwards through
//! whatever the execute list already completed. Package order is the
//! manifest order the caller supplies — rollback boundaries partition that
//! order into sequential, independently-recoverable segments; there is no
//! cross-package dependency graph to topo-sort (a package's only ordering
//! constraint is "boundary to boundary", not "dependency to dependent").

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use sha2::{Digest, Sha256};
use waypoint_types::{
    CacheAction, CleanAction, CurrentState, ExecuteAction, Package, PackageAction, Plan, PlanTotals,
    Provider, RegistrationAction, RequestedAction, RequestedState, RollbackAction, RollbackBoundary,
};

/// One package plus the rollback boundary (if any) it belongs to, in manifest order.
#[derive(Debug, Clone)]
pub struct PlanItem {
    pub package: Package,
    pub rollback_boundary_id: Option<String>,
}

/// Everything the planner needs besides the requested top-level action.
#[derive(Debug, Clone)]
pub struct PlanInput {
    pub action: RequestedAction,
    pub items: Vec<PlanItem>,
    pub boundaries: Vec<RollbackBoundary>,
    /// Providers this bundle owns, keyed by provider key — used to decide whether uninstalling
    /// a package is blocked by another bundle's dependency on it.
    pub providers: BTreeMap<String, Provider>,
    /// This bundle's own id, excluded when checking `providers` for blocking dependents.
    pub self_bundle_id: String,
    /// Original command-line arguments, reused verbatim in `resume_command_line` plus the
    /// resume flag the executor appends on restart.
    pub original_args: Vec<String>,
}

/// Default requested state for a package given the top-level action and its detected current
/// state (`spec.md` §4.6's default-requested-state table).
pub fn default_requested_state(
    action: RequestedAction,
    current_state: CurrentState,
    permanent: bool,
) -> RequestedState {
    use CurrentState::*;
    use RequestedAction::*;
    match action {
        Install | UpdateReplace => match current_state {
            Absent | Cached => RequestedState::Present,
            Present | Superseded | Obsolete => RequestedState::None,
        },
        Uninstall => {
            if permanent {
                RequestedState::None
            } else {
                match current_state {
                    Present | Superseded => RequestedState::Absent,
                    Absent | Cached | Obsolete => RequestedState::None,
                }
            }
        }
        Repair => match current_state {
            Present | Cached => RequestedState::Repair,
            _ => RequestedState::None,
        },
        Modify => match current_state {
            Present => RequestedState::Present,
            _ => RequestedState::None,
        },
        Layout | Help => RequestedState::None,
    }
}

/// Maps `(current, requested)` to the concrete action the executor will run, matching the
/// state-delta table in `spec.md` §4.6.
fn execute_action_for(current: CurrentState, requested: RequestedState) -> PackageAction {
    use CurrentState as C;
    use RequestedState as R;
    match (current, requested) {
        (_, R::None) => PackageAction::None,
        (C::Absent, R::Present) | (C::Obsolete, R::Present) => PackageAction::Install,
        (C::Present, R::Absent) | (C::Superseded, R::Absent) | (C::Cached, R::Absent) => {
            PackageAction::Uninstall
        }
        (C::Present, R::Repair) => PackageAction::Repair,
        (C::Present, R::Present) => PackageAction::Modify,
        (C::Cached, R::Present) | (C::Cached, R::Repair) => PackageAction::Install,
        _ => PackageAction::None,
    }
}

/// The reverse of `execute_action_for`, used to populate the compensating rollback action for a
/// package before its forward action runs.
fn rollback_action_for(forward: PackageAction) -> PackageAction {
    match forward {
        PackageAction::Install => PackageAction::Uninstall,
        PackageAction::Uninstall => PackageAction::Install,
        PackageAction::Repair => PackageAction::Repair,
        PackageAction::Modify => PackageAction::Modify,
        PackageAction::None => PackageAction::None,
    }
}

/// Compute a full plan from `input`. Returns `Err` if a vital package requests `Absent` while
/// another bundle still depends on its provider (`spec.md`'s dependent-present refusal);
/// non-vital packages in the same situation are allowed through.
pub fn compute_plan(input: &PlanInput) -> Result<Plan> {
    let mut plan = Plan::empty(input.action);
    let mut checkpoint_id: u64 = 0;
    let mut packages_total: u64 = 0;
    let mut estimated_size: i64 = 0;
    let mut cache_size_total: u64 = 0;

    // Resolve requested/execute/rollback per item, refusing blocked uninstalls up front so a
    // partially-built plan is never handed to the executor.
    let mut resolved: Vec<(PlanItem, RequestedState, PackageAction, PackageAction)> = Vec::new();
    for item in &input.items {
        let requested =
            default_requested_state(input.action, item.package.current_state, item.package.permanent);
        let forward = execute_action_for(item.package.current_state, requested);

        if forward == PackageAction::Uninstall && item.package.vital {
            for provider_key in &item.package.providers {
                let dependents: Vec<&str> = input
                    .providers
                    .get(provider_key)
                    .map(|p| {
                        p.dependents
                            .iter()
                            .filter(|d| d.as_str() != input.self_bundle_id)
                            .map(|d| d.as_str())
                            .collect()
                    })
                    .unwrap_or_default();
                if !dependents.is_empty() {
                    bail!(
                        "cannot uninstall vital package {}: still depended on by {}",
                        item.package.id,
                        dependents.join(", ")
                    );
                }
            }
        }

        let rollback = rollback_action_for(forward);
        resolved.push((item.clone(), requested, forward, rollback));
    }

    // Cache actions: one bracketed acquire/cache sequence per package needing content.
    let containers_acquired: BTreeSet<String> = BTreeSet::new();
    for (item, _requested, forward, _rollback) in &resolved {
        if !matches!(forward, PackageAction::Install | PackageAction::Repair | PackageAction::Modify) {
            continue;
        }
        packages_total += 1;
        estimated_size += item.package.install_size as i64;

        plan.cache_actions.push(CacheAction::PackageStart { package_id: item.package.id.clone() });
        for payload_key in &item.package.payload_refs {
            plan.cache_actions.push(CacheAction::AcquirePayload { payload_key: payload_key.clone() });
            plan.cache_actions.push(CacheAction::CachePayload {
                payload_key: payload_key.clone(),
                package_id: item.package.id.clone(),
            });
            cache_size_total += 1;
        }
        plan.cache_actions.push(CacheAction::PackageStop { package_id: item.package.id.clone() });
    }
    // Container-level dedup (AcquireContainer/ExtractContainer) is a no-op today because
    // PlanItem does not yet carry per-payload container refs; reserved for when it does.
    let _ = &containers_acquired;

    // Execute actions: walk items in manifest order, bracketing each rollback boundary with
    // begin/complete and a checkpoint on either side so a crash mid-boundary resumes cleanly.
    let mut current_boundary: Option<String> = None;
    for (item, _requested, forward, rollback) in &resolved {
        if item.rollback_boundary_id != current_boundary {
            if let Some(closing) = current_boundary.take() {
                plan.execute_actions.push(ExecuteAction::RollbackBoundaryComplete { boundary_id: closing });
            }
            if let Some(opening) = &item.rollback_boundary_id {
                checkpoint_id += 1;
                plan.execute_actions.push(ExecuteAction::Checkpoint { id: checkpoint_id });
                plan.execute_actions
                    .push(ExecuteAction::RollbackBoundaryBegin { boundary_id: opening.clone() });
            }
            current_boundary = item.rollback_boundary_id.clone();
        }

        if *forward == PackageAction::None {
            continue;
        }

        plan.execute_actions.push(ExecuteAction::WaitSyncPoint { package_id: item.package.id.clone() });
        checkpoint_id += 1;
        plan.execute_actions.push(ExecuteAction::Checkpoint { id: checkpoint_id });
        plan.execute_actions
            .push(ExecuteAction::ExecutePackage { package_id: item.package.id.clone(), action: *forward });

        // The compensating action is recorded now, ahead of the forward action completing, so a
        // failure mid-execute-list can roll back everything already appended here in reverse.
        plan.rollback_actions
            .push(RollbackAction::ExecutePackage { package_id: item.package.id.clone(), action: *rollback });

        for provider_key in &item.package.providers {
            let register = matches!(*forward, PackageAction::Install | PackageAction::Repair);
            plan.execute_actions.push(ExecuteAction::PackageProvider {
                package_id: item.package.id.clone(),
                provider_key: provider_key.clone(),
                register,
            });
            plan.rollback_actions.push(RollbackAction::PackageProvider {
                package_id: item.package.id.clone(),
                provider_key: provider_key.clone(),
                register: !register,
            });
        }

        if *forward == PackageAction::Uninstall && !item.package.permanent {
            plan.execute_actions.push(ExecuteAction::UncachePackage { package_id: item.package.id.clone() });
            plan.clean_actions.push(CleanAction::RemovePackageCache {
                package_id: item.package.id.clone(),
                cache_id: item.package.cache_id.clone(),
            });
        }

        let write_arp = matches!(*forward, PackageAction::Install | PackageAction::Repair | PackageAction::Modify);
        if write_arp {
            plan.registration_actions.push(RegistrationAction::WriteArp { package_id: item.package.id.clone() });
            plan.rollback_registration_actions
                .push(RegistrationAction::RemoveArp { package_id: item.package.id.clone() });
        } else if *forward == PackageAction::Uninstall {
            plan.registration_actions.push(RegistrationAction::RemoveArp { package_id: item.package.id.clone() });
        }
    }
    if let Some(closing) = current_boundary.take() {
        plan.execute_actions.push(ExecuteAction::RollbackBoundaryComplete { boundary_id: closing });
    }

    // Rollback actions are recorded in forward order above but must run in reverse once a
    // failure triggers rollback, undoing the most-recently-completed action first.
    plan.rollback_actions.reverse();

    plan.totals = PlanTotals {
        packages_total,
        progress_ticks_total: packages_total.saturating_mul(2),
        estimated_size,
        cache_size_total,
    };

    plan.resume_command_line = recreate_command_line(&input.original_args);

    Ok(plan)
}

/// Reconstructs the argv an elevated relaunch or a crash-resume invocation should use: the
/// original arguments with any prior `-burn.resume` marker stripped and a fresh one appended.
pub fn recreate_command_line(original_args: &[String]) -> Vec<String> {
    let mut out: Vec<String> =
        original_args.iter().filter(|a| !a.starts_with("-burn.resume")).cloned().collect();
    out.push("-burn.resume=1".to_string());
    out
}

/// Stable fingerprint of a plan's shape, used by tests and diagnostics to compare two plans
/// without a field-by-field diff.
pub fn plan_fingerprint(plan: &Plan) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{:?}\n", plan.action).as_bytes());
    for action in &plan.execute_actions {
        hasher.update(format!("{action:?}\n").as_bytes());
    }
    hex::encode(hasher.finalize())
}
