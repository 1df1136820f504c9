//! Lifecycle controller: the one place that sequences lock acquisition,
//! state load/seed/reset, tree assembly, ticking to quiescence, and final
//! persistence. Everything below this module is pure or purely
//! domain-logic; this is where side effects get ordered.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use releasectl_lock::LockError;
use releasectl_state::{ResetSelector, StateStore};
use releasectl_status::StatusRenderer;
use releasectl_tree::{NodeStatus, Tree};
use releasectl_types::{
    derive_release_type, PackageResult, PackageState, PhaseState, ReleaseState, ReleaseType,
};
use tokio::sync::watch;

use crate::clients::Clients;
use crate::config::{ForceRebuild, PackageConfig, PipelineConfig};
use crate::tree::build_release_tree;

/// Fatal outcomes the CLI layer maps onto exit codes.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("release {tag} is locked by {holder_id} since {acquired_at}")]
    LockHeld {
        tag: String,
        holder_id: String,
        acquired_at: DateTime<Utc>,
    },
    #[error("configuration error: {0}")]
    Configuration(#[source] anyhow::Error),
    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

/// Terminal outcome of a completed release run, distinct from
/// [`ControllerError`] since reaching a "some package failed" result is not
/// itself a bug — it just isn't success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Succeeded,
    Failed,
}

/// Caller-supplied overrides for one release run, gathered from CLI flags.
#[derive(Debug, Default)]
pub struct ReleaseOverrides {
    pub force_rebuild: Option<ForceRebuild>,
    pub only_packages: Vec<String>,
    pub force_release_type: Option<ReleaseType>,
    pub dry_run: bool,
}

/// Build a fresh per-package state entry from its pipeline declaration.
fn seed_package(pkg: &PackageConfig) -> PackageState {
    PackageState::new(
        PhaseState::new(pkg.build.workflow.clone(), pkg.build.ref_template.clone()),
        PhaseState::new(pkg.publish.workflow.clone(), pkg.publish.ref_template.clone()),
    )
}

/// Merge pipeline declarations into a (possibly freshly-loaded) state
/// document: new packages get seeded, existing ones are left as-is so a
/// resumed release keeps its in-flight run state.
fn seed_packages(state: &mut ReleaseState, packages: &[PackageConfig]) {
    for pkg in packages {
        state
            .packages
            .entry(pkg.name.clone())
            .or_insert_with(|| seed_package(pkg));
    }
}

/// Apply `--only-packages`: every package not named is marked disabled so
/// it trivially succeeds instead of blocking the root's `AllSuccess`.
fn apply_enablement(state: &mut ReleaseState, only_packages: &[String]) {
    if only_packages.is_empty() {
        return;
    }
    for (name, pkg) in state.packages.iter_mut() {
        pkg.enabled = only_packages.iter().any(|n| n == name);
    }
}

fn apply_force_rebuild(
    state_store: &StateStore,
    state: &mut ReleaseState,
    force_rebuild: &Option<ForceRebuild>,
) -> Result<()> {
    let Some(selector) = force_rebuild else {
        return Ok(());
    };
    let selector = match selector {
        ForceRebuild::All => ResetSelector::All,
        ForceRebuild::Package(name) => ResetSelector::Packages(vec![name.clone()]),
    };
    state_store
        .reset(state, &selector)
        .context("failed to apply force-rebuild reset")
}

/// Snapshot the terminal `PackageResult` of every package, for the `WaitFor`
/// leaves' dependency broadcast. Non-terminal packages read back as
/// `Pending` regardless of their actual in-flight status — a dependent
/// branch only cares about "done" vs. "not done".
fn results_snapshot(state: &ReleaseState) -> Arc<BTreeMap<String, PackageResult>> {
    Arc::new(
        state
            .packages
            .iter()
            .map(|(name, pkg)| (name.clone(), pkg.result))
            .collect(),
    )
}

/// Acquire the release lock for `tag`, then run the release. The lock is
/// always released before returning, even on failure, since a crashed
/// release still frees the tag for a later retry.
pub async fn run_release(
    tag: &str,
    holder_id: &str,
    pipeline: &PipelineConfig,
    clients: &Clients,
    state_store: &StateStore,
    lock_timeout: Duration,
    overrides: ReleaseOverrides,
) -> Result<ReleaseOutcome, ControllerError> {
    let handle = releasectl_lock::acquire_with_ttl(
        clients.storage.clone(),
        tag,
        holder_id,
        lock_timeout,
        clients.retry.clone(),
    )
    .await
    .map_err(|err| match err {
        LockError::AlreadyHeld {
            tag,
            holder_id,
            acquired_at,
        } => ControllerError::LockHeld {
            tag,
            holder_id,
            acquired_at,
        },
        other => ControllerError::Internal(other.into()),
    })?;

    let result = run_release_locked(tag, pipeline, clients, state_store, overrides).await;

    if let Err(release_err) = handle.release().await {
        tracing::warn!(tag, error = %release_err, "failed to release lock after run; it will expire via ttl");
    }

    result
}

/// The actual release body, assuming the lock is already held. Split out
/// from [`run_release`] so tests can exercise it without going through
/// storage-backed locking.
#[tracing::instrument(skip(pipeline, clients, state_store, overrides))]
pub async fn run_release_locked(
    tag: &str,
    pipeline: &PipelineConfig,
    clients: &Clients,
    state_store: &StateStore,
    overrides: ReleaseOverrides,
) -> Result<ReleaseOutcome, ControllerError> {
    let release_type = overrides
        .force_release_type
        .or_else(|| pipeline.release_type_overrides.get(tag).copied())
        .unwrap_or_else(|| derive_release_type(tag));

    let mut state = state_store
        .load(tag)
        .await
        .map_err(ControllerError::Internal)?
        .unwrap_or_else(|| ReleaseState::new(tag, release_type));

    seed_packages(&mut state, &pipeline.packages);
    apply_enablement(&mut state, &overrides.only_packages);
    apply_force_rebuild(state_store, &mut state, &overrides.force_rebuild)
        .map_err(ControllerError::Configuration)?;

    if !state.is_consistent() {
        return Err(ControllerError::Internal(anyhow::anyhow!(
            "release state for {tag} is inconsistent before tree assembly"
        )));
    }

    let (results_tx, results_rx) = watch::channel(results_snapshot(&state));

    let (root, names) = build_release_tree(
        &pipeline.packages,
        clients,
        tag,
        release_type,
        results_rx,
    )
    .await
    .map_err(ControllerError::Configuration)?;

    let mut contexts: Vec<PackageState> = names
        .iter()
        .map(|name| {
            state
                .packages
                .get(name)
                .cloned()
                .expect("seed_packages populated every configured package")
        })
        .collect();

    let mut tree = Tree::new(root);
    let status_renderer = clients.status.clone();

    let final_status = tree
        .run_to_quiescence(&mut contexts, |ctx, _status| {
            for (name, pkg) in names.iter().zip(ctx.iter()) {
                state.packages.insert(name.clone(), pkg.clone());
            }
            let _ = results_tx.send(results_snapshot(&state));
            state.meta.updated_at = Utc::now();

            let snapshot = state.clone();
            let store = state_store;
            let renderer = status_renderer.clone();
            async move {
                if let Err(err) = store.save(&snapshot).await {
                    tracing::warn!(tag = %snapshot.tag, error = %err, "failed to persist release state mid-run");
                }
                if let Some(renderer) = renderer {
                    renderer.render(&snapshot);
                }
            }
        })
        .await;

    for (name, pkg) in names.iter().zip(contexts.into_iter()) {
        state.packages.insert(name.clone(), pkg);
    }
    state.meta.updated_at = Utc::now();

    if let Err(err) = state_store.save(&state).await {
        tracing::warn!(tag, error = %err, "failed to persist final release state");
    }
    if let Some(renderer) = &clients.status {
        renderer.render(&state);
    }

    match final_status {
        NodeStatus::Success => Ok(ReleaseOutcome::Succeeded),
        NodeStatus::Failure => Ok(ReleaseOutcome::Failed),
        NodeStatus::Running => Err(ControllerError::Internal(anyhow::anyhow!(
            "tree reached quiescence while still Running; this is a scheduler bug"
        ))),
    }
}

/// Read-only status lookup, used by the `status` subcommand. Returns `None`
/// if no release has ever run for `tag`.
pub async fn load_status(state_store: &StateStore, tag: &str) -> Result<Option<ReleaseState>> {
    state_store.load(tag).await
}
