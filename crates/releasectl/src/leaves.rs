//! Domain leaves: the actual work a package branch performs at each
//! position in its tree. Every leaf owns the client/template state it needs
//! as struct fields, captured once when the tree is assembled, so `tick`'s
//! signature stays the generic `Leaf<PackageState>` contract the tree
//! runtime defines — no `Clients` parameter threaded through every call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use releasectl_status::StatusRenderer;
use releasectl_tree::{Leaf, NodeStatus};
use releasectl_types::{ArtifactRef, PackageState, PhaseState, PhaseStatus, RunConclusion};
use releasectl_workflow::WorkflowClient;
use sha2::Digest;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{render_inputs, render_template};
use releasectl_types::{PackageResult, ReleaseType};

/// Which half of a package's pipeline a leaf or condition operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Publish,
}

impl Phase {
    pub fn get(self, pkg: &PackageState) -> &PhaseState {
        match self {
            Phase::Build => &pkg.build,
            Phase::Publish => &pkg.publish,
        }
    }

    pub fn get_mut(self, pkg: &mut PackageState) -> &mut PhaseState {
        match self {
            Phase::Build => &mut pkg.build,
            Phase::Publish => &mut pkg.publish,
        }
    }
}

/// `Node::condition` predicate: true once the build phase has already
/// succeeded, letting the enclosing `Fallback` skip straight past dispatch
/// and monitoring on a resumed run.
pub fn build_already_succeeded(pkg: &PackageState) -> bool {
    pkg.build.status == PhaseStatus::Succeeded
}

pub fn publish_already_succeeded(pkg: &PackageState) -> bool {
    pkg.publish.status == PhaseStatus::Succeeded
}

/// `Node::skip_when` predicate: true when the package is disabled, so the
/// branch trivially succeeds instead of failing the whole release.
pub fn package_disabled(pkg: &PackageState) -> bool {
    !pkg.enabled
}

/// Dispatches a fresh workflow run the first time this phase is ticked.
/// Settles to `Success` immediately after a successful dispatch call — the
/// run's actual outcome is `MonitorRun`'s job, not this leaf's.
pub struct DispatchIfNeeded {
    pub phase: Phase,
    pub client: Arc<dyn WorkflowClient>,
    pub workflow: String,
    pub ref_template: String,
    pub inputs_template: BTreeMap<String, String>,
    pub tag: String,
    pub release_type: ReleaseType,
    pub status: Option<Arc<StatusRenderer>>,
}

#[async_trait]
impl Leaf<PackageState> for DispatchIfNeeded {
    async fn tick(&mut self, ctx: &mut PackageState, _cancel: &CancellationToken) -> NodeStatus {
        let artifacts = ctx.artifacts.clone();
        let phase = self.phase.get_mut(ctx);
        if phase.run.is_some() || phase.attempts > 0 {
            return NodeStatus::Success;
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        let git_ref = render_template(&self.ref_template, &self.tag, self.release_type, &artifacts);
        let mut inputs = render_inputs(
            &self.inputs_template,
            &self.tag,
            self.release_type,
            &artifacts,
        );
        // Every dispatched workflow gets these at minimum, regardless of
        // what the pipeline's own inputs_template names.
        inputs.insert("release_tag".to_string(), self.tag.clone());
        inputs.insert("workflow_uuid".to_string(), uuid.clone());
        if let Some(status) = &self.status {
            if let Some(handle) = status.current_handle().await {
                inputs.insert("status_channel".to_string(), handle.channel);
                inputs.insert("status_ts".to_string(), handle.ts);
            }
        }

        match self
            .client
            .dispatch(&self.workflow, &git_ref, &uuid, &inputs)
            .await
        {
            Ok(()) => {
                let phase = self.phase.get_mut(ctx);
                phase.uuid = Some(uuid);
                phase.reference = git_ref;
                phase.inputs = inputs;
                phase.status = PhaseStatus::Triggered;
                phase.attempts += 1;
                phase.dispatched_at = Some(Utc::now());
                tracing::info!(workflow = %self.workflow, "dispatched workflow run");
                NodeStatus::Success
            }
            Err(err) => {
                tracing::warn!(workflow = %self.workflow, error = %err, "dispatch failed");
                NodeStatus::Failure
            }
        }
    }

    fn name(&self) -> &'static str {
        "DispatchIfNeeded"
    }
}

const MONITOR_INITIAL_BACKOFF: Duration = Duration::from_secs(10);
const MONITOR_MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Polls a dispatched run to completion. Self-paces its own backoff with an
/// internal sleep since the tree driver's tick loop has no pacing of its
/// own; other package branches keep making progress in the meantime because
/// the parallel composite polls every branch's future concurrently.
pub struct MonitorRun {
    pub phase: Phase,
    pub client: Arc<dyn WorkflowClient>,
    pub workflow: String,
    next_backoff: Duration,
}

impl MonitorRun {
    pub fn new(phase: Phase, client: Arc<dyn WorkflowClient>, workflow: String) -> Self {
        Self {
            phase,
            client,
            workflow,
            next_backoff: MONITOR_INITIAL_BACKOFF,
        }
    }
}

#[async_trait]
impl Leaf<PackageState> for MonitorRun {
    async fn tick(&mut self, ctx: &mut PackageState, cancel: &CancellationToken) -> NodeStatus {
        let run = self.phase.get(ctx).run.clone();
        let uuid = self.phase.get(ctx).uuid.clone();
        let dispatched_at = self.phase.get(ctx).dispatched_at;

        let run = match run {
            Some(run) => run,
            None => {
                let Some(uuid) = uuid else {
                    tracing::warn!(workflow = %self.workflow, "monitor ticked with no uuid to correlate");
                    return NodeStatus::Failure;
                };
                let since = dispatched_at.unwrap_or_else(Utc::now);
                match self.client.find_run_by_uuid(&self.workflow, since, &uuid).await {
                    Ok(Some(run)) => {
                        self.phase.get_mut(ctx).run = Some(run.clone());
                        self.phase.get_mut(ctx).status = PhaseStatus::InProgress;
                        run
                    }
                    Ok(None) => {
                        self.sleep_backoff(cancel).await;
                        return NodeStatus::Running;
                    }
                    Err(err) => {
                        tracing::warn!(workflow = %self.workflow, error = %err, "find_run_by_uuid failed");
                        return NodeStatus::Running;
                    }
                }
            }
        };

        if let Some(conclusion) = run.conclusion {
            return self.settle(ctx, conclusion);
        }

        match self.client.get_run(run.id).await {
            Ok(updated) => {
                self.phase.get_mut(ctx).run = Some(updated.clone());
                match updated.conclusion {
                    Some(conclusion) => self.settle(ctx, conclusion),
                    None => {
                        self.phase.get_mut(ctx).status = PhaseStatus::InProgress;
                        self.sleep_backoff(cancel).await;
                        NodeStatus::Running
                    }
                }
            }
            Err(err) => {
                tracing::warn!(workflow = %self.workflow, run_id = run.id, error = %err, "get_run failed");
                self.sleep_backoff(cancel).await;
                NodeStatus::Running
            }
        }
    }

    fn reset(&mut self) {
        self.next_backoff = MONITOR_INITIAL_BACKOFF;
    }

    fn name(&self) -> &'static str {
        "MonitorRun"
    }
}

impl MonitorRun {
    fn settle(&mut self, ctx: &mut PackageState, conclusion: RunConclusion) -> NodeStatus {
        self.phase.get_mut(ctx).status = conclusion.to_phase_status();
        self.next_backoff = MONITOR_INITIAL_BACKOFF;
        match conclusion {
            RunConclusion::Success => NodeStatus::Success,
            RunConclusion::Failure | RunConclusion::Cancelled | RunConclusion::TimedOut => {
                NodeStatus::Failure
            }
        }
    }

    async fn sleep_backoff(&mut self, cancel: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.next_backoff) => {}
            _ = cancel.cancelled() => {}
        }
        self.next_backoff = (self.next_backoff * 2).min(MONITOR_MAX_BACKOFF);
    }
}

/// Pulls finished-run artifacts into `PackageState::artifacts` once the
/// build phase has succeeded, filtering by the configured whitelist and
/// stamping each with its producing run id and content hash. Idempotent:
/// re-ticking after artifacts are already collected is a no-op success.
pub struct CollectArtifacts {
    pub client: Arc<dyn WorkflowClient>,
    pub whitelist: Vec<String>,
}

#[async_trait]
impl Leaf<PackageState> for CollectArtifacts {
    async fn tick(&mut self, ctx: &mut PackageState, _cancel: &CancellationToken) -> NodeStatus {
        if ctx.build.status != PhaseStatus::Succeeded {
            return NodeStatus::Failure;
        }
        let Some(run) = ctx.build.run.clone() else {
            return NodeStatus::Failure;
        };
        if !ctx.artifacts.is_empty() {
            return NodeStatus::Success;
        }

        let remote = match self.client.list_artifacts(run.id).await {
            Ok(remote) => remote,
            Err(err) => {
                tracing::warn!(run_id = run.id, error = %err, "list_artifacts failed");
                return NodeStatus::Running;
            }
        };

        for artifact in remote {
            if !self.whitelist.is_empty() && !self.whitelist.contains(&artifact.name) {
                continue;
            }
            let bytes = match self.client.download_artifact(&artifact).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(artifact = %artifact.name, error = %err, "download_artifact failed");
                    return NodeStatus::Running;
                }
            };
            let sha256 = hex::encode(sha2::Sha256::digest(&bytes));
            ctx.artifacts.insert(
                artifact.name.clone(),
                ArtifactRef {
                    name: artifact.name,
                    source_run_id: run.id,
                    download_url: artifact.archive_download_url,
                    sha256,
                    size: artifact.size_in_bytes,
                },
            );
        }
        NodeStatus::Success
    }

    fn name(&self) -> &'static str {
        "CollectArtifacts"
    }
}

/// Marks a package's pipeline complete. Always the last step of a
/// successful branch.
pub struct FinalizePackage;

#[async_trait]
impl Leaf<PackageState> for FinalizePackage {
    async fn tick(&mut self, ctx: &mut PackageState, _cancel: &CancellationToken) -> NodeStatus {
        ctx.result = PackageResult::Success;
        NodeStatus::Success
    }

    fn name(&self) -> &'static str {
        "FinalizePackage"
    }
}

/// Blocks a dependent package's branch until `dependency` reaches a
/// terminal result in the broadcast snapshot. `Success`/`Skipped` let the
/// branch proceed; `Failed` fails this branch too so it does not dispatch
/// against a dependency that never shipped.
pub struct WaitFor {
    pub dependency: String,
    pub results: watch::Receiver<Arc<BTreeMap<String, PackageResult>>>,
}

#[async_trait]
impl Leaf<PackageState> for WaitFor {
    async fn tick(&mut self, _ctx: &mut PackageState, _cancel: &CancellationToken) -> NodeStatus {
        match self.results.borrow().get(&self.dependency) {
            Some(PackageResult::Success) | Some(PackageResult::Skipped) => NodeStatus::Success,
            Some(PackageResult::Failed) => NodeStatus::Failure,
            Some(PackageResult::Pending) | None => NodeStatus::Running,
        }
    }

    fn name(&self) -> &'static str {
        "WaitFor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use releasectl_types::PhaseState;
    use releasectl_workflow::fake::FakeWorkflowClient;

    fn pkg() -> PackageState {
        PackageState::new(
            PhaseState::new("build.yml", "main"),
            PhaseState::new("publish.yml", "main"),
        )
    }

    #[tokio::test]
    async fn dispatch_if_needed_dispatches_once() {
        let client: Arc<dyn WorkflowClient> = Arc::new(FakeWorkflowClient::new());
        let mut leaf = DispatchIfNeeded {
            phase: Phase::Build,
            client: client.clone(),
            workflow: "build.yml".into(),
            ref_template: "{tag}".into(),
            inputs_template: BTreeMap::new(),
            tag: "8.2.0".into(),
            release_type: ReleaseType::Ga,
            status: None,
        };
        let mut ctx = pkg();
        let token = CancellationToken::new();
        let status = leaf.tick(&mut ctx, &token).await;
        assert_eq!(status, NodeStatus::Success);
        assert_eq!(ctx.build.status, PhaseStatus::Triggered);
        assert_eq!(ctx.build.attempts, 1);

        let status_again = leaf.tick(&mut ctx, &token).await;
        assert_eq!(status_again, NodeStatus::Success);
        assert_eq!(ctx.build.attempts, 1, "must not re-dispatch once attempts > 0");
    }

    #[tokio::test]
    async fn finalize_package_marks_success() {
        let mut leaf = FinalizePackage;
        let mut ctx = pkg();
        let token = CancellationToken::new();
        leaf.tick(&mut ctx, &token).await;
        assert_eq!(ctx.result, PackageResult::Success);
    }

    #[tokio::test]
    async fn wait_for_blocks_until_dependency_resolves() {
        let (tx, rx) = watch::channel(Arc::new(BTreeMap::new()));
        let mut leaf = WaitFor {
            dependency: "base".to_string(),
            results: rx,
        };
        let mut ctx = pkg();
        let token = CancellationToken::new();
        assert_eq!(leaf.tick(&mut ctx, &token).await, NodeStatus::Running);

        let mut map = BTreeMap::new();
        map.insert("base".to_string(), PackageResult::Success);
        tx.send(Arc::new(map)).unwrap();
        assert_eq!(leaf.tick(&mut ctx, &token).await, NodeStatus::Success);
    }

    #[tokio::test]
    async fn wait_for_fails_when_dependency_failed() {
        let mut map = BTreeMap::new();
        map.insert("base".to_string(), PackageResult::Failed);
        let (_tx, rx) = watch::channel(Arc::new(map));
        let mut leaf = WaitFor {
            dependency: "base".to_string(),
            results: rx,
        };
        let mut ctx = pkg();
        let token = CancellationToken::new();
        assert_eq!(leaf.tick(&mut ctx, &token).await, NodeStatus::Failure);
    }

    #[test]
    fn build_already_succeeded_predicate() {
        let mut p = pkg();
        assert!(!build_already_succeeded(&p));
        p.build.status = PhaseStatus::Succeeded;
        assert!(build_already_succeeded(&p));
    }

    #[test]
    fn package_disabled_predicate() {
        let mut p = pkg();
        assert!(!package_disabled(&p));
        p.enabled = false;
        assert!(package_disabled(&p));
    }
}
