//! Assembles the release tree: one branch per configured package, wired
//! together under a single parallel root. Branch order follows the
//! pipeline file's declaration order, not `BTreeMap` iteration order over
//! `ReleaseState.packages` — two packages dispatched in a nondeterministic
//! order would make dry-run output and logs hard to compare across runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use releasectl_status::StatusRenderer;
use releasectl_tree::{Node, Parallel, ParallelPolicy};
use releasectl_types::{PackageResult, PackageState, ReleaseType};
use tokio::sync::watch;

use crate::clients::Clients;
use crate::config::PackageConfig;
use crate::leaves::{
    build_already_succeeded, package_disabled, publish_already_succeeded, CollectArtifacts,
    DispatchIfNeeded, FinalizePackage, MonitorRun, Phase, WaitFor,
};

/// One `Fallback[ already-succeeded, Sequence[dispatch, monitor] ]`,
/// wrapped in a bounded retry. Shared shape for both the build and publish
/// halves of a branch; only the leaves and the "already succeeded"
/// predicate differ.
fn phase_subtree(
    phase: Phase,
    already_succeeded: releasectl_tree::Predicate<PackageState>,
    client: Arc<dyn releasectl_workflow::WorkflowClient>,
    workflow: String,
    ref_template: String,
    inputs_template: BTreeMap<String, String>,
    tag: &str,
    release_type: ReleaseType,
    status: Option<Arc<StatusRenderer>>,
    timeout: Duration,
) -> Node<PackageState> {
    let dispatch = Node::leaf(DispatchIfNeeded {
        phase,
        client: client.clone(),
        workflow: workflow.clone(),
        ref_template,
        inputs_template,
        tag: tag.to_string(),
        release_type,
        status,
    });
    let monitor = Node::timeout(Node::leaf(MonitorRun::new(phase, client, workflow)), timeout);
    let body = Node::fallback(vec![
        Node::condition(already_succeeded),
        Node::sequence(vec![dispatch, monitor]),
    ]);
    Node::retry(body, 2)
}

/// Builds one package's full branch: an optional leading `WaitFor` guard
/// per `depends_on` entry, then the enabled-gate wrapping build, artifact
/// handoff, publish, and finalization.
fn build_package_branch(
    pkg: &PackageConfig,
    build_client: Arc<dyn releasectl_workflow::WorkflowClient>,
    publish_client: Arc<dyn releasectl_workflow::WorkflowClient>,
    tag: &str,
    release_type: ReleaseType,
    results: watch::Receiver<Arc<BTreeMap<String, PackageResult>>>,
    status: Option<Arc<StatusRenderer>>,
) -> Node<PackageState> {
    let build_subtree = phase_subtree(
        Phase::Build,
        build_already_succeeded,
        build_client.clone(),
        pkg.build.workflow.clone(),
        pkg.build.ref_template.clone(),
        pkg.build.inputs_template.clone(),
        tag,
        release_type,
        status.clone(),
        pkg.build.timeout,
    );
    let collect = Node::leaf(CollectArtifacts {
        client: build_client,
        whitelist: pkg.build.artifacts_whitelist.clone(),
    });
    let publish_subtree = phase_subtree(
        Phase::Publish,
        publish_already_succeeded,
        publish_client,
        pkg.publish.workflow.clone(),
        pkg.publish.ref_template.clone(),
        pkg.publish.inputs_template.clone(),
        tag,
        release_type,
        status,
        pkg.publish.timeout,
    );
    let finalize = Node::leaf(FinalizePackage);

    let mut steps = Vec::new();
    for dep in &pkg.depends_on {
        steps.push(Node::leaf(WaitFor {
            dependency: dep.clone(),
            results: results.clone(),
        }));
    }
    steps.push(build_subtree);
    steps.push(collect);
    steps.push(publish_subtree);
    steps.push(finalize);

    Node::skip_when(package_disabled, Node::sequence(steps))
}

/// Builds the whole release tree and returns it alongside the package names
/// in the order their per-package contexts must be laid out in the `Vec`
/// passed to `Tree::tick` — config declaration order.
pub async fn build_release_tree(
    packages: &[PackageConfig],
    clients: &Clients,
    tag: &str,
    release_type: ReleaseType,
    results: watch::Receiver<Arc<BTreeMap<String, PackageResult>>>,
) -> anyhow::Result<(Node<Vec<PackageState>>, Vec<String>)> {
    let mut branches = Vec::with_capacity(packages.len());
    let mut names = Vec::with_capacity(packages.len());

    for pkg in packages {
        let build_client = clients.workflow_client_for(&pkg.repo).await?;
        let publish_client = build_client.clone();
        let branch = build_package_branch(
            pkg,
            build_client,
            publish_client,
            tag,
            release_type,
            results.clone(),
            clients.status.clone(),
        );
        branches.push(branch);
        names.push(pkg.name.clone());
    }

    let root = Node::leaf(Parallel::new(branches, ParallelPolicy::AllSuccess));
    Ok((root, names))
}
