//! Generic async behavior-tree runtime.
//!
//! This crate knows nothing about releases, packages, or workflows: it is a
//! small tick-driven executor over a caller-supplied context type `Ctx`.
//! Domain node libraries (what a tick actually *does*) live upstream of this
//! crate; here we only provide node status, composites, decorators, and the
//! driver loop that ticks a tree to quiescence.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Outcome of ticking a node. There is deliberately no `Invalid`/pre-tick
/// status: a node that has never been ticked this run simply has no prior
/// status (`Node::status()` returns `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Running,
    Success,
    Failure,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Failure)
    }
}

/// A leaf performs domain work. It may be instant (settles within one tick)
/// or deferred (returns `Running` while an outstanding operation is in
/// flight, relying on the caller to tick again).
#[async_trait]
pub trait Leaf<Ctx>: Send + Sync
where
    Ctx: Send,
{
    async fn tick(&mut self, ctx: &mut Ctx, cancel: &CancellationToken) -> NodeStatus;

    /// Used by `Retry`/tree-reset to clear any internal attempt counters or
    /// in-flight bookkeeping before a fresh attempt. Instant leaves with no
    /// internal state can leave this as a no-op.
    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Retry only fires on `Failure`; there is no `RetryOn::Running` or similar,
/// since retrying a still-running child would be meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    Failure,
}

/// `AllSuccess` requires every child to reach `Success`; any single
/// `Failure` short-circuits the whole composite to `Failure` (the remaining
/// children are cancelled). `AnyFailure` is the dual: any single `Success`
/// short-circuits to `Success`, and only reaching all-`Failure` yields
/// overall `Failure`. The release tree's root uses `AllSuccess`; `AnyFailure`
/// exists for composites where succeeding early is meaningful (e.g. "any one
/// mirror accepting the upload is enough").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelPolicy {
    AllSuccess,
    AnyFailure,
}

/// A plain synchronous predicate over the context, used by `Decorator::Guard`
/// and `Node::condition`. Kept as a bare `fn` (not a boxed closure) since
/// every use in the release tree is a field check with no captured state.
pub type Predicate<Ctx> = fn(&Ctx) -> bool;

enum NodeKind<Ctx> {
    Sequence {
        children: Vec<Node<Ctx>>,
        memory: bool,
        cursor: usize,
    },
    Fallback {
        children: Vec<Node<Ctx>>,
        memory: bool,
        cursor: usize,
    },
    Inverter(Box<Node<Ctx>>),
    Retry {
        child: Box<Node<Ctx>>,
        max_attempts: u32,
        attempts: u32,
        #[allow(dead_code)]
        on: RetryOn,
    },
    Timeout {
        child: Box<Node<Ctx>>,
        duration: Duration,
        deadline: Option<Instant>,
    },
    /// Skips to `Failure` without ticking `child` when `predicate` is false.
    /// See `Node::condition` for the "trivially succeed when false" shape
    /// used by the release tree's per-package enabled check.
    Guard {
        child: Box<Node<Ctx>>,
        predicate: Predicate<Ctx>,
    },
    /// A leafless condition: `Success` if `predicate(ctx)`, else `Failure`.
    /// Has no children and never goes `Running`.
    Condition(Predicate<Ctx>),
    Leaf(Box<dyn Leaf<Ctx>>),
}

/// One node in a behavior tree. Carries its own cached `last_status` (so a
/// terminal node is not revisited on later ticks, per the tick loop's
/// determinism/no-rework guarantee) and a lazily-created `CancellationToken`
/// child of whatever token it was last ticked with, so cancelling this node
/// cancels its whole subtree.
pub struct Node<Ctx> {
    kind: NodeKind<Ctx>,
    last_status: Option<NodeStatus>,
    token: Option<CancellationToken>,
}

impl<Ctx: Send + 'static> Node<Ctx> {
    pub fn leaf(leaf: impl Leaf<Ctx> + 'static) -> Self {
        Self::from_kind(NodeKind::Leaf(Box::new(leaf)))
    }

    pub fn condition(predicate: Predicate<Ctx>) -> Self {
        Self::from_kind(NodeKind::Condition(predicate))
    }

    pub fn sequence(children: Vec<Node<Ctx>>) -> Self {
        Self::from_kind(NodeKind::Sequence {
            children,
            memory: false,
            cursor: 0,
        })
    }

    pub fn sequence_with_memory(children: Vec<Node<Ctx>>) -> Self {
        Self::from_kind(NodeKind::Sequence {
            children,
            memory: true,
            cursor: 0,
        })
    }

    pub fn fallback(children: Vec<Node<Ctx>>) -> Self {
        Self::from_kind(NodeKind::Fallback {
            children,
            memory: false,
            cursor: 0,
        })
    }

    pub fn fallback_with_memory(children: Vec<Node<Ctx>>) -> Self {
        Self::from_kind(NodeKind::Fallback {
            children,
            memory: true,
            cursor: 0,
        })
    }

    pub fn inverter(child: Node<Ctx>) -> Self {
        Self::from_kind(NodeKind::Inverter(Box::new(child)))
    }

    pub fn retry(child: Node<Ctx>, max_attempts: u32) -> Self {
        Self::from_kind(NodeKind::Retry {
            child: Box::new(child),
            max_attempts,
            attempts: 0,
            on: RetryOn::Failure,
        })
    }

    pub fn timeout(child: Node<Ctx>, duration: Duration) -> Self {
        Self::from_kind(NodeKind::Timeout {
            child: Box::new(child),
            duration,
            deadline: None,
        })
    }

    pub fn guard(child: Node<Ctx>, predicate: Predicate<Ctx>) -> Self {
        Self::from_kind(NodeKind::Guard {
            child: Box::new(child),
            predicate,
        })
    }

    /// Wraps `child` so that it only ever runs when `predicate` is false,
    /// and trivially succeeds (without ticking `child` at all) when
    /// `predicate` is true. This is the inverse of `guard`'s fail-closed
    /// semantics, used for "this subtree is optional" checks (e.g. a
    /// disabled package should succeed trivially, not fail the release).
    pub fn skip_when(predicate: Predicate<Ctx>, child: Node<Ctx>) -> Self {
        Self::fallback(vec![Self::condition(predicate), child])
    }

    fn from_kind(kind: NodeKind<Ctx>) -> Self {
        Self {
            kind,
            last_status: None,
            token: None,
        }
    }

    pub fn status(&self) -> Option<NodeStatus> {
        self.last_status
    }

    /// Marks this node (and transitively its subtree, via the shared
    /// cancellation token hierarchy) as cancelled. Cancelled subtrees settle
    /// to `Failure`.
    pub fn cancel(&mut self) {
        self.last_status = Some(NodeStatus::Failure);
        if let Some(token) = &self.token {
            token.cancel();
        }
    }

    /// Clears cached status so the subtree runs again from scratch. Used by
    /// `Retry` between attempts.
    pub fn reset(&mut self) {
        self.last_status = None;
        self.token = None;
        match &mut self.kind {
            NodeKind::Sequence { children, cursor, .. } | NodeKind::Fallback { children, cursor, .. } => {
                *cursor = 0;
                for child in children {
                    child.reset();
                }
            }
            NodeKind::Inverter(child) => child.reset(),
            NodeKind::Guard { child, .. } => child.reset(),
            NodeKind::Retry { child, attempts, .. } => {
                *attempts = 0;
                child.reset();
            }
            NodeKind::Timeout { child, deadline, .. } => {
                *deadline = None;
                child.reset();
            }
            NodeKind::Condition(_) => {}
            NodeKind::Leaf(leaf) => leaf.reset(),
        }
    }

    /// Ticks this node. `parent` is the cancellation token of whatever
    /// ticked this node (a tree driver at the root, or an enclosing
    /// composite/decorator below it); this node derives its own child token
    /// from it the first time it runs, so cancelling an ancestor cancels
    /// this whole subtree on the next visit.
    ///
    /// Boxed because this is a recursive async function — `Node::tick`
    /// calls `Node::tick` on its children — and recursive `async fn`s are
    /// not directly expressible (the resulting future would have infinite
    /// size).
    pub fn tick<'a>(
        &'a mut self,
        ctx: &'a mut Ctx,
        parent: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = NodeStatus> + Send + 'a>> {
        Box::pin(async move {
            if let Some(status) = self.last_status {
                if status.is_terminal() {
                    return status;
                }
            }
            if parent.is_cancelled() {
                self.cancel();
                return NodeStatus::Failure;
            }
            let token = self
                .token
                .get_or_insert_with(|| parent.child_token())
                .clone();

            let status = match &mut self.kind {
                NodeKind::Condition(predicate) => {
                    if predicate(ctx) {
                        NodeStatus::Success
                    } else {
                        NodeStatus::Failure
                    }
                }
                NodeKind::Guard { child, predicate } => {
                    if predicate(ctx) {
                        child.tick(ctx, &token).await
                    } else {
                        NodeStatus::Failure
                    }
                }
                NodeKind::Inverter(child) => match child.tick(ctx, &token).await {
                    NodeStatus::Success => NodeStatus::Failure,
                    NodeStatus::Failure => NodeStatus::Success,
                    NodeStatus::Running => NodeStatus::Running,
                },
                NodeKind::Timeout {
                    child,
                    duration,
                    deadline,
                } => {
                    let deadline = *deadline.get_or_insert_with(|| Instant::now() + *duration);
                    if Instant::now() >= deadline {
                        child.cancel();
                        NodeStatus::Failure
                    } else {
                        child.tick(ctx, &token).await
                    }
                }
                NodeKind::Retry {
                    child,
                    max_attempts,
                    attempts,
                    ..
                } => match child.tick(ctx, &token).await {
                    NodeStatus::Failure => {
                        *attempts += 1;
                        if *attempts > *max_attempts {
                            NodeStatus::Failure
                        } else {
                            child.reset();
                            NodeStatus::Running
                        }
                    }
                    other => other,
                },
                NodeKind::Sequence {
                    children,
                    memory,
                    cursor,
                } => {
                    let start = if *memory { *cursor } else { 0 };
                    let mut result = NodeStatus::Success;
                    for i in start..children.len() {
                        match children[i].tick(ctx, &token).await {
                            NodeStatus::Success => continue,
                            NodeStatus::Running => {
                                if *memory {
                                    *cursor = i;
                                }
                                result = NodeStatus::Running;
                                break;
                            }
                            NodeStatus::Failure => {
                                if *memory {
                                    *cursor = 0;
                                }
                                result = NodeStatus::Failure;
                                break;
                            }
                        }
                    }
                    result
                }
                NodeKind::Fallback {
                    children,
                    memory,
                    cursor,
                } => {
                    let start = if *memory { *cursor } else { 0 };
                    let mut result = NodeStatus::Failure;
                    for i in start..children.len() {
                        match children[i].tick(ctx, &token).await {
                            NodeStatus::Failure => continue,
                            NodeStatus::Running => {
                                if *memory {
                                    *cursor = i;
                                }
                                result = NodeStatus::Running;
                                break;
                            }
                            NodeStatus::Success => {
                                if *memory {
                                    *cursor = 0;
                                }
                                result = NodeStatus::Success;
                                break;
                            }
                        }
                    }
                    result
                }
                NodeKind::Leaf(leaf) => leaf.tick(ctx, &token).await,
            };

            self.last_status = Some(status);
            status
        })
    }
}

/// Ticks a fixed-size, index-aligned collection of children concurrently:
/// child `i` is given exclusive access to `ctx[i]` only, so `join_all` can
/// poll every child's future at once with no aliasing and no
/// `Arc<Mutex<_>>` around a shared document. This is how the release tree's
/// root achieves package-level concurrency: `Ctx` here is a `Vec` of
/// per-package contexts, one slot per enabled package, in the same
/// deterministic order the tree was assembled in.
pub struct Parallel<Inner> {
    children: Vec<Node<Inner>>,
    policy: ParallelPolicy,
}

impl<Inner: Send + 'static> Parallel<Inner> {
    pub fn new(children: Vec<Node<Inner>>, policy: ParallelPolicy) -> Self {
        Self { children, policy }
    }
}

#[async_trait]
impl<Inner: Send + 'static> Leaf<Vec<Inner>> for Parallel<Inner> {
    async fn tick(&mut self, ctx: &mut Vec<Inner>, cancel: &CancellationToken) -> NodeStatus {
        assert_eq!(
            ctx.len(),
            self.children.len(),
            "Parallel composite ticked with a mismatched number of per-child contexts"
        );

        let statuses = futures::future::join_all(
            self.children
                .iter_mut()
                .zip(ctx.iter_mut())
                .map(|(child, inner)| child.tick(inner, cancel)),
        )
        .await;

        let any_failure = statuses.iter().any(|s| *s == NodeStatus::Failure);
        let any_success = statuses.iter().any(|s| *s == NodeStatus::Success);
        let all_success = statuses.iter().all(|s| *s == NodeStatus::Success);
        let all_failure = statuses.iter().all(|s| *s == NodeStatus::Failure);

        match self.policy {
            ParallelPolicy::AllSuccess => {
                if any_failure {
                    self.cancel_running();
                    NodeStatus::Failure
                } else if all_success {
                    NodeStatus::Success
                } else {
                    NodeStatus::Running
                }
            }
            ParallelPolicy::AnyFailure => {
                if any_success {
                    self.cancel_running();
                    NodeStatus::Success
                } else if all_failure {
                    NodeStatus::Failure
                } else {
                    NodeStatus::Running
                }
            }
        }
    }

    fn reset(&mut self) {
        for child in &mut self.children {
            child.reset();
        }
    }

    fn name(&self) -> &'static str {
        "Parallel"
    }
}

impl<Inner> Parallel<Inner> {
    fn cancel_running(&mut self) {
        for child in &mut self.children {
            if !matches!(child.status(), Some(s) if s.is_terminal()) {
                child.cancel();
            }
        }
    }
}

/// Drives a tree to quiescence: repeatedly ticks the root, invoking
/// `on_tick` after every tick (used upstream for state persistence and
/// status rendering — neither of which this crate knows about), until the
/// root reaches a terminal status.
pub struct Tree<Ctx> {
    root: Node<Ctx>,
    cancel: CancellationToken,
}

impl<Ctx: Send + 'static> Tree<Ctx> {
    pub fn new(root: Node<Ctx>) -> Self {
        Self {
            root,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn root_status(&self) -> Option<NodeStatus> {
        self.root.status()
    }

    pub async fn tick(&mut self, ctx: &mut Ctx) -> NodeStatus {
        self.root.tick(ctx, &self.cancel).await
    }

    pub async fn run_to_quiescence<F, Fut>(&mut self, ctx: &mut Ctx, mut on_tick: F) -> NodeStatus
    where
        F: FnMut(&Ctx, NodeStatus) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let status = self.tick(ctx).await;
            on_tick(ctx, status).await;
            if status.is_terminal() {
                return status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counter(u32);

    struct CountUpThenSucceed {
        tick_count: Arc<AtomicU32>,
        succeed_after: u32,
    }

    #[async_trait]
    impl Leaf<Counter> for CountUpThenSucceed {
        async fn tick(&mut self, ctx: &mut Counter, _cancel: &CancellationToken) -> NodeStatus {
            ctx.0 += 1;
            self.tick_count.fetch_add(1, Ordering::SeqCst);
            if ctx.0 >= self.succeed_after {
                NodeStatus::Success
            } else {
                NodeStatus::Running
            }
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl Leaf<Counter> for AlwaysFail {
        async fn tick(&mut self, _ctx: &mut Counter, _cancel: &CancellationToken) -> NodeStatus {
            NodeStatus::Failure
        }
    }

    struct AlwaysSucceed;

    #[async_trait]
    impl Leaf<Counter> for AlwaysSucceed {
        async fn tick(&mut self, _ctx: &mut Counter, _cancel: &CancellationToken) -> NodeStatus {
            NodeStatus::Success
        }
    }

    #[tokio::test]
    async fn sequence_runs_children_left_to_right_until_running() {
        let mut tree = Tree::new(Node::sequence(vec![
            Node::leaf(AlwaysSucceed),
            Node::leaf(CountUpThenSucceed {
                tick_count: Arc::new(AtomicU32::new(0)),
                succeed_after: 2,
            }),
        ]));
        let mut ctx = Counter::default();

        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Running);
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Success);
        assert_eq!(ctx.0, 2);
    }

    #[tokio::test]
    async fn sequence_short_circuits_on_failure() {
        let mut tree = Tree::new(Node::sequence(vec![
            Node::leaf(AlwaysSucceed),
            Node::leaf(AlwaysFail),
            Node::leaf(AlwaysSucceed),
        ]));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn fallback_succeeds_on_first_success() {
        let mut tree = Tree::new(Node::fallback(vec![
            Node::leaf(AlwaysFail),
            Node::leaf(AlwaysSucceed),
        ]));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Success);
    }

    #[tokio::test]
    async fn fallback_fails_when_all_children_fail() {
        let mut tree = Tree::new(Node::fallback(vec![
            Node::leaf(AlwaysFail),
            Node::leaf(AlwaysFail),
        ]));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn inverter_flips_terminal_status() {
        let mut tree = Tree::new(Node::inverter(Node::leaf(AlwaysFail)));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Success);
    }

    #[tokio::test]
    async fn guard_skips_to_failure_when_predicate_false() {
        let mut tree: Tree<Counter> =
            Tree::new(Node::guard(Node::leaf(AlwaysSucceed), |c| c.0 > 0));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn skip_when_trivially_succeeds_without_running_child() {
        let calls = Arc::new(AtomicU32::new(0));
        struct RecordsCalls(Arc<AtomicU32>);
        #[async_trait]
        impl Leaf<Counter> for RecordsCalls {
            async fn tick(&mut self, _ctx: &mut Counter, _c: &CancellationToken) -> NodeStatus {
                self.0.fetch_add(1, Ordering::SeqCst);
                NodeStatus::Success
            }
        }
        let mut tree: Tree<Counter> = Tree::new(Node::skip_when(
            |c: &Counter| c.0 == 0,
            Node::leaf(RecordsCalls(calls.clone())),
        ));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_reattempts_failed_child_up_to_max_attempts() {
        let mut tree: Tree<Counter> = Tree::new(Node::retry(Node::leaf(AlwaysFail), 2));
        let mut ctx = Counter::default();
        // attempt 1 fails -> Running (retry scheduled)
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Running);
        // attempt 2 fails -> Running
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Running);
        // attempt 3 fails -> attempts (3) > max_attempts (2) -> Failure
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn retry_does_not_reattempt_after_success() {
        let mut tree: Tree<Counter> = Tree::new(Node::retry(
            Node::leaf(CountUpThenSucceed {
                tick_count: Arc::new(AtomicU32::new(0)),
                succeed_after: 1,
            }),
            2,
        ));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Success);
        // once terminal, further ticks are cached and do not re-invoke the leaf.
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Success);
    }

    #[tokio::test]
    async fn timeout_fails_once_deadline_elapses() {
        let mut tree: Tree<Counter> = Tree::new(Node::timeout(
            Node::leaf(CountUpThenSucceed {
                tick_count: Arc::new(AtomicU32::new(0)),
                succeed_after: u32::MAX,
            }),
            Duration::from_millis(1),
        ));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Running);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn terminal_node_is_not_revisited() {
        let tick_count = Arc::new(AtomicU32::new(0));
        let mut tree: Tree<Counter> = Tree::new(Node::leaf(CountUpThenSucceed {
            tick_count: tick_count.clone(),
            succeed_after: 1,
        }));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Success);
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Success);
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Success);
        assert_eq!(tick_count.load(Ordering::SeqCst), 1, "leaf ticked only once");
    }

    #[tokio::test]
    async fn parallel_all_success_requires_every_child() {
        let mut node: Node<Vec<Counter>> = Node::leaf(Parallel::new(
            vec![
                Node::leaf(CountUpThenSucceed {
                    tick_count: Arc::new(AtomicU32::new(0)),
                    succeed_after: 1,
                }),
                Node::leaf(CountUpThenSucceed {
                    tick_count: Arc::new(AtomicU32::new(0)),
                    succeed_after: 2,
                }),
            ],
            ParallelPolicy::AllSuccess,
        ));
        let cancel = CancellationToken::new();
        let mut ctx = vec![Counter::default(), Counter::default()];

        assert_eq!(node.tick(&mut ctx, &cancel).await, NodeStatus::Running);
        assert_eq!(node.tick(&mut ctx, &cancel).await, NodeStatus::Success);
    }

    #[tokio::test]
    async fn parallel_all_success_fails_fast_on_any_failure() {
        let mut node: Node<Vec<Counter>> = Node::leaf(Parallel::new(
            vec![
                Node::leaf(AlwaysFail),
                Node::leaf(CountUpThenSucceed {
                    tick_count: Arc::new(AtomicU32::new(0)),
                    succeed_after: 100,
                }),
            ],
            ParallelPolicy::AllSuccess,
        ));
        let cancel = CancellationToken::new();
        let mut ctx = vec![Counter::default(), Counter::default()];
        assert_eq!(node.tick(&mut ctx, &cancel).await, NodeStatus::Failure);
    }

    #[tokio::test]
    async fn parallel_any_failure_succeeds_fast_on_any_success() {
        let mut node: Node<Vec<Counter>> = Node::leaf(Parallel::new(
            vec![
                Node::leaf(AlwaysSucceed),
                Node::leaf(CountUpThenSucceed {
                    tick_count: Arc::new(AtomicU32::new(0)),
                    succeed_after: 100,
                }),
            ],
            ParallelPolicy::AnyFailure,
        ));
        let cancel = CancellationToken::new();
        let mut ctx = vec![Counter::default(), Counter::default()];
        assert_eq!(node.tick(&mut ctx, &cancel).await, NodeStatus::Success);
    }

    #[tokio::test]
    async fn run_to_quiescence_invokes_hook_every_tick_and_stops_on_terminal() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let mut tree: Tree<Counter> = Tree::new(Node::leaf(CountUpThenSucceed {
            tick_count: Arc::new(AtomicU32::new(0)),
            succeed_after: 3,
        }));
        let mut ctx = Counter::default();
        let hook_calls_inner = hook_calls.clone();
        let status = tree
            .run_to_quiescence(&mut ctx, move |_ctx, _status| {
                hook_calls_inner.fetch_add(1, Ordering::SeqCst);
                std::future::ready(())
            })
            .await;
        assert_eq!(status, NodeStatus::Success);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelling_root_token_settles_running_subtree_to_failure() {
        let mut tree: Tree<Counter> = Tree::new(Node::leaf(CountUpThenSucceed {
            tick_count: Arc::new(AtomicU32::new(0)),
            succeed_after: 100,
        }));
        let mut ctx = Counter::default();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Running);
        tree.cancellation_token().cancel();
        assert_eq!(tree.tick(&mut ctx).await, NodeStatus::Failure);
    }
}
