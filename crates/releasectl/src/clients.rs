//! Dependency-injection root: one place that knows how to mint the
//! trait-object clients the rest of the crate consumes. Nothing here is a
//! process global — a `Clients` value is built once per invocation and
//! threaded through explicitly, the way the release tree is built around
//! `&mut` state rather than back-pointers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use releasectl_retry::RetryStrategyConfig;
use releasectl_status::{SlackStatusClient, StatusClient, StatusRenderer};
use releasectl_storage::StorageBackend;
use releasectl_workflow::fake::FakeWorkflowClient;
use releasectl_workflow::{GitHubActionsClient, WorkflowClient};
use tokio::sync::Mutex;

/// Everything a release run needs to talk to the outside world. Built once
/// in `main`/the controller entry point and handed to tree assembly, which
/// pulls per-package workflow clients out of it at construction time.
pub struct Clients {
    api_base: String,
    token: String,
    dry_run: bool,
    pub storage: Arc<dyn StorageBackend>,
    pub status: Option<Arc<StatusRenderer>>,
    pub retry: RetryStrategyConfig,
    /// Memoized per-repo workflow clients; `WorkflowClient` binds owner/repo
    /// at construction, so each downstream repo gets its own instance.
    workflow_clients: Mutex<HashMap<String, Arc<dyn WorkflowClient>>>,
}

impl Clients {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        status: Option<Arc<StatusRenderer>>,
        retry: RetryStrategyConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            token: token.into(),
            dry_run,
            storage,
            status,
            retry,
            workflow_clients: Mutex::new(HashMap::new()),
        }
    }

    /// Build the status renderer from config, if status reporting is
    /// enabled and a token is available. Returns `None` silently otherwise
    /// — a release with no status sink still runs, it just never posts.
    pub fn build_status_renderer(
        enabled: bool,
        channel: Option<&str>,
        token: Option<String>,
    ) -> Option<Arc<StatusRenderer>> {
        let channel = channel?;
        if !enabled {
            return None;
        }
        let token = token?;
        let client: Arc<dyn StatusClient> = Arc::new(SlackStatusClient::new(token));
        Some(Arc::new(StatusRenderer::new(client, channel)))
    }

    /// Fetch (or lazily create) the workflow client for `repo` (`owner/repo`
    /// form). Under dry-run, every repo shares one `FakeWorkflowClient` so
    /// dispatches recorded during a dry-run tree walk stay observable
    /// together.
    pub async fn workflow_client_for(&self, repo: &str) -> Result<Arc<dyn WorkflowClient>> {
        let mut guard = self.workflow_clients.lock().await;
        if let Some(existing) = guard.get(repo) {
            return Ok(existing.clone());
        }
        let client: Arc<dyn WorkflowClient> = if self.dry_run {
            Arc::new(FakeWorkflowClient::new())
        } else {
            let (owner, repo_name) = repo
                .split_once('/')
                .with_context(|| format!("repo must be owner/repo, got {repo}"))?;
            if owner.is_empty() || repo_name.is_empty() {
                bail!("repo must be owner/repo, got {repo}");
            }
            Arc::new(GitHubActionsClient::new(
                self.api_base.clone(),
                self.token.clone(),
                owner,
                repo_name,
                self.retry.clone(),
            ))
        };
        guard.insert(repo.to_string(), client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use releasectl_storage::FileStorage;
    use std::path::PathBuf;

    fn test_clients(dry_run: bool) -> Clients {
        Clients::new(
            "https://api.github.invalid",
            "token",
            Arc::new(FileStorage::new(PathBuf::from("/tmp"))),
            None,
            RetryStrategyConfig::default(),
            dry_run,
        )
    }

    #[tokio::test]
    async fn workflow_client_for_rejects_repo_without_slash() {
        let clients = test_clients(false);
        let result = clients.workflow_client_for("not-a-repo").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn workflow_client_for_memoizes_per_repo() {
        let clients = test_clients(false);
        let a = clients.workflow_client_for("acme/widget").await.unwrap();
        let b = clients.workflow_client_for("acme/widget").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn workflow_client_for_dry_run_uses_fake_client() {
        let clients = test_clients(true);
        let client = clients.workflow_client_for("acme/widget").await.unwrap();
        let inputs = std::collections::BTreeMap::new();
        client
            .dispatch("build.yml", "main", "uuid-1", &inputs)
            .await
            .expect("fake dispatch always succeeds");
    }

    #[test]
    fn build_status_renderer_none_when_disabled() {
        assert!(Clients::build_status_renderer(false, Some("C123"), Some("tok".into())).is_none());
    }

    #[test]
    fn build_status_renderer_none_without_channel() {
        assert!(Clients::build_status_renderer(true, None, Some("tok".into())).is_none());
    }

    #[test]
    fn build_status_renderer_none_without_token() {
        assert!(Clients::build_status_renderer(true, Some("C123"), None).is_none());
    }
}
