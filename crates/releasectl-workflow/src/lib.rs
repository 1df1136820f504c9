//! Async workflow-dispatch client: the seam between the release tree and
//! whatever CI host actually runs build/publish jobs for a downstream
//! package. The production implementation talks to the GitHub Actions REST
//! API; a fake implementation backs tests and dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use releasectl_retry::{RetryStrategyConfig, calculate_delay};
use releasectl_types::{ClientError, ErrorClass, RunConclusion, WorkflowRun};
use serde::{Deserialize, Serialize};

/// A build artifact as reported by the workflow host, before it has been
/// downloaded and hashed into a [`releasectl_types::ArtifactRef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub name: String,
    pub id: u64,
    pub size_in_bytes: u64,
    pub archive_download_url: String,
}

/// Dispatch, poll, and artifact-retrieval operations a release leaf needs
/// from a CI host. Object-safe so it can be boxed behind `Arc<dyn ...>` in
/// the release tree's shared context.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Trigger a workflow run. `uuid` is written into the dispatch inputs
    /// under `workflow_uuid` so a later `find_run_by_uuid` can correlate the
    /// run this call created with the run GitHub eventually reports.
    async fn dispatch(
        &self,
        workflow: &str,
        git_ref: &str,
        uuid: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<(), ClientError>;

    /// Find the run created by a `dispatch` call carrying `uuid`, among
    /// runs of `workflow` created at or after `since`. Correlation is by
    /// exact uuid match against the run name when the host echoes it;
    /// failing that, the newest run started at-or-after `since` is
    /// returned as a best-effort fallback (see `DESIGN.md`).
    async fn find_run_by_uuid(
        &self,
        workflow: &str,
        since: DateTime<Utc>,
        uuid: &str,
    ) -> Result<Option<WorkflowRun>, ClientError>;

    /// Poll the current state of a previously found run.
    async fn get_run(&self, run_id: u64) -> Result<WorkflowRun, ClientError>;

    /// List artifacts produced by a finished run.
    async fn list_artifacts(&self, run_id: u64) -> Result<Vec<RemoteArtifact>, ClientError>;

    /// Fetch the raw bytes of an artifact archive.
    async fn download_artifact(&self, artifact: &RemoteArtifact) -> Result<Vec<u8>, ClientError>;
}

#[derive(Debug, Serialize)]
struct DispatchRequest {
    #[serde(rename = "ref")]
    git_ref: String,
    inputs: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RunsResponse {
    workflow_runs: Vec<RawRun>,
}

#[derive(Debug, Deserialize)]
struct RawRun {
    id: u64,
    html_url: String,
    name: Option<String>,
    status: String,
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawRun {
    fn into_workflow_run(self) -> WorkflowRun {
        WorkflowRun {
            id: self.id,
            url: self.html_url,
            conclusion: self.conclusion.as_deref().and_then(parse_conclusion),
            started_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn parse_conclusion(raw: &str) -> Option<RunConclusion> {
    match raw {
        "success" => Some(RunConclusion::Success),
        "failure" | "startup_failure" | "action_required" => Some(RunConclusion::Failure),
        "cancelled" => Some(RunConclusion::Cancelled),
        "timed_out" => Some(RunConclusion::TimedOut),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ArtifactsResponse {
    artifacts: Vec<RawArtifact>,
}

#[derive(Debug, Deserialize)]
struct RawArtifact {
    id: u64,
    name: String,
    size_in_bytes: u64,
    archive_download_url: String,
}

/// GitHub-Actions-backed [`WorkflowClient`].
pub struct GitHubActionsClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    owner: String,
    repo: String,
    retry: RetryStrategyConfig,
}

impl GitHubActionsClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        retry: RetryStrategyConfig,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
            retry,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_base, self.owner, self.repo, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Run `attempt` until it returns a non-transient result or the retry
    /// budget is spent. Mirrors `StatusRenderer::render_inner`'s loop: only
    /// `ErrorClass::Transient` earns another try, backed off per `self.retry`.
    async fn with_retry<T, F, Fut>(&self, mut attempt: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        let mut attempt_no = 1;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.class() == ErrorClass::Transient && attempt_no < self.retry.max_attempts => {
                    let delay = calculate_delay(&self.retry, attempt_no);
                    tokio::time::sleep(delay).await;
                    attempt_no += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn map_response<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ClientError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Other(format!("failed to decode response body: {e}")))
    }
}

#[async_trait]
impl WorkflowClient for GitHubActionsClient {
    async fn dispatch(
        &self,
        workflow: &str,
        git_ref: &str,
        uuid: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        let mut body_inputs = inputs.clone();
        body_inputs.insert("workflow_uuid".to_string(), uuid.to_string());

        let request = DispatchRequest {
            git_ref: git_ref.to_string(),
            inputs: body_inputs,
        };

        let url = self.url(&format!("/actions/workflows/{workflow}/dispatches"));
        self.with_retry(|| async {
            let response = self
                .authed(self.http.post(&url))
                .json(&request)
                .send()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(ClientError::NotFound);
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ClientError::RateLimited);
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ClientError::Http {
                    status: status.as_u16(),
                    message,
                });
            }
            Ok(())
        })
        .await
    }

    async fn find_run_by_uuid(
        &self,
        workflow: &str,
        since: DateTime<Utc>,
        uuid: &str,
    ) -> Result<Option<WorkflowRun>, ClientError> {
        let url = self.url(&format!("/actions/workflows/{workflow}/runs"));
        let runs: RunsResponse = self
            .with_retry(|| async {
                let response = self
                    .authed(self.http.get(&url))
                    .query(&[("created", format!(">={}", since.to_rfc3339()))])
                    .send()
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?;
                Self::map_response(response).await
            })
            .await?;

        let mut candidates: Vec<RawRun> = runs
            .workflow_runs
            .into_iter()
            .filter(|r| r.created_at >= since)
            .collect();
        candidates.sort_by_key(|r| r.created_at);

        if let Some(exact) = candidates
            .iter()
            .find(|r| r.name.as_deref().is_some_and(|n| n.contains(uuid)))
        {
            return Ok(Some(exact.clone().into_workflow_run()));
        }

        if !candidates.is_empty() {
            tracing::warn!(
                workflow,
                uuid,
                "no run name carried the dispatch uuid; falling back to the newest run since dispatch"
            );
        }

        Ok(candidates.pop().map(RawRun::into_workflow_run))
    }

    async fn get_run(&self, run_id: u64) -> Result<WorkflowRun, ClientError> {
        let url = self.url(&format!("/actions/runs/{run_id}"));
        let raw: RawRun = self
            .with_retry(|| async {
                let response = self
                    .authed(self.http.get(&url))
                    .send()
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?;
                Self::map_response(response).await
            })
            .await?;
        Ok(raw.into_workflow_run())
    }

    async fn list_artifacts(&self, run_id: u64) -> Result<Vec<RemoteArtifact>, ClientError> {
        let url = self.url(&format!("/actions/runs/{run_id}/artifacts"));
        let parsed: ArtifactsResponse = self
            .with_retry(|| async {
                let response = self
                    .authed(self.http.get(&url))
                    .send()
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?;
                Self::map_response(response).await
            })
            .await?;
        Ok(parsed
            .artifacts
            .into_iter()
            .map(|a| RemoteArtifact {
                name: a.name,
                id: a.id,
                size_in_bytes: a.size_in_bytes,
                archive_download_url: a.archive_download_url,
            })
            .collect())
    }

    async fn download_artifact(&self, artifact: &RemoteArtifact) -> Result<Vec<u8>, ClientError> {
        self.with_retry(|| async {
            let response = self
                .authed(self.http.get(&artifact.archive_download_url))
                .send()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ClientError::Http {
                    status: status.as_u16(),
                    message: format!("failed to download artifact {}", artifact.name),
                });
            }
            response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| ClientError::Transport(e.to_string()))
        })
        .await
    }
}

/// In-memory fake used by tests and by dry-run mode: records dispatches and
/// replays a scripted sequence of run states without any network access.
pub mod fake {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct ScriptedRun {
        pub run: WorkflowRun,
        pub artifacts: Vec<RemoteArtifact>,
    }

    #[derive(Default)]
    pub struct FakeWorkflowClient {
        dispatches: Mutex<Vec<(String, String, String)>>,
        runs: Mutex<BTreeMap<u64, ScriptedRun>>,
        by_uuid: Mutex<BTreeMap<String, u64>>,
    }

    impl FakeWorkflowClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn script_run(&self, uuid: &str, run: ScriptedRun) {
            let id = run.run.id;
            self.runs.lock().await.insert(id, run);
            self.by_uuid.lock().await.insert(uuid.to_string(), id);
        }

        pub async fn dispatched(&self) -> Vec<(String, String, String)> {
            self.dispatches.lock().await.clone()
        }
    }

    #[async_trait]
    impl WorkflowClient for FakeWorkflowClient {
        async fn dispatch(
            &self,
            workflow: &str,
            git_ref: &str,
            uuid: &str,
            _inputs: &BTreeMap<String, String>,
        ) -> Result<(), ClientError> {
            self.dispatches
                .lock()
                .await
                .push((workflow.to_string(), git_ref.to_string(), uuid.to_string()));
            Ok(())
        }

        async fn find_run_by_uuid(
            &self,
            _workflow: &str,
            _since: DateTime<Utc>,
            uuid: &str,
        ) -> Result<Option<WorkflowRun>, ClientError> {
            let by_uuid = self.by_uuid.lock().await;
            let Some(id) = by_uuid.get(uuid) else {
                return Ok(None);
            };
            let runs = self.runs.lock().await;
            Ok(runs.get(id).map(|r| r.run.clone()))
        }

        async fn get_run(&self, run_id: u64) -> Result<WorkflowRun, ClientError> {
            self.runs
                .lock()
                .await
                .get(&run_id)
                .map(|r| r.run.clone())
                .ok_or(ClientError::NotFound)
        }

        async fn list_artifacts(&self, run_id: u64) -> Result<Vec<RemoteArtifact>, ClientError> {
            self.runs
                .lock()
                .await
                .get(&run_id)
                .map(|r| r.artifacts.clone())
                .ok_or(ClientError::NotFound)
        }

        async fn download_artifact(
            &self,
            artifact: &RemoteArtifact,
        ) -> Result<Vec<u8>, ClientError> {
            Ok(artifact.name.clone().into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;

    #[tokio::test]
    async fn fake_client_records_dispatch_with_uuid() {
        let client = FakeWorkflowClient::new();
        client
            .dispatch("build.yml", "main", "uuid-1", &BTreeMap::new())
            .await
            .expect("dispatch");
        let dispatched = client.dispatched().await;
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].2, "uuid-1");
    }

    #[tokio::test]
    async fn fake_client_finds_scripted_run_by_uuid() {
        let client = FakeWorkflowClient::new();
        client
            .script_run(
                "uuid-1",
                ScriptedRun {
                    run: WorkflowRun {
                        id: 42,
                        url: "https://example.invalid/runs/42".to_string(),
                        conclusion: None,
                        started_at: Utc::now(),
                        updated_at: Utc::now(),
                    },
                    artifacts: vec![],
                },
            )
            .await;

        let found = client
            .find_run_by_uuid("build.yml", Utc::now() - chrono::Duration::hours(1), "uuid-1")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.id, 42);
    }

    #[tokio::test]
    async fn fake_client_unknown_run_is_not_found() {
        let client = FakeWorkflowClient::new();
        let err = client.get_run(999).await.expect_err("missing run");
        assert!(matches!(err, ClientError::NotFound));
    }

    #[test]
    fn parse_conclusion_maps_known_values() {
        assert_eq!(parse_conclusion("success"), Some(RunConclusion::Success));
        assert_eq!(parse_conclusion("failure"), Some(RunConclusion::Failure));
        assert_eq!(parse_conclusion("cancelled"), Some(RunConclusion::Cancelled));
        assert_eq!(parse_conclusion("timed_out"), Some(RunConclusion::TimedOut));
        assert_eq!(parse_conclusion("neutral"), None);
    }
}
