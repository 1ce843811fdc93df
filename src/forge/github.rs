//! forge::github
//!
//! GitHub forge implementation using REST and GraphQL APIs.
//!
//! # Design
//!
//! This module implements the `ForgeClient` trait for GitHub. It uses:
//! - GraphQL for PR search (the search API is the only endpoint that
//!   returns merge-state and review-decision in bulk)
//! - REST for everything else (issue search, statuses, check runs,
//!   merging, changed files, branch protection)
//!
//! # Authentication
//!
//! All API calls require a token with `repo` scope. With org-scoped
//! installation tokens, run one client per org and enable org-scoped
//! query planning so no search spans orgs.
//!
//! # Deadlines
//!
//! Every call carries a deadline: one minute for interactive calls, ten
//! minutes for merges. Deadline expiry surfaces as `ForgeError::Timeout`.
//!
//! # Rate Limiting
//!
//! Returns `ForgeError::RateLimited` when limits are hit. Backoff is the
//! caller's responsibility (the sync controller isolates and retries per
//! shard).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use super::traits::{
    ForgeClient, ForgeError, Issue, MergeOutcome, MergeRequest, StatusPayload,
};
use crate::core::types::{
    BranchName, ContextMap, ContextState, MergeableState, PrKey, PullRequest, ReviewDecision, Sha,
};

/// Default GitHub API base URL.
const DEFAULT_API_BASE: &str = "https://api.github.com";

/// User-Agent header value for API requests.
const USER_AGENT_VALUE: &str = "tideway";

/// Deadline for interactive calls (search, statuses, protection).
const INTERACTIVE_DEADLINE: Duration = Duration::from_secs(60);

/// Deadline for merge calls.
const MERGE_DEADLINE: Duration = Duration::from_secs(600);

/// GitHub forge implementation.
#[derive(Debug, Clone)]
pub struct GitHubForge {
    /// HTTP client for making requests.
    client: Client,
    /// Access token for authentication.
    token: String,
    /// API base URL (configurable for GitHub Enterprise and tests).
    api_base: String,
}

impl GitHubForge {
    /// Create a new GitHub forge client.
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base(token, DEFAULT_API_BASE)
    }

    /// Create a GitHub forge client with a custom API base URL.
    ///
    /// Use this for GitHub Enterprise installations (and tests).
    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            token: token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Build common headers for API requests.
    fn headers(&self) -> Result<HeaderMap, ForgeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|_| ForgeError::AuthFailed("token contains invalid characters".into()))?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        Ok(headers)
    }

    /// Build URL for a repository endpoint.
    fn repo_url(&self, org: &str, repo: &str, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_base, org, repo, path)
    }

    fn map_send_error(e: reqwest::Error) -> ForgeError {
        if e.is_timeout() {
            ForgeError::Timeout(e.to_string())
        } else {
            ForgeError::NetworkError(e.to_string())
        }
    }

    /// Handle API response, mapping errors appropriately.
    async fn handle_response<T: for<'de> Deserialize<'de>>(
        &self,
        response: Response,
    ) -> Result<T, ForgeError> {
        let status = response.status();
        if status.is_success() {
            response.json().await.map_err(|e| ForgeError::ApiError {
                status: status.as_u16(),
                message: format!("failed to parse response: {}", e),
            })
        } else {
            Err(Self::error_from_response(response, status).await)
        }
    }

    /// Map an error response from the API to a `ForgeError`.
    async fn error_from_response(response: Response, status: StatusCode) -> ForgeError {
        // 403 with an exhausted rate-limit header is a rate limit, not a
        // permission problem.
        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "0")
            .unwrap_or(false);

        let message = match response.json::<GitHubErrorBody>().await {
            Ok(err) => err.message,
            Err(_) => "unknown error".to_string(),
        };

        match status {
            StatusCode::UNAUTHORIZED => ForgeError::AuthFailed("invalid or expired token".into()),
            StatusCode::FORBIDDEN if remaining => ForgeError::RateLimited,
            StatusCode::FORBIDDEN => ForgeError::AuthFailed(format!("permission denied: {message}")),
            StatusCode::NOT_FOUND => ForgeError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => ForgeError::RateLimited,
            _ => ForgeError::ApiError {
                status: status.as_u16(),
                message,
            },
        }
    }

    /// Execute one page of the GraphQL PR search.
    async fn search_page(
        &self,
        query: &str,
        cursor: Option<&str>,
    ) -> Result<SearchConnection, ForgeError> {
        let body = serde_json::json!({
            "query": PR_SEARCH_QUERY,
            "variables": { "q": query, "cursor": cursor },
        });

        let response = self
            .client
            .post(format!("{}/graphql", self.api_base))
            .headers(self.headers()?)
            .timeout(INTERACTIVE_DEADLINE)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_from_response(response, status).await);
        }

        let result: GraphQlResponse<SearchData> =
            response.json().await.map_err(|e| ForgeError::ApiError {
                status: status.as_u16(),
                message: format!("failed to parse GraphQL response: {}", e),
            })?;

        if let Some(errors) = result.errors {
            if let Some(first) = errors.first() {
                return Err(ForgeError::ApiError {
                    status: 200,
                    message: first.message.clone(),
                });
            }
        }

        result
            .data
            .map(|d| d.search)
            .ok_or_else(|| ForgeError::ApiError {
                status: 200,
                message: "GraphQL response missing data".into(),
            })
    }
}

/// GraphQL document for the PR search.
const PR_SEARCH_QUERY: &str = r#"
query($q: String!, $cursor: String) {
  search(query: $q, type: ISSUE, first: 100, after: $cursor) {
    pageInfo { hasNextPage endCursor }
    nodes {
      ... on PullRequest {
        number
        title
        isDraft
        author { login }
        baseRefName
        baseRef { target { oid } }
        headRefOid
        headRefName
        mergeable
        reviewDecision
        labels(first: 100) { nodes { name } }
        milestone { title }
        repository { name owner { login } }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GitHubErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    search: SearchConnection,
}

#[derive(Debug, Deserialize)]
struct SearchConnection {
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
    nodes: Vec<SearchNode>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
}

/// One search node. Non-PR nodes deserialize with all fields absent and
/// are skipped.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchNode {
    number: Option<u64>,
    title: Option<String>,
    #[serde(rename = "isDraft")]
    is_draft: bool,
    author: Option<Actor>,
    #[serde(rename = "baseRefName")]
    base_ref_name: Option<String>,
    #[serde(rename = "baseRef")]
    base_ref: Option<BaseRef>,
    #[serde(rename = "headRefOid")]
    head_ref_oid: Option<String>,
    #[serde(rename = "headRefName")]
    head_ref_name: Option<String>,
    mergeable: Option<String>,
    #[serde(rename = "reviewDecision")]
    review_decision: Option<String>,
    labels: Option<LabelConnection>,
    milestone: Option<Milestone>,
    repository: Option<RepositoryRef>,
}

#[derive(Debug, Deserialize)]
struct Actor {
    login: String,
}

#[derive(Debug, Deserialize)]
struct BaseRef {
    target: Option<OidHolder>,
}

#[derive(Debug, Deserialize)]
struct OidHolder {
    oid: String,
}

#[derive(Debug, Deserialize)]
struct LabelConnection {
    nodes: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Milestone {
    title: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    name: String,
    owner: Actor,
}

impl SearchNode {
    /// Convert a search node into a PR snapshot, or `None` for non-PR
    /// nodes and nodes with malformed identities.
    fn into_pull_request(self) -> Option<PullRequest> {
        let number = self.number?;
        let repository = self.repository?;
        let head_sha = Sha::new(self.head_ref_oid?).ok()?;
        let base_branch = BranchName::new(self.base_ref_name?).ok()?;
        let mergeable = match self.mergeable.as_deref() {
            Some("MERGEABLE") => MergeableState::Clean,
            Some("CONFLICTING") => MergeableState::Conflicting,
            _ => MergeableState::Unknown,
        };
        let review_decision = match self.review_decision.as_deref() {
            Some("APPROVED") => Some(ReviewDecision::Approved),
            Some("CHANGES_REQUESTED") => Some(ReviewDecision::ChangesRequested),
            Some("REVIEW_REQUIRED") => Some(ReviewDecision::ReviewRequired),
            _ => None,
        };

        Some(PullRequest {
            key: PrKey::new(repository.owner.login, repository.name, number),
            title: self.title.unwrap_or_default(),
            author: self.author.map(|a| a.login).unwrap_or_default(),
            head_sha,
            head_ref: self.head_ref_name.unwrap_or_default(),
            base_branch,
            base_sha: self
                .base_ref
                .and_then(|b| b.target)
                .and_then(|t| Sha::new(t.oid).ok()),
            labels: self
                .labels
                .map(|l| l.nodes.into_iter().map(|n| n.name).collect())
                .unwrap_or_default(),
            milestone: self.milestone.map(|m| m.title),
            draft: self.is_draft,
            mergeable,
            review_decision,
            contexts: ContextMap::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct IssueSearchPage {
    items: Vec<IssueSearchItem>,
}

#[derive(Debug, Deserialize)]
struct IssueSearchItem {
    number: u64,
    title: String,
    repository_url: String,
}

#[derive(Debug, Deserialize)]
struct CombinedStatus {
    statuses: Vec<CommitStatus>,
}

#[derive(Debug, Deserialize)]
struct CommitStatus {
    context: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct CheckRunPage {
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
}

impl CheckRun {
    /// Collapse GitHub's status/conclusion pair into a context state.
    fn context_state(&self) -> ContextState {
        if self.status != "completed" {
            return ContextState::Pending;
        }
        match self.conclusion.as_deref() {
            Some("success") | Some("neutral") | Some("skipped") => ContextState::Success,
            Some("cancelled") | Some("timed_out") | Some("stale") => ContextState::Error,
            _ => ContextState::Failure,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangedFile {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct RequiredStatusChecks {
    contexts: Vec<String>,
}

fn commit_status_state(state: &str) -> ContextState {
    match state {
        "success" => ContextState::Success,
        "pending" => ContextState::Pending,
        "failure" => ContextState::Failure,
        _ => ContextState::Error,
    }
}

#[async_trait]
impl ForgeClient for GitHubForge {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn search_pull_requests(&self, query: &str) -> Result<Vec<PullRequest>, ForgeError> {
        let mut prs = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.search_page(query, cursor.as_deref()).await?;
            prs.extend(
                page.nodes
                    .into_iter()
                    .filter_map(SearchNode::into_pull_request),
            );
            if !page.page_info.has_next_page {
                break;
            }
            cursor = page.page_info.end_cursor;
            if cursor.is_none() {
                break;
            }
        }

        Ok(prs)
    }

    async fn search_issues(&self, query: &str) -> Result<Vec<Issue>, ForgeError> {
        let mut issues = Vec::new();
        let mut page: u32 = 1;

        loop {
            let url = format!(
                "{}/search/issues?q={}&per_page=100&page={}",
                self.api_base,
                url::form_urlencoded::byte_serialize(query.as_bytes()).collect::<String>(),
                page
            );

            let response = self
                .client
                .get(&url)
                .headers(self.headers()?)
                .timeout(INTERACTIVE_DEADLINE)
                .send()
                .await
                .map_err(Self::map_send_error)?;

            let body: IssueSearchPage = self.handle_response(response).await?;
            let count = body.items.len();

            for item in body.items {
                // repository_url ends in /repos/{org}/{repo}
                let mut segments = item.repository_url.rsplit('/');
                let repo = segments.next().unwrap_or_default().to_string();
                let org = segments.next().unwrap_or_default().to_string();
                issues.push(Issue {
                    number: item.number,
                    title: item.title,
                    org,
                    repo,
                });
            }

            if count < 100 {
                break;
            }
            page += 1;
        }

        Ok(issues)
    }

    async fn combined_status(
        &self,
        org: &str,
        repo: &str,
        sha: &Sha,
    ) -> Result<ContextMap, ForgeError> {
        let mut contexts = ContextMap::new();

        let url = self.repo_url(org, repo, &format!("commits/{sha}/status"));
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .timeout(INTERACTIVE_DEADLINE)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let combined: CombinedStatus = self.handle_response(response).await?;
        for status in combined.statuses {
            contexts.insert(status.context, commit_status_state(&status.state));
        }

        let url = self.repo_url(org, repo, &format!("commits/{sha}/check-runs"));
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .timeout(INTERACTIVE_DEADLINE)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let checks: CheckRunPage = self.handle_response(response).await?;
        for run in checks.check_runs {
            let state = run.context_state();
            contexts.insert(run.name, state);
        }

        Ok(contexts)
    }

    async fn create_status(
        &self,
        org: &str,
        repo: &str,
        sha: &Sha,
        status: &StatusPayload,
    ) -> Result<(), ForgeError> {
        let url = self.repo_url(org, repo, &format!("statuses/{sha}"));
        let body = serde_json::json!({
            "context": status.context,
            "state": status.state,
            "description": status.description,
            "target_url": status.target_url,
        });

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .timeout(INTERACTIVE_DEADLINE)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let http_status = response.status();
        if http_status.is_success() {
            Ok(())
        } else {
            Err(Self::error_from_response(response, http_status).await)
        }
    }

    async fn merge(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        request: &MergeRequest,
    ) -> Result<MergeOutcome, ForgeError> {
        let url = self.repo_url(org, repo, &format!("pulls/{number}/merge"));
        let body = serde_json::json!({
            "sha": request.sha,
            "merge_method": request.method,
            "commit_title": request.commit_title,
            "commit_message": request.commit_body,
        });

        let response = self
            .client
            .put(&url)
            .headers(self.headers()?)
            .timeout(MERGE_DEADLINE)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(MergeOutcome::Merged);
        }
        // 405: PR not mergeable; 409: head sha moved since evaluation.
        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::CONFLICT {
            return Ok(MergeOutcome::Conflict);
        }
        Err(Self::error_from_response(response, status).await)
    }

    async fn pull_request_changes(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<String>, ForgeError> {
        let mut files = Vec::new();
        let mut page: u32 = 1;

        loop {
            let url = self.repo_url(
                org,
                repo,
                &format!("pulls/{number}/files?per_page=100&page={page}"),
            );
            let response = self
                .client
                .get(&url)
                .headers(self.headers()?)
                .timeout(INTERACTIVE_DEADLINE)
                .send()
                .await
                .map_err(Self::map_send_error)?;

            let batch: Vec<ChangedFile> = self.handle_response(response).await?;
            let count = batch.len();
            files.extend(batch.into_iter().map(|f| f.filename));

            if count < 100 {
                break;
            }
            page += 1;
        }

        Ok(files)
    }

    async fn branch_protection_contexts(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<String>, ForgeError> {
        let url = self.repo_url(
            org,
            repo,
            &format!("branches/{branch}/protection/required_status_checks"),
        );
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .timeout(INTERACTIVE_DEADLINE)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        match self.handle_response::<RequiredStatusChecks>(response).await {
            Ok(checks) => Ok(checks.contexts),
            // Unprotected branches report 404.
            Err(ForgeError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
