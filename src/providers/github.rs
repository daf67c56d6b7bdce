//! GitHub REST adapter for the `GitProvider` contract.
//!
//! Covers the label, comment, branch, and pull-request operations the engine
//! needs. Rate limits and server errors are reported retryable; 4xx
//! rejections are not.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::GithubSection;
use crate::errors::{EngineError, EngineResult};
use crate::providers::{CredentialResolver, GitProvider, PullRequestSpec, RemoteItem};

const USER_AGENT: &str = concat!("foreman/", env!("CARGO_PKG_VERSION"));

/// Environment variable the token is resolved from.
pub const TOKEN_VAR: &str = "GITHUB_TOKEN";

#[derive(Debug, Deserialize)]
struct ApiIssue {
    number: i64,
    title: String,
    body: Option<String>,
    labels: Vec<ApiLabel>,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

impl From<ApiIssue> for RemoteItem {
    fn from(issue: ApiIssue) -> Self {
        Self {
            id: issue.number.to_string(),
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    number: i64,
}

#[derive(Debug, Deserialize)]
struct ApiRef {
    object: ApiRefObject,
}

#[derive(Debug, Deserialize)]
struct ApiRefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ApiRepo {
    default_branch: String,
}

/// GitHub-backed implementation of `GitProvider`.
#[derive(Debug)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
    repo: String,
    token: String,
}

impl GitHubClient {
    /// Build a client from configuration and a credential resolver. Fails
    /// with a `Configuration` error when the repo slug or token is missing —
    /// before any item is processed.
    pub fn new(
        config: &GithubSection,
        credentials: &dyn CredentialResolver,
    ) -> EngineResult<Self> {
        let repo = config.repo.clone().ok_or_else(|| {
            EngineError::Configuration("github.repo is not configured".to_string())
        })?;
        let token = credentials.resolve(TOKEN_VAR).ok_or_else(|| {
            EngineError::Configuration(format!("{} is not set", TOKEN_VAR))
        })?;

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| EngineError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            repo,
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_base, self.repo, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    /// Send a request and map the response status onto the engine taxonomy.
    /// 429 and 5xx are retryable; other non-success statuses are permanent.
    async fn send(&self, builder: reqwest::RequestBuilder) -> EngineResult<reqwest::Response> {
        let response = builder.send().await.map_err(|e| EngineError::ExternalService {
            message: format!("GitHub request failed: {}", e),
            retryable: true,
            status: None,
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retryable = status.as_u16() == 429 || status.is_server_error();
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::ExternalService {
            message: format!("GitHub returned {}: {}", status, truncate(&body, 200)),
            retryable,
            status: Some(status.as_u16()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> EngineResult<T> {
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        response.json().await.map_err(|e| EngineError::ExternalService {
            message: format!("Failed to decode GitHub response: {}", e),
            retryable: false,
            status: None,
        })
    }

    async fn default_branch_sha(&self) -> EngineResult<(String, String)> {
        let repo: ApiRepo = self
            .get_json(format!("{}/repos/{}", self.api_base, self.repo))
            .await?;
        let branch_ref: ApiRef = self
            .get_json(self.url(&format!("git/ref/heads/{}", repo.default_branch)))
            .await?;
        Ok((repo.default_branch, branch_ref.object.sha))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

#[async_trait]
impl GitProvider for GitHubClient {
    async fn get_item(&self, id: &str) -> EngineResult<RemoteItem> {
        let issue: ApiIssue = self.get_json(self.url(&format!("issues/{}", id))).await?;
        Ok(issue.into())
    }

    async fn list_labels(&self, id: &str) -> EngineResult<Vec<String>> {
        let labels: Vec<ApiLabel> = self
            .get_json(self.url(&format!("issues/{}/labels", id)))
            .await?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    async fn add_label(&self, id: &str, label: &str) -> EngineResult<()> {
        self.send(
            self.request(reqwest::Method::POST, self.url(&format!("issues/{}/labels", id)))
                .json(&json!({ "labels": [label] })),
        )
        .await?;
        Ok(())
    }

    async fn remove_label(&self, id: &str, label: &str) -> EngineResult<()> {
        let result = self
            .send(self.request(
                reqwest::Method::DELETE,
                self.url(&format!("issues/{}/labels/{}", id, label)),
            ))
            .await;

        // Removing a label that is already gone is not a failure.
        match result {
            Ok(_) => Ok(()),
            Err(EngineError::ExternalService { status: Some(404), .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn post_comment(&self, id: &str, text: &str) -> EngineResult<()> {
        self.send(
            self.request(reqwest::Method::POST, self.url(&format!("issues/{}/comments", id)))
                .json(&json!({ "body": text })),
        )
        .await?;
        Ok(())
    }

    async fn create_branch(&self, name: &str) -> EngineResult<String> {
        let (_, sha) = self.default_branch_sha().await?;
        let result = self
            .send(
                self.request(reqwest::Method::POST, self.url("git/refs"))
                    .json(&json!({ "ref": format!("refs/heads/{}", name), "sha": sha })),
            )
            .await;

        match result {
            Ok(_) => Ok(name.to_string()),
            // 422: ref already exists — idempotent for resume.
            Err(EngineError::ExternalService { status: Some(422), .. }) => Ok(name.to_string()),
            Err(e) => Err(e),
        }
    }

    async fn create_pull_request(&self, spec: &PullRequestSpec) -> EngineResult<String> {
        // An empty base means "the repository's default branch".
        let base = if spec.base.is_empty() {
            let (default_branch, _) = self.default_branch_sha().await?;
            default_branch
        } else {
            spec.base.clone()
        };

        let response = self
            .send(
                self.request(reqwest::Method::POST, self.url("pulls")).json(&json!({
                    "title": spec.title,
                    "body": spec.body,
                    "head": spec.head,
                    "base": base,
                })),
            )
            .await?;

        let pull: ApiPull = response.json().await.map_err(|e| EngineError::ExternalService {
            message: format!("Failed to decode pull response: {}", e),
            retryable: false,
            status: None,
        })?;
        Ok(pull.number.to_string())
    }

    async fn merge_pull_request(&self, id: &str) -> EngineResult<()> {
        let result = self
            .send(self.request(reqwest::Method::PUT, self.url(&format!("pulls/{}/merge", id))))
            .await;

        match result {
            Ok(_) => Ok(()),
            // 405/409: not mergeable — surfaced as a merge conflict so the
            // recovery manager can route it to conflict resolution.
            Err(EngineError::ExternalService { status: Some(405 | 409), message, .. }) => {
                Err(EngineError::MergeConflict(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn list_triggered(&self, label: &str) -> EngineResult<Vec<RemoteItem>> {
        let url = format!(
            "{}/repos/{}/issues?labels={}&state=open&per_page=100",
            self.api_base, self.repo, label
        );
        let issues: Vec<ApiIssue> = self.get_json(url).await?;
        Ok(issues.into_iter().map(RemoteItem::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GithubSection;

    struct FixedCredentials(Option<String>);

    impl CredentialResolver for FixedCredentials {
        fn resolve(&self, _key: &str) -> Option<String> {
            self.0.clone()
        }
    }

    fn section(repo: Option<&str>) -> GithubSection {
        GithubSection {
            repo: repo.map(String::from),
            api_base: "https://api.github.com".to_string(),
        }
    }

    #[test]
    fn missing_repo_is_a_configuration_error() {
        let err = GitHubClient::new(&section(None), &FixedCredentials(Some("t".into())))
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn missing_token_is_a_configuration_error() {
        let err = GitHubClient::new(&section(Some("acme/widgets")), &FixedCredentials(None))
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.to_string().contains("GITHUB_TOKEN"));
    }

    #[test]
    fn urls_are_rooted_at_the_repo() {
        let client = GitHubClient::new(
            &section(Some("acme/widgets")),
            &FixedCredentials(Some("t".into())),
        )
        .unwrap();
        assert_eq!(
            client.url("issues/42/labels"),
            "https://api.github.com/repos/acme/widgets/issues/42/labels"
        );
    }

    #[test]
    fn api_issue_maps_to_remote_item() {
        let issue = ApiIssue {
            number: 42,
            title: "Add widgets".to_string(),
            body: None,
            labels: vec![ApiLabel { name: "needs-planning".to_string() }],
        };
        let item: RemoteItem = issue.into();
        assert_eq!(item.id, "42");
        assert_eq!(item.labels, vec!["needs-planning"]);
        assert!(item.body.is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
