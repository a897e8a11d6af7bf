use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, ACCEPT, ETAG, IF_NONE_MATCH, LINK};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::error::{FetchError, WriteError};
use crate::github::api_types::{
  ApiComment, ApiErrorBody, ApiIssue, ApiIssueEvent, ApiLabel, ApiMilestone, ApiUser,
  CreateIssueBody, CreateLabelBody, CreateMilestoneBody, SetLabelsBody,
};
use crate::model::{Comment, Issue, Label, Milestone, ProjectRef, ResourceKind};
use crate::sync::remote::{FetchOutcome, FetchRequest, Payload, RemoteWriter, ResourceFetcher};

const PER_PAGE: &str = "100";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("hubsync/", env!("CARGO_PKG_VERSION"));

/// How much of a paginated list to transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pages {
  First,
  All,
}

/// Result of a conditional list request
enum Listing<T> {
  NotModified,
  Fresh { items: Vec<T>, etag: Option<String> },
}

/// GitHub REST API client
#[derive(Clone)]
pub struct GithubClient {
  http: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl GithubClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = Url::parse(&config.github.api_url)
      .map_err(|e| eyre!("Invalid GitHub API URL '{}': {}", config.github.api_url, e))?;

    let http = reqwest::Client::builder()
      .user_agent(USER_AGENT)
      .timeout(REQUEST_TIMEOUT)
      .connect_timeout(CONNECT_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let token = Config::get_api_token();
    if token.is_none() {
      debug!("No GitHub token configured, remote writes are disabled");
    }

    Ok(Self { http, base, token })
  }

  /// Build `<api>/repos/<owner>/<repo>/<path>`.
  fn repo_url(&self, project: &ProjectRef, path: &str) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
      segments
        .pop_if_empty()
        .extend(["repos", project.owner.as_str(), project.name.as_str()])
        .extend(path.split('/'));
    }
    url
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let req = self
      .http
      .request(method, url)
      .header(ACCEPT, "application/vnd.github+json")
      .header("X-GitHub-Api-Version", "2022-11-28");

    match &self.token {
      Some(token) => req.bearer_auth(token),
      None => req,
    }
  }

  /// Fetch a list, conditionally on `token` for the first page.
  async fn fetch_list<T: DeserializeOwned>(
    &self,
    kind: ResourceKind,
    mut url: Url,
    token: Option<&str>,
    pages: Pages,
  ) -> Result<Listing<T>, FetchError> {
    url.query_pairs_mut().append_pair("per_page", PER_PAGE);

    let mut req = self.request(Method::GET, url);
    if let Some(token) = token {
      req = req.header(IF_NONE_MATCH, token);
    }

    let response = req.send().await.map_err(fetch_error)?;
    if response.status() == StatusCode::NOT_MODIFIED {
      debug!(kind = %kind, "Not modified");
      return Ok(Listing::NotModified);
    }

    let response = check_status(response).await?;
    let etag = header_str(response.headers(), ETAG);
    let mut next = match pages {
      Pages::All => next_page(response.headers()),
      Pages::First => None,
    };
    let mut items: Vec<T> = parse_json(kind, response).await?;

    while let Some(url) = next {
      let response = self
        .request(Method::GET, url)
        .send()
        .await
        .map_err(fetch_error)?;
      let response = check_status(response).await?;
      next = next_page(response.headers());
      items.extend(parse_json::<Vec<T>>(kind, response).await?);
    }

    Ok(Listing::Fresh { items, etag })
  }

  /// Most recently updated issues first; its first page changes whenever any issue does.
  fn issues_freshness_url(&self, project: &ProjectRef) -> Url {
    let mut url = self.repo_url(project, "issues");
    url
      .query_pairs_mut()
      .append_pair("state", "all")
      .append_pair("sort", "updated")
      .append_pair("direction", "desc");
    url
  }

  /// Full listing (newest first), or the issues updated after `since`.
  fn issues_url(&self, project: &ProjectRef, since: Option<DateTime<Utc>>) -> Url {
    match since {
      Some(since) => {
        let mut url = self.issues_freshness_url(project);
        url
          .query_pairs_mut()
          .append_pair("since", &format_since(since));
        url
      }
      None => {
        let mut url = self.repo_url(project, "issues");
        url.query_pairs_mut().append_pair("state", "all");
        url
      }
    }
  }

  async fn fetch_issues(&self, request: &FetchRequest) -> Result<FetchOutcome, FetchError> {
    // The token guards the first page of the update-ordered listing
    let etag = match self
      .fetch_list::<ApiIssue>(
        ResourceKind::Issues,
        self.issues_freshness_url(&request.project),
        request.token.as_deref(),
        Pages::First,
      )
      .await?
    {
      Listing::NotModified => return Ok(FetchOutcome::NotModified),
      Listing::Fresh { etag, .. } => etag,
    };

    let url = self.issues_url(&request.project, request.since);
    let items = match self
      .fetch_list::<ApiIssue>(ResourceKind::Issues, url, None, Pages::All)
      .await?
    {
      Listing::Fresh { items, .. } => items,
      Listing::NotModified => Vec::new(),
    };

    let issues = items
      .into_iter()
      .filter(|i| !i.is_pull_request())
      .map(Into::into)
      .collect();

    Ok(FetchOutcome::Fresh {
      payload: Payload::Issues(issues),
      token: etag,
    })
  }

  async fn fetch_collaborators(&self, request: &FetchRequest) -> Result<FetchOutcome, FetchError> {
    let url = self.repo_url(&request.project, "collaborators");
    match self
      .fetch_list::<ApiUser>(
        ResourceKind::Collaborators,
        url,
        request.token.as_deref(),
        Pages::All,
      )
      .await
    {
      Ok(listing) => Ok(fresh_or_not_modified(listing, Payload::Collaborators)),
      // Listing collaborators needs push access; public repositories deny it
      Err(FetchError::Remote { status, .. }) if status == 403 || status == 404 => {
        debug!(project = %request.project, status, "Collaborators not visible");
        Ok(FetchOutcome::Fresh {
          payload: Payload::Collaborators(Vec::new()),
          token: None,
        })
      }
      Err(e) => Err(e),
    }
  }

  async fn fetch_feed(&self, request: &FetchRequest) -> Result<FetchOutcome, FetchError> {
    let url = self.repo_url(&request.project, "issues/events");
    let listing = self
      .fetch_list::<ApiIssueEvent>(ResourceKind::Feed, url, None, Pages::First)
      .await?;
    Ok(fresh_or_not_modified(listing, Payload::Feed))
  }

  async fn dispatch(&self, request: &FetchRequest) -> Result<FetchOutcome, FetchError> {
    let token = request.token.as_deref();
    match request.kind {
      ResourceKind::Issues => self.fetch_issues(request).await,
      ResourceKind::Labels => {
        let url = self.repo_url(&request.project, "labels");
        let listing = self
          .fetch_list::<ApiLabel>(ResourceKind::Labels, url, token, Pages::All)
          .await?;
        Ok(fresh_or_not_modified(listing, Payload::Labels))
      }
      ResourceKind::Milestones => {
        let mut url = self.repo_url(&request.project, "milestones");
        url.query_pairs_mut().append_pair("state", "all");
        let listing = self
          .fetch_list::<ApiMilestone>(ResourceKind::Milestones, url, token, Pages::All)
          .await?;
        Ok(fresh_or_not_modified(listing, Payload::Milestones))
      }
      ResourceKind::Collaborators => self.fetch_collaborators(request).await,
      ResourceKind::Feed => self.fetch_feed(request).await,
    }
  }

  /// Get all comments of an issue
  pub async fn fetch_comments(
    &self,
    project: &ProjectRef,
    issue_id: u64,
  ) -> Result<Vec<Comment>, FetchError> {
    let url = self.repo_url(project, &format!("issues/{}/comments", issue_id));
    match self
      .fetch_list::<ApiComment>(ResourceKind::Issues, url, None, Pages::All)
      .await?
    {
      Listing::Fresh { items, .. } => Ok(items.into_iter().map(Into::into).collect()),
      Listing::NotModified => Ok(Vec::new()),
    }
  }

  /// Open a new issue, returning it as stored remotely.
  pub async fn create_issue(
    &self,
    project: &ProjectRef,
    title: &str,
    labels: &[String],
  ) -> Result<Issue, WriteError> {
    self.require_token()?;
    let url = self.repo_url(project, "issues");

    let response = self
      .request(Method::POST, url)
      .json(&CreateIssueBody { title, labels })
      .send()
      .await
      .map_err(|e| WriteError::Other(e.to_string()))?;

    let response = check_write_status(response).await?;
    let created: ApiIssue = response
      .json()
      .await
      .map_err(|e| WriteError::Other(format!("Failed to parse created issue: {}", e)))?;

    Ok(created.into())
  }

  pub async fn delete_label(&self, project: &ProjectRef, name: &str) -> Result<(), WriteError> {
    self.require_token()?;
    let url = self.repo_url(project, &format!("labels/{}", name));

    let response = self
      .request(Method::DELETE, url)
      .send()
      .await
      .map_err(|e| WriteError::Other(e.to_string()))?;

    check_write_status(response).await.map(|_| ())
  }

  pub async fn create_milestone(
    &self,
    project: &ProjectRef,
    title: &str,
  ) -> Result<Milestone, WriteError> {
    self.require_token()?;
    let url = self.repo_url(project, "milestones");

    let response = self
      .request(Method::POST, url)
      .json(&CreateMilestoneBody { title })
      .send()
      .await
      .map_err(|e| WriteError::Other(e.to_string()))?;

    let response = check_write_status(response).await?;
    let created: ApiMilestone = response
      .json()
      .await
      .map_err(|e| WriteError::Other(format!("Failed to parse created milestone: {}", e)))?;

    Ok(created.into())
  }

  /// Milestones are addressed by number, not title.
  pub async fn delete_milestone(
    &self,
    project: &ProjectRef,
    number: u64,
  ) -> Result<(), WriteError> {
    self.require_token()?;
    let url = self.repo_url(project, &format!("milestones/{}", number));

    let response = self
      .request(Method::DELETE, url)
      .send()
      .await
      .map_err(|e| WriteError::Other(e.to_string()))?;

    check_write_status(response).await.map(|_| ())
  }

  fn require_token(&self) -> Result<(), WriteError> {
    match self.token {
      Some(_) => Ok(()),
      None => Err(WriteError::PermissionDenied(
        "no GitHub token configured".to_string(),
      )),
    }
  }
}

impl ResourceFetcher for GithubClient {
  async fn fetch(&self, request: FetchRequest) -> FetchOutcome {
    match self.dispatch(&request).await {
      Ok(outcome) => outcome,
      Err(e) => {
        warn!(project = %request.project, kind = %request.kind, "Fetch failed: {}", e);
        FetchOutcome::Failed(e)
      }
    }
  }
}

impl RemoteWriter for GithubClient {
  async fn set_labels(
    &self,
    project: &ProjectRef,
    issue_id: u64,
    labels: &[String],
  ) -> Result<(), WriteError> {
    self.require_token()?;
    let url = self.repo_url(project, &format!("issues/{}/labels", issue_id));

    let response = self
      .request(Method::PUT, url)
      .json(&SetLabelsBody { labels })
      .send()
      .await
      .map_err(|e| WriteError::Other(e.to_string()))?;

    check_write_status(response).await.map(|_| ())
  }

  async fn create_label(&self, project: &ProjectRef, label: &Label) -> Result<Label, WriteError> {
    self.require_token()?;
    let url = self.repo_url(project, "labels");

    let response = self
      .request(Method::POST, url)
      .json(&CreateLabelBody::from(label))
      .send()
      .await
      .map_err(|e| WriteError::Other(e.to_string()))?;

    let response = check_write_status(response).await?;
    let created: ApiLabel = response
      .json()
      .await
      .map_err(|e| WriteError::Other(format!("Failed to parse created label: {}", e)))?;

    Ok(created.into())
  }
}

// ============================================================================
// Response helpers
// ============================================================================

fn fresh_or_not_modified<T, E: From<T>>(
  listing: Listing<T>,
  wrap: impl FnOnce(Vec<E>) -> Payload,
) -> FetchOutcome {
  match listing {
    Listing::NotModified => FetchOutcome::NotModified,
    Listing::Fresh { items, etag } => FetchOutcome::Fresh {
      payload: wrap(items.into_iter().map(E::from).collect()),
      token: etag,
    },
  }
}

fn fetch_error(e: reqwest::Error) -> FetchError {
  if e.is_timeout() {
    FetchError::Timeout(REQUEST_TIMEOUT)
  } else if e.is_connect() || e.is_request() {
    FetchError::NetworkUnavailable(e.to_string())
  } else {
    FetchError::Remote {
      status: e.status().map(|s| s.as_u16()).unwrap_or_default(),
      message: e.to_string(),
    }
  }
}

async fn error_message(response: Response) -> String {
  let status = response.status();
  match response.json::<ApiErrorBody>().await {
    Ok(body) if !body.message.is_empty() => body.message,
    _ => status
      .canonical_reason()
      .unwrap_or("unknown error")
      .to_string(),
  }
}

async fn check_status(response: Response) -> Result<Response, FetchError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  Err(FetchError::Remote {
    status: status.as_u16(),
    message: error_message(response).await,
  })
}

async fn check_write_status(response: Response) -> Result<Response, WriteError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let message = format!("{}: {}", status.as_u16(), error_message(response).await);
  if is_permission_status(status) {
    Err(WriteError::PermissionDenied(message))
  } else {
    Err(WriteError::Other(message))
  }
}

/// GitHub answers 404 instead of 403 for repositories the credential cannot write.
fn is_permission_status(status: StatusCode) -> bool {
  matches!(
    status,
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
  )
}

async fn parse_json<T: DeserializeOwned>(
  kind: ResourceKind,
  response: Response,
) -> Result<T, FetchError> {
  let bytes = response.bytes().await.map_err(fetch_error)?;
  serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed {
    kind,
    reason: e.to_string(),
  })
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
  headers
    .get(name)
    .and_then(|v| v.to_str().ok())
    .map(String::from)
}

fn next_page(headers: &HeaderMap) -> Option<Url> {
  header_str(headers, LINK).and_then(|link| parse_next_link(&link))
}

/// Extract the `rel="next"` target of a `Link` header.
fn parse_next_link(link: &str) -> Option<Url> {
  link.split(',').find_map(|part| {
    let (target, params) = part.split_once(';')?;
    if !params.split(';').any(|p| p.trim() == "rel=\"next\"") {
      return None;
    }
    let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
    Url::parse(target).ok()
  })
}

fn format_since(since: DateTime<Utc>) -> String {
  since.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn client() -> GithubClient {
    GithubClient::new(&Config::default()).unwrap()
  }

  #[test]
  fn test_repo_url() {
    let url = client().repo_url(&ProjectRef::new("octo", "hello"), "issues/7/labels");
    assert_eq!(url.as_str(), "https://api.github.com/repos/octo/hello/issues/7/labels");
  }

  #[test]
  fn test_repo_url_keeps_enterprise_prefix() {
    let mut config = Config::default();
    config.github.api_url = "https://ghe.example.com/api/v3".to_string();
    let client = GithubClient::new(&config).unwrap();

    let url = client.repo_url(&ProjectRef::new("octo", "hello"), "labels");
    assert_eq!(url.as_str(), "https://ghe.example.com/api/v3/repos/octo/hello/labels");
  }

  #[test]
  fn test_issue_freshness_url_orders_by_update() {
    let url = client().issues_freshness_url(&ProjectRef::new("octo", "hello"));
    assert_eq!(url.path(), "/repos/octo/hello/issues");
    assert_eq!(url.query(), Some("state=all&sort=updated&direction=desc"));
  }

  #[test]
  fn test_issue_delta_url() {
    let client = client();
    let project = ProjectRef::new("octo", "hello");
    let since = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    let delta = client.issues_url(&project, Some(since));
    assert_eq!(
      delta.query(),
      Some("state=all&sort=updated&direction=desc&since=2024-03-01T12%3A00%3A00Z")
    );

    let full = client.issues_url(&project, None);
    assert_eq!(full.query(), Some("state=all"));
  }

  #[test]
  fn test_parse_next_link() {
    let link = r#"<https://api.github.com/repositories/1/issues?page=2>; rel="next", <https://api.github.com/repositories/1/issues?page=5>; rel="last""#;
    let next = parse_next_link(link).unwrap();
    assert_eq!(next.as_str(), "https://api.github.com/repositories/1/issues?page=2");

    let last_page = r#"<https://api.github.com/repositories/1/issues?page=1>; rel="prev""#;
    assert!(parse_next_link(last_page).is_none());
  }

  #[test]
  fn test_permission_statuses() {
    assert!(is_permission_status(StatusCode::FORBIDDEN));
    assert!(is_permission_status(StatusCode::NOT_FOUND));
    assert!(!is_permission_status(StatusCode::UNPROCESSABLE_ENTITY));
  }

  #[tokio::test]
  async fn test_writes_without_token_are_denied() {
    let mut client = client();
    client.token = None;
    let project = ProjectRef::new("octo", "hello");

    let err = client.create_issue(&project, "Crash", &[]).await.unwrap_err();
    assert!(err.is_permission_denied());
    let err = client.delete_milestone(&project, 1).await.unwrap_err();
    assert!(err.is_permission_denied());
  }

  #[test]
  fn test_format_since() {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    assert_eq!(format_since(at), "2024-03-01T12:00:00Z");
  }
}
