//! Serde-deserializable types matching GitHub REST API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Comment, FeedEvent, Issue, IssueState, Label, Milestone, User};

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiUser {
  pub id: u64,
  pub login: String,
  pub name: Option<String>,
  pub avatar_url: Option<String>,
}

impl From<ApiUser> for User {
  fn from(user: ApiUser) -> Self {
    User {
      id: user.id,
      login: user.login,
      name: user.name,
      avatar_url: user.avatar_url,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiLabel {
  pub name: String,
  #[serde(default)]
  pub color: String,
  pub description: Option<String>,
}

impl From<ApiLabel> for Label {
  fn from(label: ApiLabel) -> Self {
    Label {
      name: label.name,
      color: label.color,
      description: label.description,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiMilestoneRef {
  pub title: String,
}

// ============================================================================
// Issues
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiIssue {
  pub number: u64,
  pub title: String,
  pub body: Option<String>,
  #[serde(default)]
  pub state: IssueState,
  #[serde(default)]
  pub labels: Vec<ApiLabel>,
  pub milestone: Option<ApiMilestoneRef>,
  pub assignee: Option<ApiUser>,
  pub user: Option<ApiUser>,
  #[serde(default)]
  pub comments: u32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  /// Present when the entry is a pull request
  pub pull_request: Option<serde_json::Value>,
}

impl ApiIssue {
  pub fn is_pull_request(&self) -> bool {
    self.pull_request.is_some()
  }
}

impl From<ApiIssue> for Issue {
  fn from(issue: ApiIssue) -> Self {
    Issue {
      id: issue.number,
      title: issue.title,
      body: issue.body,
      state: issue.state,
      labels: issue.labels.into_iter().map(|l| l.name).collect(),
      milestone: issue.milestone.map(|m| m.title),
      assignee: issue.assignee.map(|u| u.login),
      author: issue.user.map(|u| u.login),
      comments: issue.comments,
      created_at: issue.created_at,
      updated_at: issue.updated_at,
    }
  }
}

// ============================================================================
// Milestones
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiMilestone {
  pub number: u64,
  pub title: String,
  #[serde(default)]
  pub state: IssueState,
  pub description: Option<String>,
  pub due_on: Option<DateTime<Utc>>,
  #[serde(default)]
  pub open_issues: u32,
  #[serde(default)]
  pub closed_issues: u32,
}

impl From<ApiMilestone> for Milestone {
  fn from(m: ApiMilestone) -> Self {
    Milestone {
      title: m.title,
      number: m.number,
      state: m.state,
      description: m.description,
      due_on: m.due_on,
      open_issues: m.open_issues,
      closed_issues: m.closed_issues,
    }
  }
}

// ============================================================================
// Issue events (activity feed)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiIssueRef {
  pub number: u64,
}

#[derive(Debug, Deserialize)]
pub struct ApiEventLabel {
  pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiIssueEvent {
  pub id: u64,
  pub event: String,
  pub actor: Option<ApiUser>,
  pub issue: Option<ApiIssueRef>,
  pub label: Option<ApiEventLabel>,
  pub created_at: DateTime<Utc>,
}

impl From<ApiIssueEvent> for FeedEvent {
  fn from(e: ApiIssueEvent) -> Self {
    FeedEvent {
      id: e.id,
      event: e.event,
      actor: e.actor.map(|u| u.login),
      issue_id: e.issue.map(|i| i.number),
      label: e.label.map(|l| l.name),
      created_at: e.created_at,
    }
  }
}

// ============================================================================
// Comments
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiComment {
  pub id: u64,
  pub user: Option<ApiUser>,
  #[serde(default)]
  pub body: String,
  pub created_at: DateTime<Utc>,
}

impl From<ApiComment> for Comment {
  fn from(c: ApiComment) -> Self {
    Comment {
      id: c.id,
      author: c.user.map(|u| u.login),
      body: c.body,
      created_at: c.created_at,
    }
  }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SetLabelsBody<'a> {
  pub labels: &'a [String],
}

#[derive(Debug, Serialize)]
pub struct CreateIssueBody<'a> {
  pub title: &'a str,
  pub labels: &'a [String],
}

#[derive(Debug, Serialize)]
pub struct CreateMilestoneBody<'a> {
  pub title: &'a str,
}

#[derive(Debug, Serialize)]
pub struct CreateLabelBody<'a> {
  pub name: &'a str,
  pub color: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<&'a str>,
}

impl<'a> From<&'a Label> for CreateLabelBody<'a> {
  fn from(label: &'a Label) -> Self {
    CreateLabelBody {
      name: &label.name,
      color: &label.color,
      description: label.description.as_deref(),
    }
  }
}

/// Error body returned alongside non-success statuses
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub message: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_issue_conversion() {
    let json = r#"{
      "number": 42,
      "title": "Crash on start",
      "body": null,
      "state": "closed",
      "labels": [{"name": "bug", "color": "ee0701", "description": null}],
      "milestone": {"title": "v1.0"},
      "assignee": null,
      "user": {"id": 1, "login": "octocat", "avatar_url": null},
      "comments": 3,
      "created_at": "2024-03-01T12:00:00Z",
      "updated_at": "2024-03-02T12:00:00Z"
    }"#;

    let api: ApiIssue = serde_json::from_str(json).unwrap();
    assert!(!api.is_pull_request());

    let issue = Issue::from(api);
    assert_eq!(issue.id, 42);
    assert_eq!(issue.state, IssueState::Closed);
    assert_eq!(issue.labels, vec!["bug"]);
    assert_eq!(issue.milestone.as_deref(), Some("v1.0"));
    assert_eq!(issue.author.as_deref(), Some("octocat"));
    assert_eq!(issue.comments, 3);
  }

  #[test]
  fn test_pull_requests_are_flagged() {
    let json = r#"{
      "number": 7,
      "title": "Add feature",
      "state": "open",
      "created_at": "2024-03-01T12:00:00Z",
      "updated_at": "2024-03-01T12:00:00Z",
      "pull_request": {"url": "https://api.github.com/repos/octo/hello/pulls/7"}
    }"#;

    let api: ApiIssue = serde_json::from_str(json).unwrap();
    assert!(api.is_pull_request());
  }

  #[test]
  fn test_event_conversion() {
    let json = r#"{
      "id": 99,
      "event": "labeled",
      "actor": {"id": 1, "login": "octocat"},
      "issue": {"number": 42},
      "label": {"name": "bug", "color": "ee0701"},
      "created_at": "2024-03-01T12:00:00Z"
    }"#;

    let event = FeedEvent::from(serde_json::from_str::<ApiIssueEvent>(json).unwrap());
    assert_eq!(event.issue_id, Some(42));
    assert_eq!(event.label.as_deref(), Some("bug"));
    assert_eq!(event.actor.as_deref(), Some("octocat"));
  }

  #[test]
  fn test_create_label_body_skips_missing_description() {
    let label = Label::new("status.open", "009800");
    let body = serde_json::to_value(CreateLabelBody::from(&label)).unwrap();
    assert_eq!(body, serde_json::json!({"name": "status.open", "color": "009800"}));
  }
}
