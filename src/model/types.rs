use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Report};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::entity::{Entity, ResourceKind};

/// Delimiter for labels in an exclusive group (`priority.high`)
pub const EXCLUSIVE_DELIMITER: char = '.';
/// Delimiter for labels in a non-exclusive group (`area-ui`)
pub const NON_EXCLUSIVE_DELIMITER: char = '-';

/// Repository a project session mirrors, written `owner/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectRef {
  pub owner: String,
  pub name: String,
}

impl ProjectRef {
  pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      owner: owner.into(),
      name: name.into(),
    }
  }
}

impl fmt::Display for ProjectRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.owner, self.name)
  }
}

impl FromStr for ProjectRef {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().split_once('/') {
      Some((owner, name))
        if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
      {
        Ok(Self::new(owner, name))
      }
      _ => Err(eyre!("Invalid project '{}', expected OWNER/REPO", s)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
  #[default]
  Open,
  Closed,
}

/// Issue (or pull request) as mirrored locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
  /// Issue number within the repository
  pub id: u64,
  pub title: String,
  pub body: Option<String>,
  pub state: IssueState,
  /// Label names, in remote order
  pub labels: Vec<String>,
  /// Milestone title
  pub milestone: Option<String>,
  pub assignee: Option<String>,
  pub author: Option<String>,
  pub comments: u32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Issue {
  pub fn has_label(&self, name: &str) -> bool {
    self.labels.iter().any(|l| l.eq_ignore_ascii_case(name))
  }
}

impl Entity for Issue {
  type Key = u64;
  const KIND: ResourceKind = ResourceKind::Issues;

  fn key(&self) -> u64 {
    self.id
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
  pub name: String,
  /// Hex color without the leading `#`
  pub color: String,
  pub description: Option<String>,
}

impl Label {
  pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      color: color.into(),
      description: None,
    }
  }

  /// Group prefix, if the name contains a group delimiter
  pub fn group(&self) -> Option<&str> {
    self
      .name
      .find([EXCLUSIVE_DELIMITER, NON_EXCLUSIVE_DELIMITER])
      .filter(|&i| i > 0)
      .map(|i| &self.name[..i])
  }

  /// Exclusive labels use `.` as group delimiter; an issue carries at most one per group.
  pub fn is_exclusive(&self) -> bool {
    self
      .name
      .find([EXCLUSIVE_DELIMITER, NON_EXCLUSIVE_DELIMITER])
      .filter(|&i| i > 0)
      .map(|i| self.name[i..].starts_with(EXCLUSIVE_DELIMITER))
      .unwrap_or(false)
  }
}

impl Entity for Label {
  type Key = String;
  const KIND: ResourceKind = ResourceKind::Labels;

  fn key(&self) -> String {
    self.name.clone()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
  pub title: String,
  pub number: u64,
  pub state: IssueState,
  pub description: Option<String>,
  pub due_on: Option<DateTime<Utc>>,
  pub open_issues: u32,
  pub closed_issues: u32,
}

impl Entity for Milestone {
  type Key = String;
  const KIND: ResourceKind = ResourceKind::Milestones;

  fn key(&self) -> String {
    self.title.clone()
  }
}

/// Repository collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: u64,
  pub login: String,
  pub name: Option<String>,
  pub avatar_url: Option<String>,
}

impl Entity for User {
  type Key = u64;
  const KIND: ResourceKind = ResourceKind::Collaborators;

  fn key(&self) -> u64 {
    self.id
  }
}

/// Entry of the repository's issue activity feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEvent {
  pub id: u64,
  /// Event name as reported remotely (`closed`, `labeled`, ...)
  pub event: String,
  pub actor: Option<String>,
  pub issue_id: Option<u64>,
  pub label: Option<String>,
  pub created_at: DateTime<Utc>,
}

impl Entity for FeedEvent {
  type Key = u64;
  const KIND: ResourceKind = ResourceKind::Feed;

  fn key(&self) -> u64 {
    self.id
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
  pub id: u64,
  pub author: Option<String>,
  pub body: String,
  pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_project_ref_parse() {
    let p: ProjectRef = "octo/hello".parse().unwrap();
    assert_eq!(p, ProjectRef::new("octo", "hello"));
    assert_eq!(p.to_string(), "octo/hello");
  }

  #[test]
  fn test_project_ref_rejects_malformed() {
    assert!("octo".parse::<ProjectRef>().is_err());
    assert!("/hello".parse::<ProjectRef>().is_err());
    assert!("octo/".parse::<ProjectRef>().is_err());
    assert!("a/b/c".parse::<ProjectRef>().is_err());
  }

  #[test]
  fn test_label_groups() {
    let exclusive = Label::new("priority.high", "ff0000");
    assert_eq!(exclusive.group(), Some("priority"));
    assert!(exclusive.is_exclusive());

    let open = Label::new("area-ui", "00ff00");
    assert_eq!(open.group(), Some("area"));
    assert!(!open.is_exclusive());

    let plain = Label::new("bug", "ee0701");
    assert_eq!(plain.group(), None);
    assert!(!plain.is_exclusive());
  }

  #[test]
  fn test_leading_delimiter_is_not_a_group() {
    let label = Label::new(".hidden", "000000");
    assert_eq!(label.group(), None);
    assert!(!label.is_exclusive());
  }
}
