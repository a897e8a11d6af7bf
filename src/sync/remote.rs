//! Contracts of the remote collaborators the coordinator drives.

use chrono::{DateTime, Utc};
use std::future::Future;

use crate::error::{FetchError, WriteError};
use crate::model::{FeedEvent, Issue, Label, Milestone, ProjectRef, ResourceKind, User};

/// One conditional fetch of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
  pub project: ProjectRef,
  pub kind: ResourceKind,
  /// Freshness token from the last successful fetch; `None` forces a full transfer
  pub token: Option<String>,
  /// Only return issues updated after this instant
  pub since: Option<DateTime<Utc>>,
}

/// A fetched list, tagged with the kind it belongs to
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  Issues(Vec<Issue>),
  Labels(Vec<Label>),
  Milestones(Vec<Milestone>),
  Collaborators(Vec<User>),
  Feed(Vec<FeedEvent>),
}

impl Payload {
  pub fn kind(&self) -> ResourceKind {
    match self {
      Payload::Issues(_) => ResourceKind::Issues,
      Payload::Labels(_) => ResourceKind::Labels,
      Payload::Milestones(_) => ResourceKind::Milestones,
      Payload::Collaborators(_) => ResourceKind::Collaborators,
      Payload::Feed(_) => ResourceKind::Feed,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      Payload::Issues(v) => v.len(),
      Payload::Labels(v) => v.len(),
      Payload::Milestones(v) => v.len(),
      Payload::Collaborators(v) => v.len(),
      Payload::Feed(v) => v.len(),
    }
  }
}

/// Result of a conditional fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
  /// New data and the token identifying it
  Fresh {
    payload: Payload,
    token: Option<String>,
  },
  /// Unchanged since the token passed in
  NotModified,
  /// Network or remote failure; the cycle fails soft
  Failed(FetchError),
}

/// Source of remote collections (GitHub REST API in production).
pub trait ResourceFetcher: Send + Sync + 'static {
  fn fetch(&self, request: FetchRequest) -> impl Future<Output = FetchOutcome> + Send;
}

/// Remote mutations issued by the core itself.
pub trait RemoteWriter: Send + Sync + 'static {
  /// Replace the label set of an issue.
  fn set_labels(
    &self,
    project: &ProjectRef,
    issue_id: u64,
    labels: &[String],
  ) -> impl Future<Output = Result<(), WriteError>> + Send;

  /// Create a label, returning it as stored remotely.
  fn create_label(
    &self,
    project: &ProjectRef,
    label: &Label,
  ) -> impl Future<Output = Result<Label, WriteError>> + Send;
}
