//! Fixtures and in-memory collaborators for sync tests.

use chrono::{TimeZone, Utc};
use color_eyre::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::remote::{FetchOutcome, FetchRequest, Payload, RemoteWriter, ResourceFetcher};
use crate::cache::{PersistenceGateway, Snapshot};
use crate::error::WriteError;
use crate::model::{Issue, IssueState, Label, ProjectRef, ResourceKind, User};

pub fn issue(id: u64, state: IssueState, labels: &[&str]) -> Issue {
  let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
  Issue {
    id,
    title: format!("Issue {}", id),
    body: None,
    state,
    labels: labels.iter().map(|l| l.to_string()).collect(),
    milestone: None,
    assignee: None,
    author: Some("octocat".to_string()),
    comments: 0,
    created_at: at,
    updated_at: at,
  }
}

pub fn user(id: u64, login: &str) -> User {
  User {
    id,
    login: login.to_string(),
    name: None,
    avatar_url: None,
  }
}

pub fn fresh(payload: Payload, token: &str) -> FetchOutcome {
  FetchOutcome::Fresh {
    payload,
    token: Some(token.to_string()),
  }
}

/// Fetcher answering from per-kind scripts; unscripted kinds answer `NotModified`.
#[derive(Default)]
pub struct ScriptedFetcher {
  scripts: Mutex<HashMap<ResourceKind, VecDeque<FetchOutcome>>>,
  requests: Mutex<Vec<FetchRequest>>,
  delay: Mutex<Option<Duration>>,
}

impl ScriptedFetcher {
  pub fn script(&self, kind: ResourceKind, outcome: FetchOutcome) {
    self
      .scripts
      .lock()
      .unwrap()
      .entry(kind)
      .or_default()
      .push_back(outcome);
  }

  /// Make every later fetch take `delay` before answering.
  pub fn stall(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn requests(&self) -> Vec<FetchRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl ResourceFetcher for ScriptedFetcher {
  async fn fetch(&self, request: FetchRequest) -> FetchOutcome {
    let kind = request.kind;
    self.requests.lock().unwrap().push(request);
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    self
      .scripts
      .lock()
      .unwrap()
      .get_mut(&kind)
      .and_then(VecDeque::pop_front)
      .unwrap_or(FetchOutcome::NotModified)
  }
}

/// Writer that records every attempt and fails on demand.
#[derive(Default)]
pub struct RecordingWriter {
  failures: Mutex<VecDeque<WriteError>>,
  label_writes: Mutex<Vec<(u64, Vec<String>)>>,
  created_labels: Mutex<Vec<Label>>,
}

impl RecordingWriter {
  /// Make the next write attempt fail with `error`.
  pub fn fail_next(&self, error: WriteError) {
    self.failures.lock().unwrap().push_back(error);
  }

  pub fn label_writes(&self) -> Vec<(u64, Vec<String>)> {
    self.label_writes.lock().unwrap().clone()
  }

  pub fn created_labels(&self) -> Vec<Label> {
    self.created_labels.lock().unwrap().clone()
  }

  fn next_failure(&self) -> Option<WriteError> {
    self.failures.lock().unwrap().pop_front()
  }
}

impl RemoteWriter for RecordingWriter {
  async fn set_labels(
    &self,
    _project: &ProjectRef,
    issue_id: u64,
    labels: &[String],
  ) -> Result<(), WriteError> {
    self
      .label_writes
      .lock()
      .unwrap()
      .push((issue_id, labels.to_vec()));
    match self.next_failure() {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  async fn create_label(&self, _project: &ProjectRef, label: &Label) -> Result<Label, WriteError> {
    self.created_labels.lock().unwrap().push(label.clone());
    match self.next_failure() {
      Some(e) => Err(e),
      None => Ok(label.clone()),
    }
  }
}

/// Persistence gateway keeping every written snapshot in memory.
#[derive(Clone, Default)]
pub struct RecordingGateway {
  writes: Arc<Mutex<Vec<(ProjectRef, Snapshot)>>>,
  cached: Arc<Mutex<Option<Snapshot>>>,
}

impl RecordingGateway {
  pub fn with_cached(snapshot: Snapshot) -> Self {
    let gateway = Self::default();
    *gateway.cached.lock().unwrap() = Some(snapshot);
    gateway
  }

  pub fn writes(&self) -> Vec<(ProjectRef, Snapshot)> {
    self.writes.lock().unwrap().clone()
  }

  pub fn last_write(&self) -> Option<Snapshot> {
    self.writes.lock().unwrap().last().map(|(_, s)| s.clone())
  }
}

impl PersistenceGateway for RecordingGateway {
  fn write(&self, project: &ProjectRef, snapshot: &Snapshot) -> Result<()> {
    self
      .writes
      .lock()
      .unwrap()
      .push((project.clone(), snapshot.clone()));
    Ok(())
  }

  fn read_cached(&self, _project: &ProjectRef) -> Result<Option<Snapshot>> {
    Ok(self.cached.lock().unwrap().clone())
  }
}
