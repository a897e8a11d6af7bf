//! Sync cycles for the active project.
//!
//! A cycle fetches on a worker task and posts the result back as a
//! [`SyncMessage`]. The owning loop hands it to [`SyncCoordinator::handle`],
//! which validates, reconciles, persists and notifies in one go, so store
//! mutations never interleave with other work on that loop.
//!
//! ```text
//! Idle -> Fetching -> Validating -> Reconciling -> Persisting -> Idle
//!                        \-> Failed -> Idle
//! ```

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::consistency::{
  ensure_status_labels, push_corrections, repair, CorrectionReport, CorrectiveWrite,
};
use super::policy::StatusLabelPolicy;
use super::reconcile::{reconcile, ReconcileMode};
use super::remote::{FetchOutcome, FetchRequest, Payload, RemoteWriter, ResourceFetcher};
use super::store::{Change, ResourceStore, Stored};
use crate::cache::{PersistenceGateway, Snapshot};
use crate::error::FetchError;
use crate::model::{Issue, Label, Milestone, ProjectRef, ResourceKind};

/// Where a cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
  Idle,
  Fetching,
  Validating,
  Reconciling,
  Persisting,
  Failed,
}

impl SyncPhase {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncPhase::Idle => "idle",
      SyncPhase::Fetching => "fetching",
      SyncPhase::Validating => "validating",
      SyncPhase::Reconciling => "reconciling",
      SyncPhase::Persisting => "persisting",
      SyncPhase::Failed => "failed",
    }
  }
}

/// Input of a load, tagged by whoever produced it
#[derive(Debug, Clone, PartialEq)]
pub enum LoadSource {
  /// Collections read back from the local cache
  WarmStart(Snapshot),
  /// Results of a remote fetch
  Remote(RemoteSnapshot),
}

/// Per-kind fetch results of one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
  /// When the fetch was issued; becomes the issues' last-checked time
  pub started_at: DateTime<Utc>,
  /// `Some` when issues were asked for as a delta
  pub issues_since: Option<DateTime<Utc>>,
  pub outcomes: Vec<(ResourceKind, FetchOutcome)>,
}

impl RemoteSnapshot {
  fn first_failure(&self) -> Option<(ResourceKind, &FetchError)> {
    self.outcomes.iter().find_map(|(kind, outcome)| match outcome {
      FetchOutcome::Failed(e) => Some((*kind, e)),
      _ => None,
    })
  }

  fn all_not_modified(&self) -> bool {
    self
      .outcomes
      .iter()
      .all(|(_, outcome)| matches!(outcome, FetchOutcome::NotModified))
  }
}

/// Messages posted from worker tasks back to the owning loop
#[derive(Debug)]
pub enum SyncMessage {
  Loaded {
    project: ProjectRef,
    source: LoadSource,
  },
  Corrected {
    project: ProjectRef,
    report: CorrectionReport,
  },
}

/// User-visible warning raised by a failed cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
  pub title: &'static str,
  pub message: String,
}

impl From<&FetchError> for Notice {
  fn from(error: &FetchError) -> Self {
    let (title, message) = error.user_message();
    Self { title, message }
  }
}

/// Incremental queries reach this far behind the last check, covering clock skew
/// with the remote. Re-applying an unchanged issue is a no-op.
const SINCE_OVERLAP_SECS: i64 = 300;

/// Tunables of a coordinator
#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub policy: StatusLabelPolicy,
  /// Upper bound for the fetch step of a cycle
  pub fetch_timeout: Duration,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      policy: StatusLabelPolicy::default(),
      fetch_timeout: Duration::from_secs(30),
    }
  }
}

/// Orchestrates loads and refreshes of one project session.
///
/// Owns the store; lives on the loop that receives [`SyncMessage`]s.
pub struct SyncCoordinator<F, W> {
  project: ProjectRef,
  store: ResourceStore,
  fetcher: Arc<F>,
  writer: Arc<W>,
  gateway: Box<dyn PersistenceGateway>,
  policy: Arc<StatusLabelPolicy>,
  fetch_timeout: Duration,
  tx: mpsc::UnboundedSender<SyncMessage>,
  phase: SyncPhase,
  in_flight: Option<JoinHandle<()>>,
  last_error: Option<FetchError>,
  notices: Vec<Notice>,
}

impl<F: ResourceFetcher, W: RemoteWriter> SyncCoordinator<F, W> {
  pub fn new(
    project: ProjectRef,
    store: ResourceStore,
    fetcher: Arc<F>,
    writer: Arc<W>,
    gateway: Box<dyn PersistenceGateway>,
    settings: SyncSettings,
    tx: mpsc::UnboundedSender<SyncMessage>,
  ) -> Self {
    Self {
      project,
      store,
      fetcher,
      writer,
      gateway,
      policy: Arc::new(settings.policy),
      fetch_timeout: settings.fetch_timeout,
      tx,
      phase: SyncPhase::Idle,
      in_flight: None,
      last_error: None,
      notices: Vec::new(),
    }
  }

  pub fn project(&self) -> &ProjectRef {
    &self.project
  }

  pub fn store(&self) -> &ResourceStore {
    &self.store
  }

  /// Mutable access for subscribing and for local lookups that cache data.
  pub fn store_mut(&mut self) -> &mut ResourceStore {
    &mut self.store
  }

  pub fn policy(&self) -> &StatusLabelPolicy {
    &self.policy
  }

  pub fn phase(&self) -> SyncPhase {
    self.phase
  }

  pub fn last_error(&self) -> Option<&FetchError> {
    self.last_error.as_ref()
  }

  /// Whether a cycle is between Fetching and its completion
  pub fn is_busy(&self) -> bool {
    self.phase != SyncPhase::Idle
  }

  /// Drain the warnings raised since the last call.
  pub fn take_notices(&mut self) -> Vec<Notice> {
    std::mem::take(&mut self.notices)
  }

  // ==========================================================================
  // Cycle entry points
  // ==========================================================================

  /// Warm-start from the local cache, then fetch every kind from the remote.
  ///
  /// Returns false when a cycle was already in flight.
  pub fn load_all(&mut self) -> bool {
    if self.is_busy() {
      debug!(project = %self.project, "Load requested while a cycle is in flight, skipping");
      return false;
    }

    self.store.clear_comments();
    match self.gateway.read_cached(&self.project) {
      Ok(Some(snapshot)) => {
        info!(project = %self.project, issues = snapshot.issues.len(), "Warm start from cache");
        self.apply_load(LoadSource::WarmStart(snapshot));
      }
      Ok(None) => debug!(project = %self.project, "No cached snapshot"),
      Err(e) => warn!(project = %self.project, "Failed to read cached snapshot: {}", e),
    }

    self.start_cycle(true, false)
  }

  /// Conditional poll of the durable kinds, asking for an issue delta when possible.
  pub fn refresh_incremental(&mut self) -> bool {
    if self.is_busy() {
      debug!(project = %self.project, "Refresh requested while a cycle is in flight, skipping");
      return false;
    }
    self.start_cycle(false, false)
  }

  /// Unconditional fetch of every kind, ignoring stored freshness tokens.
  pub fn force_reload(&mut self) -> bool {
    if self.is_busy() {
      debug!(project = %self.project, "Reload requested while a cycle is in flight, skipping");
      return false;
    }
    self.start_cycle(true, true)
  }

  fn start_cycle(&mut self, full: bool, ignore_tokens: bool) -> bool {
    let started_at = Utc::now();
    let kinds: Vec<ResourceKind> = ResourceKind::ALL
      .into_iter()
      .filter(|kind| full || kind.is_conditional())
      .collect();

    let issues_since = if full {
      None
    } else {
      self
        .store
        .cache_meta(ResourceKind::Issues)
        .last_checked
        .map(|at| at - chrono::Duration::seconds(SINCE_OVERLAP_SECS))
    };

    let requests: Vec<FetchRequest> = kinds
      .iter()
      .map(|&kind| FetchRequest {
        project: self.project.clone(),
        kind,
        token: if ignore_tokens || !kind.is_conditional() {
          None
        } else {
          self.store.cache_meta(kind).token
        },
        since: if kind == ResourceKind::Issues {
          issues_since
        } else {
          None
        },
      })
      .collect();

    info!(
      project = %self.project,
      full,
      kinds = requests.len(),
      since = ?issues_since,
      "Starting sync cycle"
    );
    self.set_phase(SyncPhase::Fetching);

    let fetcher = self.fetcher.clone();
    let writer = self.writer.clone();
    let policy = self.policy.clone();
    let project = self.project.clone();
    let timeout = self.fetch_timeout;
    let tx = self.tx.clone();

    self.in_flight = Some(tokio::spawn(async move {
      let work = {
        let project = project.clone();
        async move {
          let mut outcomes = fetch_all(fetcher.as_ref(), requests, timeout).await;
          prepare_labels(writer.as_ref(), &project, &policy, &mut outcomes).await;
          outcomes
        }
      };

      // A panicking worker still posts a failed result
      let outcomes = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(outcomes) => outcomes,
        Err(panic) => {
          let reason = panic_message(&*panic);
          error!(project = %project, "Sync worker panicked: {}", reason);
          kinds
            .into_iter()
            .map(|kind| (kind, FetchOutcome::Failed(FetchError::Interrupted(reason.clone()))))
            .collect()
        }
      };

      let source = LoadSource::Remote(RemoteSnapshot {
        started_at,
        issues_since,
        outcomes,
      });
      let _ = tx.send(SyncMessage::Loaded { project, source });
    }));

    true
  }

  // ==========================================================================
  // Message handling (owning loop)
  // ==========================================================================

  /// Apply a message posted by a worker task.
  pub fn handle(&mut self, message: SyncMessage) {
    match message {
      SyncMessage::Loaded { project, source } => {
        if project != self.project {
          debug!(project = %project, active = %self.project, "Ignoring load for inactive project");
          return;
        }
        self.in_flight = None;
        self.apply_load(source);
      }
      SyncMessage::Corrected { project, report } => {
        info!(
          project = %project,
          attempted = report.attempted,
          applied = report.applied,
          failed = report.failed,
          denied = report.denied,
          "Corrective writes finished"
        );
      }
    }
  }

  /// Run a load through validation, reconciliation and persistence.
  pub fn apply_load(&mut self, source: LoadSource) {
    match source {
      LoadSource::WarmStart(snapshot) => self.apply_warm_start(snapshot),
      LoadSource::Remote(snapshot) => self.apply_remote(snapshot),
    }
  }

  fn apply_warm_start(&mut self, snapshot: Snapshot) {
    let Snapshot {
      meta,
      issues,
      labels,
      milestones,
      collaborators,
    } = snapshot;

    self.store.replace_all(issues);
    self.store.replace_all(labels);
    self.store.replace_all(milestones);
    self.store.replace_all(collaborators);
    self.store.restore_metadata(meta);
  }

  fn apply_remote(&mut self, snapshot: RemoteSnapshot) {
    self.set_phase(SyncPhase::Validating);

    if let Some((kind, e)) = snapshot.first_failure() {
      let e = e.clone();
      if e.is_network() {
        warn!(project = %self.project, kind = %kind, "Sync cycle failed: {}", e);
      } else {
        error!(project = %self.project, kind = %kind, "Sync cycle failed: {}", e);
      }
      self.set_phase(SyncPhase::Failed);
      self.notices.push(Notice::from(&e));
      self.last_error = Some(e);
      self.set_phase(SyncPhase::Idle);
      return;
    }
    self.last_error = None;

    if snapshot.all_not_modified() {
      debug!(project = %self.project, "Nothing modified");
      self.set_phase(SyncPhase::Idle);
      return;
    }

    let RemoteSnapshot {
      started_at,
      issues_since,
      mut outcomes,
    } = snapshot;

    let mut corrections = Vec::new();
    for (_, outcome) in outcomes.iter_mut() {
      if let FetchOutcome::Fresh {
        payload: Payload::Issues(issues),
        ..
      } = outcome
      {
        corrections = repair(issues, &self.policy);
      }
    }

    self.set_phase(SyncPhase::Reconciling);
    let issue_mode = if issues_since.is_some() {
      ReconcileMode::Upsert
    } else {
      ReconcileMode::Mirror
    };

    let mut durable_changed = false;
    for (_, outcome) in outcomes {
      let FetchOutcome::Fresh { payload, token } = outcome else {
        continue;
      };
      let kind = payload.kind();
      debug!(project = %self.project, kind = %kind, count = payload.len(), "Applying fresh list");

      match payload {
        Payload::Issues(issues) => {
          self.reconcile_into(issues, issue_mode);
          self.store.update_last_checked(kind, started_at);
        }
        Payload::Labels(labels) => {
          self.reconcile_into(labels, ReconcileMode::Mirror);
        }
        Payload::Milestones(milestones) => {
          self.reconcile_into(milestones, ReconcileMode::Mirror);
        }
        Payload::Collaborators(users) => {
          self.reconcile_into(users, ReconcileMode::Mirror);
        }
        Payload::Feed(events) => {
          // Only a non-empty feed replaces the one on screen
          if !events.is_empty() {
            self.store.replace_all(events);
          }
          continue;
        }
      }

      self.store.update_cache_meta(kind, token);
      durable_changed = true;
    }

    if durable_changed {
      self.persist();
    }
    self.set_phase(SyncPhase::Idle);

    self.spawn_corrections(corrections);
  }

  fn reconcile_into<E: Stored>(&mut self, incoming: Vec<E>, mode: ReconcileMode) -> Change {
    let changes = reconcile(E::collection(&self.store).items(), incoming, mode);
    if !changes.is_empty() {
      debug!(kind = %E::KIND, pending = changes.len(), "Reconciled");
    }
    self.store.apply_change_set(changes)
  }

  fn spawn_corrections(&self, corrections: Vec<CorrectiveWrite>) {
    if corrections.is_empty() {
      return;
    }

    let writer = self.writer.clone();
    let project = self.project.clone();
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let report = push_corrections(writer.as_ref(), &project, corrections).await;
      let _ = tx.send(SyncMessage::Corrected { project, report });
    });
  }

  // ==========================================================================
  // Local fast paths
  // ==========================================================================

  /// Put a just-created issue at the front without a reconciliation pass.
  pub fn append_new(&mut self, issue: Issue) {
    self.store.insert_front(issue);
    self.persist();
  }

  /// Record a label created outside a sync cycle.
  pub fn add_label(&mut self, label: Label) {
    self.store.push(label);
    self.persist();
  }

  pub fn delete_label(&mut self, name: &str) {
    if !self.store.remove::<Label>(&name.to_string()).is_empty() {
      self.persist();
    }
  }

  /// Record a milestone created outside a sync cycle.
  pub fn add_milestone(&mut self, milestone: Milestone) {
    self.store.push(milestone);
    self.persist();
  }

  pub fn delete_milestone(&mut self, title: &str) {
    if !self.store.remove::<Milestone>(&title.to_string()).is_empty() {
      self.persist();
    }
  }

  /// Re-deliver change notifications for every collection.
  pub fn refresh(&mut self) {
    self.store.renotify_all();
  }

  /// Tear the session down: cancel the in-flight fetch and drop subscribers.
  pub fn shutdown(&mut self) {
    if let Some(handle) = self.in_flight.take() {
      handle.abort();
      debug!(project = %self.project, "Aborted in-flight fetch");
    }
    self.store.unsubscribe_all();
    self.set_phase(SyncPhase::Idle);
  }

  fn persist(&mut self) {
    let previous = self.phase;
    self.set_phase(SyncPhase::Persisting);
    if let Err(e) = self.gateway.write(&self.project, &self.store.snapshot()) {
      error!(project = %self.project, "Failed to persist snapshot: {}", e);
    }
    self.set_phase(previous);
  }

  fn set_phase(&mut self, phase: SyncPhase) {
    if self.phase != phase {
      debug!(project = %self.project, from = self.phase.as_str(), to = phase.as_str(), "Sync phase");
      self.phase = phase;
    }
  }
}

impl<F, W> Drop for SyncCoordinator<F, W> {
  fn drop(&mut self) {
    if let Some(handle) = self.in_flight.take() {
      handle.abort();
    }
  }
}

// ============================================================================
// Worker side
// ============================================================================

/// Fetch every requested kind concurrently, bounded by `timeout`.
async fn fetch_all<F: ResourceFetcher>(
  fetcher: &F,
  requests: Vec<FetchRequest>,
  timeout: Duration,
) -> Vec<(ResourceKind, FetchOutcome)> {
  let kinds: Vec<ResourceKind> = requests.iter().map(|r| r.kind).collect();
  let fetches = join_all(requests.into_iter().map(|r| fetcher.fetch(r)));

  match tokio::time::timeout(timeout, fetches).await {
    Ok(outcomes) => kinds.into_iter().zip(outcomes).collect(),
    Err(_) => {
      warn!(?timeout, "Fetch timed out");
      kinds
        .into_iter()
        .map(|kind| (kind, FetchOutcome::Failed(FetchError::Timeout(timeout))))
        .collect()
    }
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

/// Create missing status labels and add them to a freshly fetched label list.
async fn prepare_labels<W: RemoteWriter>(
  writer: &W,
  project: &ProjectRef,
  policy: &StatusLabelPolicy,
  outcomes: &mut [(ResourceKind, FetchOutcome)],
) {
  for (_, outcome) in outcomes.iter_mut() {
    if let FetchOutcome::Fresh {
      payload: Payload::Labels(labels),
      ..
    } = outcome
    {
      let created = ensure_status_labels(writer, project, labels, policy).await;
      if created > 0 {
        info!(project = %project, created, "Created missing status labels");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::WriteError;
  use crate::model::{FeedEvent, IssueState, User};
  use crate::sync::testing::{
    fresh, issue, user, RecordingGateway, RecordingWriter, ScriptedFetcher,
  };
  use std::cell::Cell;
  use std::rc::Rc;

  type TestCoordinator = SyncCoordinator<ScriptedFetcher, RecordingWriter>;

  struct Harness {
    coordinator: TestCoordinator,
    fetcher: Arc<ScriptedFetcher>,
    writer: Arc<RecordingWriter>,
    gateway: RecordingGateway,
    rx: mpsc::UnboundedReceiver<SyncMessage>,
  }

  impl Harness {
    fn new(gateway: RecordingGateway) -> Self {
      let (tx, rx) = mpsc::unbounded_channel();
      let fetcher = Arc::new(ScriptedFetcher::default());
      let writer = Arc::new(RecordingWriter::default());
      let coordinator = SyncCoordinator::new(
        project(),
        ResourceStore::new(),
        fetcher.clone(),
        writer.clone(),
        Box::new(gateway.clone()),
        SyncSettings::default(),
        tx,
      );
      Self {
        coordinator,
        fetcher,
        writer,
        gateway,
        rx,
      }
    }

    /// Deliver the next posted message to the coordinator.
    async fn settle(&mut self) {
      let message = self.rx.recv().await.unwrap();
      self.coordinator.handle(message);
    }

    fn issue_ids(&self) -> Vec<u64> {
      self
        .coordinator
        .store()
        .issues()
        .values()
        .iter()
        .map(|i| i.id)
        .collect()
    }
  }

  fn project() -> ProjectRef {
    ProjectRef::new("octo", "hello")
  }

  fn feed_event(id: u64) -> FeedEvent {
    FeedEvent {
      id,
      event: "labeled".to_string(),
      actor: Some("octocat".to_string()),
      issue_id: Some(1),
      label: Some("bug".to_string()),
      created_at: "2024-03-01T12:00:00Z".parse().unwrap(),
    }
  }

  /// Seed the store through a first full load.
  async fn seeded() -> Harness {
    let mut h = Harness::new(RecordingGateway::default());
    h.fetcher.script(
      ResourceKind::Issues,
      fresh(
        Payload::Issues(vec![
          issue(3, IssueState::Open, &[]),
          issue(2, IssueState::Open, &["bug"]),
          issue(1, IssueState::Closed, &[]),
        ]),
        "i1",
      ),
    );
    h.fetcher.script(
      ResourceKind::Labels,
      fresh(
        Payload::Labels(vec![
          Label::new("status.open", "009800"),
          Label::new("status.closed", "0052cc"),
          Label::new("bug", "ee0701"),
        ]),
        "l1",
      ),
    );
    h.fetcher.script(
      ResourceKind::Collaborators,
      fresh(Payload::Collaborators(vec![user(1, "x")]), "c1"),
    );
    assert!(h.coordinator.load_all());
    h.settle().await;
    h
  }

  #[tokio::test]
  async fn test_full_load_populates_store_and_persists() {
    let h = seeded().await;

    assert_eq!(h.coordinator.phase(), SyncPhase::Idle);
    assert_eq!(h.issue_ids(), vec![3, 2, 1]);
    assert_eq!(h.coordinator.store().labels().len(), 3);
    assert_eq!(
      h.coordinator.store().cache_meta(ResourceKind::Issues).token,
      Some("i1".to_string())
    );
    assert!(h
      .coordinator
      .store()
      .cache_meta(ResourceKind::Issues)
      .last_checked
      .is_some());

    let written = h.gateway.last_write().unwrap();
    assert_eq!(written.issues.len(), 3);
    assert_eq!(written.meta.get(ResourceKind::Labels).token, Some("l1".into()));
    assert!(h.writer.created_labels().is_empty());
  }

  #[tokio::test]
  async fn test_not_modified_means_no_mutation_and_no_write() {
    let mut h = seeded().await;
    let writes_before = h.gateway.writes().len();
    let changes = Rc::new(Cell::new(0));
    let c = changes.clone();
    h.coordinator
      .store_mut()
      .on_any_change(move |_| c.set(c.get() + 1));

    assert!(h.coordinator.refresh_incremental());
    h.settle().await;

    assert_eq!(changes.get(), 0);
    assert_eq!(h.gateway.writes().len(), writes_before);
    assert_eq!(h.coordinator.phase(), SyncPhase::Idle);
  }

  #[tokio::test]
  async fn test_incremental_passes_tokens_and_since() {
    let mut h = seeded().await;
    let last_checked = h
      .coordinator
      .store()
      .cache_meta(ResourceKind::Issues)
      .last_checked;

    h.coordinator.refresh_incremental();
    h.settle().await;

    let requests = h.fetcher.requests();
    let polled: Vec<&FetchRequest> = requests.iter().skip(ResourceKind::ALL.len()).collect();
    assert_eq!(polled.len(), 4);
    assert!(polled.iter().all(|r| r.kind != ResourceKind::Feed));

    let issues = polled
      .iter()
      .find(|r| r.kind == ResourceKind::Issues)
      .unwrap();
    assert_eq!(issues.token, Some("i1".to_string()));
    let overlap = chrono::Duration::seconds(SINCE_OVERLAP_SECS);
    assert_eq!(issues.since, last_checked.map(|at| at - overlap));
    assert!(issues.since.unwrap() < last_checked.unwrap());
  }

  #[tokio::test]
  async fn test_incremental_delta_upserts_without_removal() {
    let mut h = seeded().await;
    let before = h.coordinator.store().issue(2).unwrap();

    let mut changed = issue(2, IssueState::Open, &["bug", "ui"]);
    changed.title = "Renamed".to_string();
    h.fetcher.script(
      ResourceKind::Issues,
      fresh(
        Payload::Issues(vec![issue(4, IssueState::Open, &[]), changed]),
        "i2",
      ),
    );
    h.coordinator.refresh_incremental();
    h.settle().await;

    assert_eq!(h.issue_ids(), vec![4, 3, 2, 1]);
    let after = h.coordinator.store().issue(2).unwrap();
    assert!(Rc::ptr_eq(&before, &after));
    assert_eq!(after.borrow().title, "Renamed");
    assert_eq!(
      h.gateway.last_write().unwrap().meta.get(ResourceKind::Issues).token,
      Some("i2".to_string())
    );
  }

  #[tokio::test]
  async fn test_fetch_failure_leaves_store_untouched() {
    let mut h = seeded().await;
    let writes_before = h.gateway.writes().len();

    h.fetcher.script(
      ResourceKind::Labels,
      fresh(Payload::Labels(Vec::new()), "l2"),
    );
    h.fetcher.script(
      ResourceKind::Issues,
      FetchOutcome::Failed(FetchError::NetworkUnavailable("dns".into())),
    );
    h.coordinator.refresh_incremental();
    h.settle().await;

    assert_eq!(h.coordinator.phase(), SyncPhase::Idle);
    assert_eq!(h.coordinator.store().labels().len(), 3);
    assert_eq!(h.gateway.writes().len(), writes_before);
    assert!(h.coordinator.last_error().unwrap().is_network());

    let notices = h.coordinator.take_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].title, "No Internet Connection");
    assert!(h.coordinator.take_notices().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_timeout_fails_the_cycle() {
    let mut h = seeded().await;
    let writes_before = h.gateway.writes().len();
    let changes = Rc::new(Cell::new(0));
    let c = changes.clone();
    h.coordinator
      .store_mut()
      .on_any_change(move |_| c.set(c.get() + 1));

    h.fetcher.stall(Duration::from_secs(120));
    h.fetcher.script(
      ResourceKind::Issues,
      fresh(Payload::Issues(Vec::new()), "i2"),
    );
    assert!(h.coordinator.refresh_incremental());
    h.settle().await;

    assert_eq!(h.coordinator.phase(), SyncPhase::Idle);
    assert_eq!(changes.get(), 0);
    assert_eq!(h.issue_ids(), vec![3, 2, 1]);
    assert_eq!(h.gateway.writes().len(), writes_before);
    assert_eq!(
      h.coordinator.last_error(),
      Some(&FetchError::Timeout(SyncSettings::default().fetch_timeout))
    );

    let notices = h.coordinator.take_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].title, "Internet Connection is down");

    // The next poll is accepted
    assert!(h.coordinator.refresh_incremental());
  }

  struct PanickingFetcher;

  impl ResourceFetcher for PanickingFetcher {
    async fn fetch(&self, request: FetchRequest) -> FetchOutcome {
      panic!("cannot fetch {}", request.kind)
    }
  }

  #[tokio::test]
  async fn test_worker_panic_returns_to_idle() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let gateway = RecordingGateway::default();
    let mut coordinator = SyncCoordinator::new(
      project(),
      ResourceStore::new(),
      Arc::new(PanickingFetcher),
      Arc::new(RecordingWriter::default()),
      Box::new(gateway.clone()),
      SyncSettings::default(),
      tx,
    );

    assert!(coordinator.refresh_incremental());
    let message = rx.recv().await.unwrap();
    coordinator.handle(message);

    assert_eq!(coordinator.phase(), SyncPhase::Idle);
    assert!(matches!(
      coordinator.last_error(),
      Some(FetchError::Interrupted(reason)) if reason.starts_with("cannot fetch")
    ));
    assert_eq!(coordinator.take_notices()[0].title, "Sync interrupted");
    assert!(gateway.writes().is_empty());

    assert!(coordinator.refresh_incremental());
  }

  #[tokio::test]
  async fn test_requests_while_in_flight_are_coalesced() {
    let mut h = Harness::new(RecordingGateway::default());

    assert!(h.coordinator.refresh_incremental());
    assert_eq!(h.coordinator.phase(), SyncPhase::Fetching);
    assert!(!h.coordinator.refresh_incremental());
    assert!(!h.coordinator.load_all());
    assert!(!h.coordinator.force_reload());

    h.settle().await;
    assert_eq!(h.fetcher.requests().len(), 4);
    assert!(h.coordinator.refresh_incremental());
  }

  #[tokio::test]
  async fn test_repair_applies_locally_and_pushes_corrections() {
    let mut h = seeded().await;
    h.fetcher.script(
      ResourceKind::Issues,
      fresh(
        Payload::Issues(vec![
          issue(3, IssueState::Closed, &["status.open", "bug"]),
          issue(2, IssueState::Open, &["bug"]),
          issue(1, IssueState::Closed, &[]),
        ]),
        "i2",
      ),
    );
    h.coordinator.force_reload();
    h.settle().await;

    let repaired = h.coordinator.store().issue(3).unwrap();
    assert_eq!(repaired.borrow().labels, vec!["bug"]);
    assert_eq!(repaired.borrow().state, IssueState::Closed);

    // Corrective writes report back on their own
    h.settle().await;
    assert_eq!(h.writer.label_writes(), vec![(3, vec!["bug".to_string()])]);
  }

  #[tokio::test]
  async fn test_denied_corrections_keep_local_repair() {
    let mut h = Harness::new(RecordingGateway::default());
    h.writer.fail_next(WriteError::PermissionDenied("403".into()));
    h.fetcher.script(
      ResourceKind::Issues,
      fresh(
        Payload::Issues(vec![
          issue(1, IssueState::Closed, &["status.open"]),
          issue(2, IssueState::Closed, &["status.open"]),
          issue(3, IssueState::Open, &["status.closed"]),
        ]),
        "i1",
      ),
    );
    h.fetcher.script(
      ResourceKind::Labels,
      fresh(
        Payload::Labels(vec![
          Label::new("status.open", "009800"),
          Label::new("status.closed", "0052cc"),
        ]),
        "l1",
      ),
    );
    h.coordinator.load_all();
    h.settle().await;
    h.settle().await;

    assert_eq!(h.writer.label_writes().len(), 1);
    let store = h.coordinator.store();
    assert!(store.issues().values().iter().all(|i| i.labels.is_empty()));
  }

  #[tokio::test]
  async fn test_full_load_creates_missing_status_labels() {
    let mut h = Harness::new(RecordingGateway::default());
    h.fetcher.script(
      ResourceKind::Labels,
      fresh(Payload::Labels(vec![Label::new("bug", "ee0701")]), "l1"),
    );
    h.coordinator.load_all();
    h.settle().await;

    let created: Vec<String> = h
      .writer
      .created_labels()
      .into_iter()
      .map(|l| l.name)
      .collect();
    assert_eq!(created, vec!["status.open", "status.closed"]);
    assert_eq!(h.coordinator.store().labels().len(), 3);
    assert!(h.coordinator.store().label("status.closed").is_some());
  }

  #[tokio::test]
  async fn test_warm_start_then_remote() {
    let cached = Snapshot {
      issues: vec![
        issue(2, IssueState::Open, &[]),
        issue(1, IssueState::Open, &[]),
      ],
      collaborators: vec![user(1, "x"), user(2, "y")],
      ..Snapshot::default()
    };
    let mut h = Harness::new(RecordingGateway::with_cached(cached));
    h.fetcher.script(
      ResourceKind::Collaborators,
      fresh(
        Payload::Collaborators(vec![user(1, "x2"), user(3, "z")]),
        "c1",
      ),
    );

    h.coordinator.load_all();
    // Cached collections are visible before the remote answers
    assert_eq!(h.issue_ids(), vec![2, 1]);
    assert!(h.gateway.writes().is_empty());
    let a = h.coordinator.store().get::<User>(&1).unwrap();

    h.settle().await;

    assert_eq!(h.issue_ids(), vec![2, 1]);
    let a_after = h.coordinator.store().get::<User>(&1).unwrap();
    assert!(Rc::ptr_eq(&a, &a_after));
    assert_eq!(
      h.coordinator.store().collaborators().values(),
      vec![user(1, "x2"), user(3, "z")]
    );
    assert_eq!(h.gateway.writes().len(), 1);
  }

  #[tokio::test]
  async fn test_feed_replaced_only_when_non_empty() {
    let mut h = Harness::new(RecordingGateway::default());
    h.fetcher.script(
      ResourceKind::Feed,
      FetchOutcome::Fresh {
        payload: Payload::Feed(vec![feed_event(1), feed_event(2)]),
        token: None,
      },
    );
    h.coordinator.load_all();
    h.settle().await;
    assert_eq!(h.coordinator.store().feed().len(), 2);
    assert!(h.gateway.writes().is_empty());

    h.fetcher.script(
      ResourceKind::Feed,
      FetchOutcome::Fresh {
        payload: Payload::Feed(Vec::new()),
        token: None,
      },
    );
    h.coordinator.force_reload();
    h.settle().await;
    assert_eq!(h.coordinator.store().feed().len(), 2);
  }

  #[tokio::test]
  async fn test_messages_for_other_projects_are_ignored() {
    let mut h = Harness::new(RecordingGateway::default());
    let source = LoadSource::Remote(RemoteSnapshot {
      started_at: Utc::now(),
      issues_since: None,
      outcomes: vec![(
        ResourceKind::Issues,
        fresh(Payload::Issues(vec![issue(1, IssueState::Open, &[])]), "i1"),
      )],
    });

    h.coordinator.handle(SyncMessage::Loaded {
      project: ProjectRef::new("octo", "other"),
      source,
    });

    assert!(h.coordinator.store().issues().is_empty());
  }

  #[tokio::test]
  async fn test_append_new_goes_first_and_persists() {
    let mut h = seeded().await;
    let writes_before = h.gateway.writes().len();

    h.coordinator.append_new(issue(10, IssueState::Open, &[]));

    assert_eq!(h.issue_ids(), vec![10, 3, 2, 1]);
    assert_eq!(h.gateway.writes().len(), writes_before + 1);
    assert_eq!(h.gateway.last_write().unwrap().issues[0].id, 10);
  }

  #[tokio::test]
  async fn test_local_label_and_milestone_edits() {
    let mut h = seeded().await;

    h.coordinator.add_label(Label::new("ui", "ededed"));
    assert!(h.coordinator.store().label("ui").is_some());

    h.coordinator.delete_label("bug");
    assert!(h.coordinator.store().label("bug").is_none());

    let writes = h.gateway.writes().len();
    h.coordinator.delete_label("missing");
    assert_eq!(h.gateway.writes().len(), writes);

    h.coordinator.add_milestone(Milestone {
      title: "v1".to_string(),
      number: 1,
      state: IssueState::Open,
      description: None,
      due_on: None,
      open_issues: 0,
      closed_issues: 0,
    });
    assert!(h.coordinator.store().milestone("v1").is_some());
    h.coordinator.delete_milestone("v1");
    assert!(h.coordinator.store().milestones().is_empty());
  }

  #[tokio::test]
  async fn test_shutdown_drops_subscribers() {
    let mut h = seeded().await;
    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();
    h.coordinator
      .store_mut()
      .on_any_change(move |_| c.set(c.get() + 1));

    h.coordinator.refresh();
    assert_eq!(calls.get(), ResourceKind::ALL.len());

    h.coordinator.shutdown();
    h.coordinator.refresh();
    assert_eq!(calls.get(), ResourceKind::ALL.len());
    assert_eq!(h.coordinator.phase(), SyncPhase::Idle);
  }
}
