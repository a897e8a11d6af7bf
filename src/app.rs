use crate::cache::{NoopStorage, PersistenceGateway, SqliteStorage};
use crate::commands::{self, COMMANDS};
use crate::config::Config;
use crate::error::WriteError;
use crate::event::{Event, EventHandler, RemoteEdit};
use crate::github::GithubClient;
use crate::model::{Comment, IssueState, Label, ProjectRef, ResourceKind};
use crate::sync::{
  Change, RemoteWriter, ResourceStore, SubscriptionId, SyncCoordinator, SyncMessage,
};
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type Coordinator = SyncCoordinator<GithubClient, GithubClient>;

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// GitHub client, shared by every project session
  github: Arc<GithubClient>,

  /// Persist snapshots between runs
  use_cache: bool,

  /// Active project session
  coordinator: Option<Coordinator>,

  /// Channel sync workers report back on
  sync_tx: mpsc::UnboundedSender<SyncMessage>,
  sync_rx: Option<mpsc::UnboundedReceiver<SyncMessage>>,

  /// Event sender for async tasks
  event_tx: Option<mpsc::UnboundedSender<Event>>,

  /// Which change notifications to print: none, one collection, or all (`Some(None)`)
  watching: Option<Option<ResourceKind>>,
  changes: Option<SubscriptionId>,

  /// Whether to quit
  should_quit: bool,
}

impl App {
  pub fn new(config: Config, use_cache: bool) -> Result<Self> {
    let github = Arc::new(GithubClient::new(&config)?);
    let (sync_tx, sync_rx) = mpsc::unbounded_channel();

    Ok(Self {
      config,
      github,
      use_cache,
      coordinator: None,
      sync_tx,
      sync_rx: Some(sync_rx),
      event_tx: None,
      watching: Some(None),
      changes: None,
      should_quit: false,
    })
  }

  pub async fn run(&mut self, initial: Option<ProjectRef>) -> Result<()> {
    let ctrl_c = async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
      }
    };
    let events = EventHandler::new(self.config.poll_interval());
    self.run_until(initial, events, ctrl_c).await
  }

  /// Run the main loop until a `quit` command or until `shutdown` completes.
  pub async fn run_until(
    &mut self,
    initial: Option<ProjectRef>,
    mut events: EventHandler,
    shutdown: impl Future<Output = ()>,
  ) -> Result<()> {
    tokio::pin!(shutdown);

    let mut sync_rx = self
      .sync_rx
      .take()
      .ok_or_else(|| eyre!("Application is already running"))?;

    self.event_tx = Some(events.sender());

    match initial {
      Some(project) => self.open_project(project),
      None => println!("No project selected. Use `project OWNER/REPO` to open one."),
    }

    // Main loop
    while !self.should_quit {
      tokio::select! {
        Some(event) = events.next() => self.handle_event(event),
        Some(message) = sync_rx.recv() => self.handle_sync(message),
        _ = &mut shutdown => self.should_quit = true,
      }
      self.show_notices();
    }

    if let Some(coordinator) = self.coordinator.as_mut() {
      coordinator.shutdown();
    }

    Ok(())
  }

  // ==========================================================================
  // Project sessions
  // ==========================================================================

  fn gateway(&self) -> Box<dyn PersistenceGateway> {
    if !self.use_cache {
      return Box::new(NoopStorage);
    }
    match SqliteStorage::open() {
      Ok(storage) => Box::new(storage),
      Err(e) => {
        warn!("Cache unavailable, continuing without it: {}", e);
        Box::new(NoopStorage)
      }
    }
  }

  /// Tear down the current session and start one for `project`.
  fn open_project(&mut self, project: ProjectRef) {
    if let Some(mut previous) = self.coordinator.take() {
      info!(from = %previous.project(), to = %project, "Switching project");
      previous.shutdown();
    }

    let mut coordinator = SyncCoordinator::new(
      project.clone(),
      ResourceStore::new(),
      self.github.clone(),
      self.github.clone(),
      self.gateway(),
      self.config.sync_settings(&project),
      self.sync_tx.clone(),
    );
    self.changes = self
      .watching
      .map(|kind| subscribe_changes(&mut coordinator, kind));

    println!("Opening {}", project);
    coordinator.load_all();
    self.coordinator = Some(coordinator);
  }

  // ==========================================================================
  // Event handling
  // ==========================================================================

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::Input(line) => self.handle_input(&line),
      Event::InputClosed => debug!("Stdin closed, continuing to poll"),
      Event::Tick => {
        if let Some(coordinator) = self.coordinator.as_mut() {
          coordinator.refresh_incremental();
        }
      }
      Event::Comments {
        project,
        issue_id,
        result,
      } => self.handle_comments(project, issue_id, result),
      Event::Edited { project, result } => self.handle_edited(project, result),
    }
  }

  fn handle_sync(&mut self, message: SyncMessage) {
    if let Some(coordinator) = self.coordinator.as_mut() {
      coordinator.handle(message);
    }
  }

  fn show_notices(&mut self) {
    if let Some(coordinator) = self.coordinator.as_mut() {
      for notice in coordinator.take_notices() {
        eprintln!("! {}: {}", notice.title, notice.message);
      }
    }
  }

  fn handle_input(&mut self, line: &str) {
    if line.trim().is_empty() {
      return;
    }

    let Some((command, arg)) = commands::resolve(line) else {
      println!("Unknown command: {} (try `help`)", line.trim());
      return;
    };

    match command.name {
      "quit" => self.should_quit = true,
      "help" => {
        for cmd in COMMANDS {
          println!("  {:<10} {:<16} {}", cmd.name, cmd.aliases.join(", "), cmd.description);
        }
      }
      "project" => match arg.parse::<ProjectRef>() {
        Ok(project) => self.open_project(project),
        Err(e) => println!("{}", e),
      },
      "refresh" => self.with_session(|c| {
        if !c.refresh_incremental() {
          println!("A sync is already in progress");
        }
      }),
      "reload" => self.with_session(|c| {
        if !c.force_reload() {
          println!("A sync is already in progress");
        }
      }),
      "status" => self.with_session(|c| print_status(c)),
      "issues" => self.with_session(|c| {
        print_issues(c.store(), Some(arg).filter(|l| !l.is_empty()))
      }),
      "show" => match arg.parse::<u64>() {
        Ok(id) => self.with_session(|c| print_issue(c.store(), id)),
        Err(_) => println!("Usage: show NUMBER"),
      },
      "new" => self.new_issue(arg),
      "label" => self.edit_label(arg),
      "milestone" => self.edit_milestone(arg),
      "watch" => self.watch(arg),
      "comments" => match arg.parse::<u64>() {
        Ok(issue_id) => self.show_comments(issue_id),
        Err(_) => println!("Usage: comments NUMBER"),
      },
      other => debug!(command = other, "Unhandled command"),
    }
  }

  fn with_session(&mut self, f: impl FnOnce(&mut Coordinator)) {
    match self.coordinator.as_mut() {
      Some(coordinator) => f(coordinator),
      None => println!("No project open"),
    }
  }

  /// `watch` toggles all notifications, `watch KIND` narrows them to one collection.
  fn watch(&mut self, arg: &str) {
    let watching = if arg.is_empty() {
      match self.watching {
        Some(_) => None,
        None => Some(None),
      }
    } else {
      match ResourceKind::ALL.into_iter().find(|k| k.as_str() == arg) {
        Some(kind) => Some(Some(kind)),
        None => {
          println!("Unknown collection {}", arg);
          return;
        }
      }
    };

    match watching {
      Some(Some(kind)) => println!("Printing changes to {}", kind),
      Some(None) => println!("Printing all changes"),
      None => println!("Change notifications off"),
    }
    self.watching = watching;

    let Some(coordinator) = self.coordinator.as_mut() else {
      return;
    };
    if let Some(id) = self.changes.take() {
      coordinator.store_mut().unsubscribe(id);
    }
    self.changes = watching.map(|kind| subscribe_changes(coordinator, kind));
  }

  // ==========================================================================
  // Remote edits
  // ==========================================================================

  /// Run `edit` off the loop and report its result back as an event.
  fn spawn_edit<Fut>(&self, project: ProjectRef, edit: Fut)
  where
    Fut: Future<Output = Result<RemoteEdit, WriteError>> + Send + 'static,
  {
    let Some(tx) = self.event_tx.clone() else {
      return;
    };
    tokio::spawn(async move {
      let result = edit.await;
      let _ = tx.send(Event::Edited { project, result });
    });
  }

  fn new_issue(&mut self, arg: &str) {
    let Some(coordinator) = self.coordinator.as_ref() else {
      println!("No project open");
      return;
    };
    let Some((template, title)) = parse_new_issue(arg) else {
      println!("Usage: new [#NUMBER] TITLE");
      return;
    };

    let labels: Vec<String> = match template {
      Some(id) => {
        let Some(source) = coordinator.store().issue(id) else {
          println!("No issue #{}", id);
          return;
        };
        let source = source.borrow();
        let inherited: Vec<String> = coordinator
          .policy()
          .inheritable_labels(&source.labels)
          .into_iter()
          .map(String::from)
          .collect();
        inherited
      }
      None => Vec::new(),
    };

    let github = self.github.clone();
    let project = coordinator.project().clone();
    let title = title.to_string();
    let target = project.clone();
    self.spawn_edit(project, async move {
      github
        .create_issue(&target, &title, &labels)
        .await
        .map(RemoteEdit::IssueCreated)
    });
  }

  fn edit_label(&mut self, arg: &str) {
    let Some(coordinator) = self.coordinator.as_ref() else {
      println!("No project open");
      return;
    };
    let store = coordinator.store();
    let github = self.github.clone();
    let project = coordinator.project().clone();
    let target = project.clone();

    match split_subcommand(arg) {
      ("add", rest) if !rest.is_empty() => {
        let (name, color) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        if store.label(name).is_some() {
          println!("Label {} already exists", name);
          return;
        }
        let color = color.trim().trim_start_matches('#');
        let label = Label::new(name, if color.is_empty() { DEFAULT_LABEL_COLOR } else { color });
        self.spawn_edit(project, async move {
          github
            .create_label(&target, &label)
            .await
            .map(RemoteEdit::LabelCreated)
        });
      }
      ("rm", name) if !name.is_empty() => {
        if store.label(name).is_none() {
          println!("No label {}", name);
          return;
        }
        let name = name.to_string();
        self.spawn_edit(project, async move {
          github
            .delete_label(&target, &name)
            .await
            .map(|_| RemoteEdit::LabelDeleted(name))
        });
      }
      _ => println!("Usage: label add NAME [COLOR] | label rm NAME"),
    }
  }

  fn edit_milestone(&mut self, arg: &str) {
    let Some(coordinator) = self.coordinator.as_ref() else {
      println!("No project open");
      return;
    };
    let store = coordinator.store();
    let github = self.github.clone();
    let project = coordinator.project().clone();
    let target = project.clone();

    match split_subcommand(arg) {
      ("add", title) if !title.is_empty() => {
        if store.milestone(title).is_some() {
          println!("Milestone {} already exists", title);
          return;
        }
        let title = title.to_string();
        self.spawn_edit(project, async move {
          github
            .create_milestone(&target, &title)
            .await
            .map(RemoteEdit::MilestoneCreated)
        });
      }
      ("rm", title) if !title.is_empty() => {
        let Some(number) = store.milestone(title).map(|m| m.borrow().number) else {
          println!("No milestone {}", title);
          return;
        };
        let title = title.to_string();
        self.spawn_edit(project, async move {
          github
            .delete_milestone(&target, number)
            .await
            .map(|_| RemoteEdit::MilestoneDeleted(title))
        });
      }
      _ => println!("Usage: milestone add TITLE | milestone rm TITLE"),
    }
  }

  fn handle_edited(&mut self, project: ProjectRef, result: Result<RemoteEdit, WriteError>) {
    let Some(coordinator) = self.coordinator.as_mut() else {
      return;
    };
    if coordinator.project() != &project {
      return;
    }

    match result {
      Ok(RemoteEdit::IssueCreated(issue)) => {
        println!("Opened #{}: {}", issue.id, issue.title);
        coordinator.append_new(issue);
      }
      Ok(RemoteEdit::LabelCreated(label)) => coordinator.add_label(label),
      Ok(RemoteEdit::LabelDeleted(name)) => coordinator.delete_label(&name),
      Ok(RemoteEdit::MilestoneCreated(milestone)) => coordinator.add_milestone(milestone),
      Ok(RemoteEdit::MilestoneDeleted(title)) => coordinator.delete_milestone(&title),
      Err(e) => {
        warn!(project = %project, "Remote edit failed: {}", e);
        eprintln!("! Edit failed: {}", e);
      }
    }
  }

  // ==========================================================================
  // Comments
  // ==========================================================================

  fn show_comments(&mut self, issue_id: u64) {
    let Some(coordinator) = self.coordinator.as_ref() else {
      println!("No project open");
      return;
    };

    let store = coordinator.store();
    if store.issue(issue_id).is_none() {
      println!("No issue #{}", issue_id);
      return;
    }
    if let Some(comments) = store.comments_for(issue_id) {
      print_comments(issue_id, comments);
      return;
    }

    let Some(tx) = self.event_tx.clone() else {
      return;
    };
    let github = self.github.clone();
    let project = coordinator.project().clone();

    tokio::spawn(async move {
      let result = github.fetch_comments(&project, issue_id).await;
      let _ = tx.send(Event::Comments {
        project,
        issue_id,
        result,
      });
    });
  }

  fn handle_comments(
    &mut self,
    project: ProjectRef,
    issue_id: u64,
    result: Result<Vec<Comment>, crate::error::FetchError>,
  ) {
    let Some(coordinator) = self.coordinator.as_mut() else {
      return;
    };
    if coordinator.project() != &project {
      return;
    }

    match result {
      Ok(comments) => {
        print_comments(issue_id, &comments);
        coordinator.store_mut().cache_comments(issue_id, comments);
      }
      Err(e) => {
        let (title, message) = e.user_message();
        eprintln!("! {}: {}", title, message);
      }
    }
  }
}

/// Color of labels created without one
const DEFAULT_LABEL_COLOR: &str = "ededed";

/// Parse `[#NUMBER] TITLE`.
fn parse_new_issue(arg: &str) -> Option<(Option<u64>, &str)> {
  let arg = arg.trim();
  let (template, title) = match arg.strip_prefix('#') {
    Some(rest) => {
      let (number, title) = rest.split_once(char::is_whitespace)?;
      (Some(number.parse().ok()?), title.trim())
    }
    None => (None, arg),
  };

  if title.is_empty() {
    None
  } else {
    Some((template, title))
  }
}

fn split_subcommand(arg: &str) -> (&str, &str) {
  let (sub, rest) = arg.split_once(char::is_whitespace).unwrap_or((arg, ""));
  (sub, rest.trim())
}

// ============================================================================
// Output
// ============================================================================

fn subscribe_changes(coordinator: &mut Coordinator, kind: Option<ResourceKind>) -> SubscriptionId {
  match kind {
    Some(kind) => coordinator.store_mut().on_change(kind, print_change),
    None => coordinator.store_mut().on_any_change(print_change),
  }
}

fn print_change(change: &Change) {
  if change.replaced {
    println!("{}: reloaded", change.kind);
  } else {
    println!(
      "{}: {} added, {} updated, {} removed",
      change.kind, change.added, change.updated, change.removed
    );
  }
}

fn print_status(coordinator: &Coordinator) {
  let store = coordinator.store();
  println!("{} ({})", coordinator.project(), coordinator.phase().as_str());

  for kind in ResourceKind::ALL {
    let meta = store.cache_meta(kind);
    let checked = meta
      .last_checked
      .map(|t| format!(", checked {}", t.format("%Y-%m-%d %H:%M:%S")))
      .unwrap_or_default();
    let cached = if meta.token.is_some() { ", cached" } else { "" };
    println!("  {:<14} {:>5}{}{}", kind.as_str(), store.len(kind), cached, checked);
  }

  let groups: BTreeSet<String> = store
    .labels()
    .items()
    .iter()
    .filter_map(|l| l.borrow().group().map(String::from))
    .collect();
  if !groups.is_empty() {
    let described: Vec<String> = groups
      .iter()
      .map(|g| {
        if store.is_exclusive_label_group(g) {
          format!("{} (exclusive)", g)
        } else {
          g.clone()
        }
      })
      .collect();
    println!("  label groups: {}", described.join(", "));
  }

  if let Some(e) = coordinator.last_error() {
    println!("  last sync failed: {}", e);
  }
}

fn state_str(state: IssueState) -> &'static str {
  match state {
    IssueState::Open => "open",
    IssueState::Closed => "closed",
  }
}

fn print_issues(store: &ResourceStore, label: Option<&str>) {
  if store.issues().is_empty() {
    println!("No issues loaded");
    return;
  }

  let mut shown = 0;
  for issue in store.issues().items() {
    let issue = issue.borrow();
    if label.is_some_and(|l| !issue.has_label(l)) {
      continue;
    }
    shown += 1;
    let labels = if issue.labels.is_empty() {
      String::new()
    } else {
      format!(" [{}]", issue.labels.join(", "))
    };
    println!(
      "  #{:<5} {:<6} {}{}",
      issue.id,
      state_str(issue.state),
      issue.title,
      labels
    );
  }
  println!("{} issue(s)", shown);
}

fn print_issue(store: &ResourceStore, id: u64) {
  let (Some(issue), Some(index)) = (store.issue(id), store.index_of_issue(id)) else {
    println!("No issue #{}", id);
    return;
  };
  let issue = issue.borrow();

  println!(
    "#{} {} ({}, {} of {})",
    issue.id,
    issue.title,
    state_str(issue.state),
    index + 1,
    store.issues().len()
  );
  if !issue.labels.is_empty() {
    println!("  labels: {}", issue.labels.join(", "));
  }
  if let Some(title) = &issue.milestone {
    match store.milestone(title) {
      Some(milestone) => {
        let milestone = milestone.borrow();
        println!(
          "  milestone: {} ({} open, {} closed)",
          milestone.title, milestone.open_issues, milestone.closed_issues
        );
      }
      None => println!("  milestone: {}", title),
    }
  }
  if let Some(login) = &issue.assignee {
    match store.collaborator(login) {
      Some(user) => match &user.borrow().name {
        Some(name) => println!("  assignee: {} ({})", login, name),
        None => println!("  assignee: {}", login),
      },
      None => println!("  assignee: {} (not a collaborator)", login),
    }
  }
  println!("  comments: {}", issue.comments);
}

fn print_comments(issue_id: u64, comments: &[Comment]) {
  println!("#{}: {} comment(s)", issue_id, comments.len());
  for comment in comments {
    println!(
      "  [{}] {}: {}",
      comment.created_at.format("%Y-%m-%d"),
      comment.author.as_deref().unwrap_or("ghost"),
      comment.body.lines().next().unwrap_or_default()
    );
  }
}
