use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::error::{FetchError, WriteError};
use crate::model::{Comment, Issue, Label, Milestone, ProjectRef};

/// Remote change made from the command line, mirrored locally once confirmed
#[derive(Debug)]
pub enum RemoteEdit {
  IssueCreated(Issue),
  LabelCreated(Label),
  LabelDeleted(String),
  MilestoneCreated(Milestone),
  MilestoneDeleted(String),
}

/// Application events
#[derive(Debug)]
pub enum Event {
  /// A line typed on stdin
  Input(String),
  /// Stdin was closed
  InputClosed,
  /// Periodic tick for polling the remote
  Tick,
  /// Comments requested for an issue arrived
  Comments {
    project: ProjectRef,
    issue_id: u64,
    result: Result<Vec<Comment>, FetchError>,
  },
  /// A remote edit finished
  Edited {
    project: ProjectRef,
    result: Result<RemoteEdit, WriteError>,
  },
}

/// Event handler that produces events from stdin lines and a poll timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given poll interval
  pub fn new(poll_interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn stdin reader
    let input_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if input_tx.send(Event::Input(line)).is_err() {
              break;
            }
          }
          Ok(None) | Err(_) => {
            let _ = input_tx.send(Event::InputClosed);
            break;
          }
        }
      }
    });

    // Spawn poll timer; the first tick would fire immediately, skip it
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(poll_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      interval.tick().await;
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Handler without stdin or timer producers; only `sender()` feeds it.
  #[cfg(test)]
  pub fn detached() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender for async tasks reporting back to the loop
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
