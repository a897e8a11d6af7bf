//! Core traits and types for snapshot persistence.

use color_eyre::Result;

use crate::model::{Issue, Label, Milestone, ProjectRef, User};
use crate::sync::CacheMetadata;

/// Everything persisted for a project: the durable collections and their freshness tokens.
///
/// The activity feed is transient and never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
  pub meta: CacheMetadata,
  pub issues: Vec<Issue>,
  pub labels: Vec<Label>,
  pub milestones: Vec<Milestone>,
  pub collaborators: Vec<User>,
}

/// Durable snapshot writer/reader.
///
/// Writes replace the whole stored snapshot of a project.
pub trait PersistenceGateway {
  /// Store the current snapshot of a project.
  fn write(&self, project: &ProjectRef, snapshot: &Snapshot) -> Result<()>;

  /// Read the last stored snapshot of a project, if any (warm start).
  fn read_cached(&self, project: &ProjectRef) -> Result<Option<Snapshot>>;
}
