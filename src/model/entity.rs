//! Identity and kind tagging shared by every mirrored resource.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// The five remote collections mirrored for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
  Issues,
  Labels,
  Milestones,
  Collaborators,
  Feed,
}

impl ResourceKind {
  pub const ALL: [ResourceKind; 5] = [
    ResourceKind::Issues,
    ResourceKind::Labels,
    ResourceKind::Milestones,
    ResourceKind::Collaborators,
    ResourceKind::Feed,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceKind::Issues => "issues",
      ResourceKind::Labels => "labels",
      ResourceKind::Milestones => "milestones",
      ResourceKind::Collaborators => "collaborators",
      ResourceKind::Feed => "feed",
    }
  }

  /// An empty fresh list for this kind means "remote told us nothing", not "remote is empty".
  pub fn empty_snapshot_is_noop(&self) -> bool {
    matches!(self, ResourceKind::Issues)
  }

  /// Newly seen entries go to the front (most-recent-first ordering).
  pub fn new_entries_at_front(&self) -> bool {
    matches!(self, ResourceKind::Issues)
  }

  /// Whether the remote supports conditional (ETag) fetches for this kind.
  pub fn is_conditional(&self) -> bool {
    !matches!(self, ResourceKind::Feed)
  }
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Trait for entities held in a mirrored collection.
///
/// Implementors must provide a stable identity key. Two values with the same key
/// are the same remote object, possibly at different points in time.
pub trait Entity: Clone + PartialEq + fmt::Debug + Send + Serialize + DeserializeOwned + 'static {
  /// Identity key type (numeric id, or name for labels and milestones)
  type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display;

  /// Which collection this entity lives in
  const KIND: ResourceKind;

  /// Identity key for this entity
  fn key(&self) -> Self::Key;

  /// Key as stored in persistence
  fn cache_key(&self) -> String {
    self.key().to_string()
  }
}
