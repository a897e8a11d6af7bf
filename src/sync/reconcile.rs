//! Minimal diff between a mirrored collection and a freshly fetched list.

use std::collections::{HashMap, HashSet};
use tracing::warn;

use super::store::Shared;
use crate::model::Entity;

/// How the incoming list relates to the remote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
  /// Incoming is the complete remote collection; absent keys are removed
  Mirror,
  /// Incoming holds only entries changed since the last check; nothing is removed
  Upsert,
}

/// Result of a reconciliation, applied by the store as one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet<E: Entity> {
  /// Keys of existing entries to drop
  pub to_remove: Vec<E::Key>,
  /// New entries (in incoming order) and changed entries to copy in place
  pub to_add_or_update: Vec<E>,
}

impl<E: Entity> ChangeSet<E> {
  pub fn empty() -> Self {
    Self {
      to_remove: Vec::new(),
      to_add_or_update: Vec::new(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.to_remove.is_empty() && self.to_add_or_update.is_empty()
  }

  /// Number of entries touched
  pub fn len(&self) -> usize {
    self.to_remove.len() + self.to_add_or_update.len()
  }
}

impl<E: Entity> Default for ChangeSet<E> {
  fn default() -> Self {
    Self::empty()
  }
}

/// Compute the changes turning `existing` into `incoming`.
///
/// Entries whose value already equals the incoming one are left out, so applying
/// the result and reconciling again with the same input yields an empty set.
/// An empty `incoming` for a kind whose empty snapshots are not trusted (issues)
/// short-circuits to an empty set instead of wiping the collection.
pub fn reconcile<E: Entity>(
  existing: &[Shared<E>],
  incoming: Vec<E>,
  mode: ReconcileMode,
) -> ChangeSet<E> {
  if incoming.is_empty() && E::KIND.empty_snapshot_is_noop() {
    return ChangeSet::empty();
  }

  let current: HashMap<E::Key, &Shared<E>> = existing
    .iter()
    .map(|entry| (entry.borrow().key(), entry))
    .collect();

  let mut seen: HashSet<E::Key> = HashSet::with_capacity(incoming.len());
  let mut to_add_or_update = Vec::with_capacity(incoming.len());

  for entity in incoming {
    let key = entity.key();
    if !seen.insert(key.clone()) {
      warn!(kind = %E::KIND, key = %key, "Duplicate key in fetched list, keeping first");
      continue;
    }

    let unchanged = current
      .get(&key)
      .map(|entry| *entry.borrow() == entity)
      .unwrap_or(false);

    if !unchanged {
      to_add_or_update.push(entity);
    }
  }

  let to_remove = match mode {
    ReconcileMode::Mirror => existing
      .iter()
      .map(|entry| entry.borrow().key())
      .filter(|key| !seen.contains(key))
      .collect(),
    ReconcileMode::Upsert => Vec::new(),
  };

  ChangeSet {
    to_remove,
    to_add_or_update,
  }
}
