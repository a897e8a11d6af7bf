//! Observable in-memory mirror of one project's remote collections.
//!
//! The store is owned by the UI-affinity loop and is never shared across threads:
//! entries are `Rc<RefCell<_>>` handles so that a refresh copies new values into
//! the existing allocation and anything holding a handle keeps seeing live data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use tracing::{debug, info};

use super::reconcile::ChangeSet;
use crate::cache::Snapshot;
use crate::model::{
  Comment, Entity, FeedEvent, Issue, Label, Milestone, ResourceKind, User,
};

/// Shared handle to a mirrored entity
pub type Shared<E> = Rc<RefCell<E>>;

/// Subscriber callback, invoked once per committed batch
pub type Listener = Box<dyn FnMut(&Change)>;

/// Summary of one committed batch mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
  pub kind: ResourceKind,
  pub added: usize,
  pub updated: usize,
  pub removed: usize,
  /// The whole collection was cleared and refilled
  pub replaced: bool,
}

impl Change {
  fn new(kind: ResourceKind) -> Self {
    Self {
      kind,
      added: 0,
      updated: 0,
      removed: 0,
      replaced: false,
    }
  }

  pub fn is_empty(&self) -> bool {
    !self.replaced && self.added == 0 && self.updated == 0 && self.removed == 0
  }
}

/// Ordered, identity-unique sequence of entities
#[derive(Debug)]
pub struct Collection<E: Entity> {
  items: Vec<Shared<E>>,
}

impl<E: Entity> Collection<E> {
  pub fn new() -> Self {
    Self { items: Vec::new() }
  }

  pub fn items(&self) -> &[Shared<E>] {
    &self.items
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn get(&self, key: &E::Key) -> Option<Shared<E>> {
    self
      .items
      .iter()
      .find(|e| e.borrow().key() == *key)
      .cloned()
  }

  pub fn position(&self, key: &E::Key) -> Option<usize> {
    self.items.iter().position(|e| e.borrow().key() == *key)
  }

  /// Owned copies of the current values, in collection order
  pub fn values(&self) -> Vec<E> {
    self.items.iter().map(|e| e.borrow().clone()).collect()
  }

  /// Clear and refill. Duplicate keys in `entities` keep their first occurrence.
  pub fn replace_all(&mut self, entities: Vec<E>) -> Change {
    let mut change = Change::new(E::KIND);
    change.removed = self.items.len();
    change.replaced = true;

    let mut seen = HashSet::with_capacity(entities.len());
    self.items = entities
      .into_iter()
      .filter(|e| seen.insert(e.key()))
      .map(|e| Rc::new(RefCell::new(e)))
      .collect();
    change.added = self.items.len();
    change
  }

  /// Remove `to_remove`, then copy matched entries in place and add new ones.
  ///
  /// New entries keep their relative order and go to the front for kinds ordered
  /// most-recent-first, to the back otherwise.
  pub fn apply(&mut self, changes: ChangeSet<E>) -> Change {
    let mut change = Change::new(E::KIND);

    if !changes.to_remove.is_empty() {
      let doomed: HashSet<E::Key> = changes.to_remove.into_iter().collect();
      let before = self.items.len();
      self.items.retain(|e| !doomed.contains(&e.borrow().key()));
      change.removed = before - self.items.len();
    }

    let index: HashMap<E::Key, usize> = self
      .items
      .iter()
      .enumerate()
      .map(|(i, e)| (e.borrow().key(), i))
      .collect();
    let mut fresh: Vec<Shared<E>> = Vec::new();

    for entity in changes.to_add_or_update {
      let key = entity.key();
      if let Some(&i) = index.get(&key) {
        *self.items[i].borrow_mut() = entity;
        change.updated += 1;
      } else if let Some(pending) = fresh.iter().find(|e| e.borrow().key() == key) {
        *pending.borrow_mut() = entity;
      } else {
        fresh.push(Rc::new(RefCell::new(entity)));
      }
    }

    change.added = fresh.len();
    if E::KIND.new_entries_at_front() {
      self.items.splice(0..0, fresh);
    } else {
      self.items.extend(fresh);
    }
    change
  }

  /// Insert at the front, or update in place if the key is already present.
  pub fn insert_front(&mut self, entity: E) -> Change {
    self.insert(entity, true)
  }

  /// Append at the back, or update in place if the key is already present.
  pub fn push(&mut self, entity: E) -> Change {
    self.insert(entity, false)
  }

  fn insert(&mut self, entity: E, front: bool) -> Change {
    let mut change = Change::new(E::KIND);
    if let Some(existing) = self.get(&entity.key()) {
      *existing.borrow_mut() = entity;
      change.updated = 1;
    } else {
      let entry = Rc::new(RefCell::new(entity));
      if front {
        self.items.insert(0, entry);
      } else {
        self.items.push(entry);
      }
      change.added = 1;
    }
    change
  }

  pub fn remove(&mut self, key: &E::Key) -> Change {
    let mut change = Change::new(E::KIND);
    if let Some(i) = self.position(key) {
      self.items.remove(i);
      change.removed = 1;
    }
    change
  }
}

impl<E: Entity> Default for Collection<E> {
  fn default() -> Self {
    Self::new()
  }
}

/// Freshness information for one resource kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
  /// Opaque token (ETag) from the last successful fetch
  pub token: Option<String>,
  /// When issues were last checked, for `since` queries
  pub last_checked: Option<DateTime<Utc>>,
}

/// Freshness information for all resource kinds of a project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
  entries: BTreeMap<ResourceKind, CacheMeta>,
}

impl CacheMetadata {
  pub fn get(&self, kind: ResourceKind) -> CacheMeta {
    self.entries.get(&kind).cloned().unwrap_or_default()
  }

  pub fn set_token(&mut self, kind: ResourceKind, token: Option<String>) {
    self.entries.entry(kind).or_default().token = token;
  }

  pub fn set_last_checked(&mut self, kind: ResourceKind, at: DateTime<Utc>) {
    self.entries.entry(kind).or_default().last_checked = Some(at);
  }

  /// Drop everything known about `kind`, forcing its next fetch to be unconditional.
  pub fn forget(&mut self, kind: ResourceKind) {
    self.entries.remove(&kind);
  }

  pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &CacheMeta)> {
    self.entries.iter().map(|(k, v)| (*k, v))
  }
}

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
  id: SubscriptionId,
  /// `None` subscribes to every collection
  kind: Option<ResourceKind>,
  callback: Listener,
}

/// Entities that live in one of the store's collections
pub trait Stored: Entity {
  fn collection(store: &ResourceStore) -> &Collection<Self>;
  fn collection_mut(store: &mut ResourceStore) -> &mut Collection<Self>;
}

macro_rules! stored {
  ($ty:ty, $field:ident) => {
    impl Stored for $ty {
      fn collection(store: &ResourceStore) -> &Collection<Self> {
        &store.$field
      }

      fn collection_mut(store: &mut ResourceStore) -> &mut Collection<Self> {
        &mut store.$field
      }
    }
  };
}

stored!(Issue, issues);
stored!(Label, labels);
stored!(Milestone, milestones);
stored!(User, collaborators);
stored!(FeedEvent, feed);

/// The five mirrored collections of a project plus their cache metadata.
#[derive(Default)]
pub struct ResourceStore {
  issues: Collection<Issue>,
  labels: Collection<Label>,
  milestones: Collection<Milestone>,
  collaborators: Collection<User>,
  feed: Collection<FeedEvent>,
  meta: CacheMetadata,
  comments: HashMap<u64, Vec<Comment>>,
  subscriptions: Vec<Subscription>,
  next_subscription: u64,
}

impl ResourceStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn issues(&self) -> &Collection<Issue> {
    &self.issues
  }

  pub fn labels(&self) -> &Collection<Label> {
    &self.labels
  }

  pub fn milestones(&self) -> &Collection<Milestone> {
    &self.milestones
  }

  pub fn collaborators(&self) -> &Collection<User> {
    &self.collaborators
  }

  pub fn feed(&self) -> &Collection<FeedEvent> {
    &self.feed
  }

  pub fn len(&self, kind: ResourceKind) -> usize {
    match kind {
      ResourceKind::Issues => self.issues.len(),
      ResourceKind::Labels => self.labels.len(),
      ResourceKind::Milestones => self.milestones.len(),
      ResourceKind::Collaborators => self.collaborators.len(),
      ResourceKind::Feed => self.feed.len(),
    }
  }

  // ==========================================================================
  // Batch mutations
  // ==========================================================================

  /// Clear and refill a collection, notifying subscribers once.
  pub fn replace_all<E: Stored>(&mut self, entities: Vec<E>) -> Change {
    let change = E::collection_mut(self).replace_all(entities);
    self.commit(change);
    change
  }

  /// Apply a reconciliation result as one batch, notifying subscribers once.
  ///
  /// An empty change set commits nothing and notifies nobody.
  pub fn apply_change_set<E: Stored>(&mut self, changes: ChangeSet<E>) -> Change {
    let change = E::collection_mut(self).apply(changes);
    self.commit(change);
    change
  }

  /// Insert a single entity at the front of its collection.
  pub fn insert_front<E: Stored>(&mut self, entity: E) -> Change {
    let change = E::collection_mut(self).insert_front(entity);
    self.commit(change);
    change
  }

  /// Append a single entity at the back of its collection.
  pub fn push<E: Stored>(&mut self, entity: E) -> Change {
    let change = E::collection_mut(self).push(entity);
    self.commit(change);
    change
  }

  pub fn remove<E: Stored>(&mut self, key: &E::Key) -> Change {
    let change = E::collection_mut(self).remove(key);
    self.commit(change);
    change
  }

  pub fn get<E: Stored>(&self, key: &E::Key) -> Option<Shared<E>> {
    E::collection(self).get(key)
  }

  fn commit(&mut self, change: Change) {
    if change.is_empty() {
      return;
    }
    info!(
      kind = %change.kind,
      added = change.added,
      updated = change.updated,
      removed = change.removed,
      replaced = change.replaced,
      "Committed batch"
    );
    self.notify(&change);
  }

  // ==========================================================================
  // Change notification
  // ==========================================================================

  /// Register a callback for batches committed to one collection.
  pub fn on_change(
    &mut self,
    kind: ResourceKind,
    callback: impl FnMut(&Change) + 'static,
  ) -> SubscriptionId {
    self.subscribe(Some(kind), Box::new(callback))
  }

  /// Register a callback for batches committed to any collection.
  pub fn on_any_change(&mut self, callback: impl FnMut(&Change) + 'static) -> SubscriptionId {
    self.subscribe(None, Box::new(callback))
  }

  fn subscribe(&mut self, kind: Option<ResourceKind>, callback: Listener) -> SubscriptionId {
    let id = SubscriptionId(self.next_subscription);
    self.next_subscription += 1;
    self.subscriptions.push(Subscription { id, kind, callback });
    id
  }

  pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
    let before = self.subscriptions.len();
    self.subscriptions.retain(|s| s.id != id);
    before != self.subscriptions.len()
  }

  pub fn unsubscribe_all(&mut self) {
    debug!(count = self.subscriptions.len(), "Dropping all store subscriptions");
    self.subscriptions.clear();
  }

  /// Invoke matching callbacks in registration order.
  fn notify(&mut self, change: &Change) {
    for sub in &mut self.subscriptions {
      if sub.kind.is_none() || sub.kind == Some(change.kind) {
        (sub.callback)(change);
      }
    }
  }

  /// Re-deliver a whole-collection notification for every kind.
  pub fn renotify_all(&mut self) {
    for kind in ResourceKind::ALL {
      let mut change = Change::new(kind);
      change.replaced = true;
      self.notify(&change);
    }
  }

  // ==========================================================================
  // Cache metadata
  // ==========================================================================

  pub fn cache_meta(&self, kind: ResourceKind) -> CacheMeta {
    self.meta.get(kind)
  }

  pub fn update_cache_meta(&mut self, kind: ResourceKind, token: Option<String>) {
    self.meta.set_token(kind, token);
  }

  pub fn update_last_checked(&mut self, kind: ResourceKind, at: DateTime<Utc>) {
    self.meta.set_last_checked(kind, at);
  }

  pub fn restore_metadata(&mut self, meta: CacheMetadata) {
    self.meta = meta;
  }

  // ==========================================================================
  // Lookups
  // ==========================================================================

  /// Issue with the given number. Non-positive numbers never match.
  pub fn issue(&self, id: u64) -> Option<Shared<Issue>> {
    if id == 0 {
      return None;
    }
    self.issues.get(&id)
  }

  pub fn index_of_issue(&self, id: u64) -> Option<usize> {
    self.issues.position(&id)
  }

  pub fn label(&self, name: &str) -> Option<Shared<Label>> {
    self.labels.get(&name.to_string())
  }

  pub fn milestone(&self, title: &str) -> Option<Shared<Milestone>> {
    self.milestones.get(&title.to_string())
  }

  pub fn collaborator(&self, login: &str) -> Option<Shared<User>> {
    self
      .collaborators
      .items()
      .iter()
      .find(|u| u.borrow().login == login)
      .cloned()
  }

  /// True when every label of `group` is exclusive (vacuously true for an unknown group).
  pub fn is_exclusive_label_group(&self, group: &str) -> bool {
    self
      .labels
      .items()
      .iter()
      .filter(|l| l.borrow().group() == Some(group))
      .all(|l| l.borrow().is_exclusive())
  }

  // ==========================================================================
  // Comment cache
  // ==========================================================================

  pub fn cache_comments(&mut self, issue_id: u64, comments: Vec<Comment>) {
    self.comments.insert(issue_id, comments);
  }

  pub fn comments_for(&self, issue_id: u64) -> Option<&[Comment]> {
    self.comments.get(&issue_id).map(Vec::as_slice)
  }

  pub fn clear_comments(&mut self) {
    self.comments.clear();
  }

  // ==========================================================================
  // Persistence
  // ==========================================================================

  /// Owned copy of everything that gets persisted.
  pub fn snapshot(&self) -> Snapshot {
    Snapshot {
      meta: self.meta.clone(),
      issues: self.issues.values(),
      labels: self.labels.values(),
      milestones: self.milestones.values(),
      collaborators: self.collaborators.values(),
    }
  }
}
