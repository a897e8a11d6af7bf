//! Domain types mirrored from the remote issue tracker.

mod entity;
mod types;

pub use entity::{Entity, ResourceKind};
pub use types::{
  Comment, FeedEvent, Issue, IssueState, Label, Milestone, ProjectRef, User,
};
