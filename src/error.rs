//! Error taxonomy for the fetch and write boundaries.

use std::time::Duration;
use thiserror::Error;

use crate::model::ResourceKind;

/// Failure of a remote fetch. Always caught at the coordinator boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("Network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("Timed out after {0:?}")]
  Timeout(Duration),

  #[error("Remote returned {status}: {message}")]
  Remote { status: u16, message: String },

  #[error("Malformed {kind} snapshot: {reason}")]
  Malformed { kind: ResourceKind, reason: String },

  /// The fetch worker stopped before producing a result
  #[error("Sync interrupted: {0}")]
  Interrupted(String),
}

impl FetchError {
  /// Whether this is a connectivity problem rather than a remote-side error.
  pub fn is_network(&self) -> bool {
    matches!(self, Self::NetworkUnavailable(_) | Self::Timeout(_))
  }

  /// Title and body of the warning shown to the user.
  pub fn user_message(&self) -> (&'static str, String) {
    match self {
      Self::NetworkUnavailable(_) => (
        "No Internet Connection",
        "Please check your internet connection and try again".to_string(),
      ),
      Self::Timeout(_) => (
        "Internet Connection is down",
        "Timeout while loading items from GitHub. Please check your internet connection."
          .to_string(),
      ),
      Self::Remote { status, message } => (
        "GitHub error",
        format!("GitHub returned {}: {}", status, message),
      ),
      Self::Malformed { kind, .. } => (
        "Unexpected response",
        format!("GitHub returned an unreadable {} list", kind),
      ),
      Self::Interrupted(_) => (
        "Sync interrupted",
        "Loading items from GitHub stopped unexpectedly and will be retried".to_string(),
      ),
    }
  }
}

/// Failure of a remote write (corrective label update, label creation).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
  /// The credential has no write access to the repository
  #[error("Permission denied: {0}")]
  PermissionDenied(String),

  #[error("Write failed: {0}")]
  Other(String),
}

impl WriteError {
  pub fn is_permission_denied(&self) -> bool {
    matches!(self, Self::PermissionDenied(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_network_classification() {
    assert!(FetchError::NetworkUnavailable("dns".into()).is_network());
    assert!(FetchError::Timeout(Duration::from_secs(30)).is_network());
    assert!(!FetchError::Remote {
      status: 500,
      message: "boom".into()
    }
    .is_network());
  }

  #[test]
  fn test_user_messages() {
    let (title, body) = FetchError::Timeout(Duration::from_secs(1)).user_message();
    assert_eq!(title, "Internet Connection is down");
    assert!(body.contains("Timeout"));

    let (_, body) = FetchError::Remote {
      status: 502,
      message: "bad gateway".into(),
    }
    .user_message();
    assert!(body.contains("502"));
  }

  #[test]
  fn test_permission_denied() {
    assert!(WriteError::PermissionDenied("404".into()).is_permission_denied());
    assert!(!WriteError::Other("500".into()).is_permission_denied());
  }
}
