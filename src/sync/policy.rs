use serde::Deserialize;

use crate::model::IssueState;

/// Color given to open status labels created remotely
pub const OPEN_STATUS_COLOR: &str = "009800";
/// Color given to closed status labels created remotely
pub const CLOSED_STATUS_COLOR: &str = "0052cc";

/// Recognized status labels of a project, loaded once per session.
///
/// Label names are matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusLabelPolicy {
  #[serde(default = "default_open")]
  pub open: Vec<String>,
  #[serde(default = "default_closed")]
  pub closed: Vec<String>,
  /// Substrings marking labels that a new issue never inherits from another
  #[serde(default = "default_non_inherited")]
  pub non_inherited: Vec<String>,
}

fn default_open() -> Vec<String> {
  vec!["status.open".to_string()]
}

fn default_closed() -> Vec<String> {
  vec!["status.closed".to_string()]
}

fn default_non_inherited() -> Vec<String> {
  vec!["status.".to_string()]
}

impl Default for StatusLabelPolicy {
  fn default() -> Self {
    Self {
      open: default_open(),
      closed: default_closed(),
      non_inherited: default_non_inherited(),
    }
  }
}

impl StatusLabelPolicy {
  pub fn is_open_status(&self, label: &str) -> bool {
    self.open.iter().any(|l| l.eq_ignore_ascii_case(label))
  }

  pub fn is_closed_status(&self, label: &str) -> bool {
    self.closed.iter().any(|l| l.eq_ignore_ascii_case(label))
  }

  pub fn is_status_label(&self, label: &str) -> bool {
    self.is_open_status(label) || self.is_closed_status(label)
  }

  /// All status label names, open ones first.
  pub fn status_labels(&self) -> impl Iterator<Item = &str> {
    self.open.iter().chain(self.closed.iter()).map(String::as_str)
  }

  /// A status label contradicts the issue's state.
  pub fn is_inconsistent(&self, state: IssueState, label: &str) -> bool {
    match state {
      IssueState::Closed => self.is_open_status(label),
      IssueState::Open => self.is_closed_status(label),
    }
  }

  pub fn is_non_inherited(&self, label: &str) -> bool {
    self
      .non_inherited
      .iter()
      .any(|prefix| label.contains(prefix.as_str()))
  }

  /// Labels a new issue drafted from another may carry over. Status labels never are.
  pub fn inheritable_labels<'a>(&self, labels: &'a [String]) -> Vec<&'a str> {
    labels
      .iter()
      .map(String::as_str)
      .filter(|l| !self.is_non_inherited(l) && !self.is_status_label(l))
      .collect()
  }

  /// Color used when creating a missing status label.
  pub fn color_for(&self, label: &str) -> &'static str {
    if self.is_open_status(label) {
      OPEN_STATUS_COLOR
    } else {
      CLOSED_STATUS_COLOR
    }
  }
}
