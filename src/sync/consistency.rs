//! Repair of issues whose status labels contradict their open/closed state.
//!
//! The local repair is unconditional. Pushing the fix upstream is best-effort:
//! a permission-denied answer stops the rest of the batch, any other failure is
//! logged and the next write is still attempted.

use tracing::{debug, warn};

use super::policy::StatusLabelPolicy;
use super::remote::RemoteWriter;
use crate::model::{Issue, Label, ProjectRef};

/// Request to set an issue's label set to its repaired value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectiveWrite {
  pub issue_id: u64,
  pub labels: Vec<String>,
}

/// Outcome of pushing a batch of corrective writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrectionReport {
  pub attempted: usize,
  pub applied: usize,
  pub failed: usize,
  /// The batch was cut short by a permission-denied answer
  pub denied: bool,
}

/// Drop contradicting status labels from every issue and collect one corrective
/// write per issue that had any.
pub fn repair(issues: &mut [Issue], policy: &StatusLabelPolicy) -> Vec<CorrectiveWrite> {
  let mut writes = Vec::new();

  for issue in issues.iter_mut() {
    let state = issue.state;
    let before = issue.labels.len();
    issue
      .labels
      .retain(|label| !policy.is_inconsistent(state, label));

    if issue.labels.len() != before {
      debug!(
        issue = issue.id,
        removed = before - issue.labels.len(),
        "Removed status labels contradicting issue state"
      );
      writes.push(CorrectiveWrite {
        issue_id: issue.id,
        labels: issue.labels.clone(),
      });
    }
  }

  writes
}

/// Send corrective writes in order until done or permission is denied.
pub async fn push_corrections<W: RemoteWriter>(
  writer: &W,
  project: &ProjectRef,
  writes: Vec<CorrectiveWrite>,
) -> CorrectionReport {
  let mut report = CorrectionReport::default();

  for write in writes {
    report.attempted += 1;
    match writer
      .set_labels(project, write.issue_id, &write.labels)
      .await
    {
      Ok(()) => report.applied += 1,
      Err(e) if e.is_permission_denied() => {
        warn!(
          project = %project,
          issue = write.issue_id,
          "No permission to update labels, skipping remaining corrections: {}",
          e
        );
        report.failed += 1;
        report.denied = true;
        break;
      }
      Err(e) => {
        warn!(
          project = %project,
          issue = write.issue_id,
          "Failed to push corrected labels: {}",
          e
        );
        report.failed += 1;
      }
    }
  }

  report
}

/// Create every policy status label the repository lacks and append the created
/// labels to `labels`. Returns how many were created.
pub async fn ensure_status_labels<W: RemoteWriter>(
  writer: &W,
  project: &ProjectRef,
  labels: &mut Vec<Label>,
  policy: &StatusLabelPolicy,
) -> usize {
  let missing: Vec<String> = policy
    .status_labels()
    .filter(|status| !status.trim().is_empty())
    .filter(|status| !labels.iter().any(|l| l.name.eq_ignore_ascii_case(status)))
    .map(String::from)
    .collect();

  let mut created = 0;
  for name in missing {
    let label = Label::new(name.as_str(), policy.color_for(&name));
    match writer.create_label(project, &label).await {
      Ok(label) => {
        labels.push(label);
        created += 1;
      }
      Err(e) if e.is_permission_denied() => {
        warn!(project = %project, "No repository permissions to create label: {}", e);
        break;
      }
      Err(e) => {
        warn!(project = %project, label = %name, "Failed to create status label: {}", e);
      }
    }
  }

  created
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::WriteError;
  use crate::model::IssueState;
  use crate::sync::testing::{issue, RecordingWriter};

  fn project() -> ProjectRef {
    ProjectRef::new("octo", "hello")
  }

  #[test]
  fn test_repair_closed_issue_with_open_label() {
    let policy = StatusLabelPolicy::default();
    let mut issues = vec![issue(1, IssueState::Closed, &["status.open", "bug"])];

    let writes = repair(&mut issues, &policy);

    assert_eq!(issues[0].labels, vec!["bug"]);
    assert_eq!(
      writes,
      vec![CorrectiveWrite {
        issue_id: 1,
        labels: vec!["bug".to_string()],
      }]
    );
  }

  #[test]
  fn test_repair_open_issue_with_closed_label() {
    let policy = StatusLabelPolicy::default();
    let mut issues = vec![
      issue(1, IssueState::Open, &["status.closed"]),
      issue(2, IssueState::Open, &["status.open"]),
    ];

    let writes = repair(&mut issues, &policy);

    assert!(issues[0].labels.is_empty());
    assert_eq!(issues[1].labels, vec!["status.open"]);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].issue_id, 1);
  }

  #[test]
  fn test_consistent_issues_produce_no_writes() {
    let policy = StatusLabelPolicy::default();
    let mut issues = vec![
      issue(1, IssueState::Closed, &["status.closed", "bug"]),
      issue(2, IssueState::Open, &[]),
    ];

    assert!(repair(&mut issues, &policy).is_empty());
  }

  #[tokio::test]
  async fn test_permission_denied_stops_batch() {
    let policy = StatusLabelPolicy::default();
    let mut issues = vec![
      issue(1, IssueState::Closed, &["status.open"]),
      issue(2, IssueState::Closed, &["status.open", "bug"]),
      issue(3, IssueState::Open, &["status.closed"]),
    ];
    let writer = RecordingWriter::default();
    writer.fail_next(WriteError::PermissionDenied("404".into()));

    let writes = repair(&mut issues, &policy);
    let report = push_corrections(&writer, &project(), writes).await;

    assert_eq!(report.attempted, 1);
    assert!(report.denied);
    assert_eq!(writer.label_writes().len(), 1);
    assert!(issues.iter().all(|i| !i
      .labels
      .iter()
      .any(|l| policy.is_inconsistent(i.state, l))));
  }

  #[tokio::test]
  async fn test_other_failures_continue() {
    let policy = StatusLabelPolicy::default();
    let mut issues = vec![
      issue(1, IssueState::Closed, &["status.open"]),
      issue(2, IssueState::Closed, &["status.open"]),
    ];
    let writer = RecordingWriter::default();
    writer.fail_next(WriteError::Other("502".into()));

    let writes = repair(&mut issues, &policy);
    let report = push_corrections(&writer, &project(), writes).await;

    assert_eq!(
      report,
      CorrectionReport {
        attempted: 2,
        applied: 1,
        failed: 1,
        denied: false,
      }
    );
    assert_eq!(writer.label_writes().len(), 2);
  }

  #[tokio::test]
  async fn test_ensure_status_labels_creates_missing() {
    let policy = StatusLabelPolicy::default();
    let writer = RecordingWriter::default();
    let mut labels = vec![Label::new("Status.Open", "009800"), Label::new("bug", "ee0701")];

    let created = ensure_status_labels(&writer, &project(), &mut labels, &policy).await;

    assert_eq!(created, 1);
    assert_eq!(labels.len(), 3);
    assert_eq!(labels[2].name, "status.closed");
    assert_eq!(labels[2].color, "0052cc");
  }

  #[tokio::test]
  async fn test_ensure_status_labels_stops_on_permission_denied() {
    let policy = StatusLabelPolicy {
      open: vec!["status.open".into(), "status.ready".into()],
      ..StatusLabelPolicy::default()
    };
    let writer = RecordingWriter::default();
    writer.fail_next(WriteError::PermissionDenied("403".into()));
    let mut labels = Vec::new();

    let created = ensure_status_labels(&writer, &project(), &mut labels, &policy).await;

    assert_eq!(created, 0);
    assert!(labels.is_empty());
    assert_eq!(writer.created_labels().len(), 1);
  }
}
