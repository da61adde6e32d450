//! Field-level comparison of bug records across snapshots.
//!
//! Everything here is a pure function of its inputs. A field missing from one
//! side is reported as added or removed, never as a change from an empty
//! value, so "did not exist yet" stays distinct from "was cleared".

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::scheduler::history::{ChangeCounts, ExecutionId};
use crate::storage::snapshots::{FieldObservation, Snapshot};
use crate::tracker::{BugId, BugRecord, FieldValue};

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("cannot diff bug {left} against bug {right}")]
    BugMismatch { left: BugId, right: BugId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum FieldChange {
    Added { new: FieldValue },
    Removed { old: FieldValue },
    Changed { old: FieldValue, new: FieldValue },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDelta {
    pub field: String,
    #[serde(flatten)]
    pub change: FieldChange,
}

/// One step in a field's history, between two consecutive snapshots that
/// contain the bug.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldHistoryEntry {
    pub bug_id: BugId,
    pub field: String,
    #[serde(flatten)]
    pub change: FieldChange,
    pub from_time: DateTime<Utc>,
    pub to_time: DateTime<Utc>,
    pub from_execution: ExecutionId,
    pub to_execution: ExecutionId,
}

fn compare(old: Option<&FieldValue>, new: Option<&FieldValue>) -> Option<FieldChange> {
    match (old, new) {
        (None, None) => None,
        (None, Some(n)) => Some(FieldChange::Added { new: n.clone() }),
        (Some(o), None) => Some(FieldChange::Removed { old: o.clone() }),
        (Some(o), Some(n)) if o == n => None,
        (Some(o), Some(n)) => Some(FieldChange::Changed { old: o.clone(), new: n.clone() }),
    }
}

/// Changed fields between two records of the same bug, by field name.
pub fn diff_records(old: &BugRecord, new: &BugRecord) -> Result<Vec<FieldDelta>, DiffError> {
    if old.bug_id != new.bug_id {
        return Err(DiffError::BugMismatch { left: old.bug_id, right: new.bug_id });
    }

    let names: BTreeSet<&String> = old.fields.keys().chain(new.fields.keys()).collect();
    Ok(names
        .into_iter()
        .filter_map(|name| {
            compare(old.fields.get(name), new.fields.get(name))
                .map(|change| FieldDelta { field: name.clone(), change })
        })
        .collect())
}

/// Reconstruct the change history of one field from time-ordered observations.
pub fn field_history(bug_id: BugId, field: &str, observations: &[FieldObservation]) -> Vec<FieldHistoryEntry> {
    observations
        .windows(2)
        .filter_map(|pair| {
            let (prev, next) = (&pair[0], &pair[1]);
            compare(prev.value.as_ref(), next.value.as_ref()).map(|change| FieldHistoryEntry {
                bug_id,
                field: field.to_string(),
                change,
                from_time: prev.captured_at,
                to_time: next.captured_at,
                from_execution: prev.execution_id,
                to_execution: next.execution_id,
            })
        })
        .collect()
}

/// Bug-level summary of what moved between two snapshots of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotDiff {
    pub appeared: Vec<BugId>,
    pub disappeared: Vec<BugId>,
    pub changed: BTreeMap<BugId, Vec<FieldDelta>>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.disappeared.is_empty() && self.changed.is_empty()
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.appeared.len(),
            removed: self.disappeared.len(),
            changed: self.changed.len(),
        }
    }
}

pub fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> SnapshotDiff {
    let before: BTreeMap<BugId, &BugRecord> = old.records.iter().map(|r| (r.bug_id, r)).collect();
    let after: BTreeMap<BugId, &BugRecord> = new.records.iter().map(|r| (r.bug_id, r)).collect();

    let mut diff = SnapshotDiff::default();
    for (id, record) in &after {
        match before.get(id) {
            None => diff.appeared.push(*id),
            Some(prev) => {
                // Same key on both sides, so ids always match.
                if let Ok(deltas) = diff_records(prev, record) {
                    if !deltas.is_empty() {
                        diff.changed.insert(*id, deltas);
                    }
                }
            }
        }
    }
    diff.disappeared = before.keys().filter(|id| !after.contains_key(id)).copied().collect();
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn obs(at: DateTime<Utc>, value: Option<&str>) -> FieldObservation {
        FieldObservation {
            execution_id: Uuid::new_v4(),
            query_id: 1,
            captured_at: at,
            value: value.map(FieldValue::from),
        }
    }

    #[test]
    fn test_changed_field_reports_old_and_new() {
        let old = BugRecord::new(101).with_field("status", "NEW").with_field("priority", "P2");
        let new = BugRecord::new(101).with_field("status", "RESOLVED").with_field("priority", "P2");

        let deltas = diff_records(&old, &new).unwrap();
        assert_eq!(
            deltas,
            vec![FieldDelta {
                field: "status".into(),
                change: FieldChange::Changed { old: "NEW".into(), new: "RESOLVED".into() },
            }]
        );
    }

    #[test]
    fn test_added_and_removed_are_not_changes() {
        let old = BugRecord::new(5).with_field("whiteboard", "[perf]");
        let new = BugRecord::new(5).with_field("severity", "S2");

        let deltas = diff_records(&old, &new).unwrap();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].field, "severity");
        assert_eq!(deltas[0].change, FieldChange::Added { new: "S2".into() });
        assert_eq!(deltas[1].change, FieldChange::Removed { old: "[perf]".into() });
    }

    #[test]
    fn test_cleared_field_is_a_change_to_unset() {
        let old = BugRecord::new(5).with_field("assignee", "dev@example.org");
        let new = BugRecord::new(5).with_field("assignee", FieldValue::Unset);
        let deltas = diff_records(&old, &new).unwrap();
        assert_eq!(
            deltas[0].change,
            FieldChange::Changed { old: "dev@example.org".into(), new: FieldValue::Unset }
        );
    }

    #[test]
    fn test_mismatched_bugs_rejected() {
        assert!(diff_records(&BugRecord::new(1), &BugRecord::new(2)).is_err());
    }

    #[test]
    fn test_field_history_steps() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::hours(1);
        let t2 = t0 + Duration::hours(2);
        let t3 = t0 + Duration::hours(3);
        let observations = vec![
            obs(t0, Some("NEW")),
            obs(t1, Some("NEW")),
            obs(t2, Some("RESOLVED")),
            obs(t3, None),
        ];

        let history = field_history(101, "status", &observations);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_time, t1);
        assert_eq!(history[0].to_time, t2);
        assert_eq!(
            history[0].change,
            FieldChange::Changed { old: "NEW".into(), new: "RESOLVED".into() }
        );
        assert_eq!(history[1].change, FieldChange::Removed { old: "RESOLVED".into() });
    }

    #[test]
    fn test_field_appearing_later_is_added() {
        let t0 = Utc::now();
        let history = field_history(9, "severity", &[obs(t0, None), obs(t0 + Duration::hours(1), Some("S1"))]);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].change, FieldChange::Added { new: "S1".into() });
    }

    #[test]
    fn test_single_or_no_observation_has_no_history() {
        assert!(field_history(1, "status", &[]).is_empty());
        assert!(field_history(1, "status", &[obs(Utc::now(), Some("NEW"))]).is_empty());
    }

    #[test]
    fn test_snapshot_diff_summary() {
        let t0 = Utc::now();
        let old = Snapshot::new(
            Uuid::new_v4(),
            1,
            t0,
            true,
            vec![
                BugRecord::new(1).with_field("status", "NEW"),
                BugRecord::new(2).with_field("status", "OPEN"),
            ],
        );
        let new = Snapshot::new(
            Uuid::new_v4(),
            1,
            t0 + Duration::hours(1),
            true,
            vec![
                BugRecord::new(2).with_field("status", "CLOSED"),
                BugRecord::new(3).with_field("status", "NEW"),
            ],
        );

        let diff = diff_snapshots(&old, &new);
        assert_eq!(diff.appeared, vec![3]);
        assert_eq!(diff.disappeared, vec![1]);
        assert_eq!(diff.changed.len(), 1);
        assert!(diff.changed.contains_key(&2));
        assert_eq!(diff.counts(), ChangeCounts { added: 1, removed: 1, changed: 1 });
        assert!(diff_snapshots(&new, &new).is_empty());
    }
}
