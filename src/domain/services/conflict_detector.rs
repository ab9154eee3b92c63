//! Conflict Detector Service
//!
//! Pure domain logic for diffing two snapshots of a record and classifying
//! the divergence. No I/O and no hidden state: the same inputs always give
//! the same answer.

use crate::domain::entities::{ConflictKind, ConflictPriority};
use crate::domain::value_objects::{record_timestamp, record_version, Record};
use std::collections::BTreeSet;
use std::time::Duration;

/// Rules driving detection and classification.
#[derive(Debug, Clone)]
pub struct DetectionRules {
    /// Fields never compared (bookkeeping timestamps by default)
    pub ignore_fields: Vec<String>,
    /// Field holding the wall-clock modification time
    pub timestamp_field: String,
    /// Field holding an explicit version counter; takes precedence over timestamps
    pub version_field: Option<String>,
    /// Modifications closer than this are treated as concurrent
    pub concurrency_window: Duration,
    /// Any conflicting field listed here raises priority to high
    pub critical_fields: Vec<String>,
    /// When every conflicting field is listed here the priority is low
    pub minor_fields: Vec<String>,
}

impl Default for DetectionRules {
    fn default() -> Self {
        Self {
            ignore_fields: vec![
                "created_at".to_string(),
                "updated_at".to_string(),
                "synced_at".to_string(),
            ],
            timestamp_field: "updated_at".to_string(),
            version_field: Some("version".to_string()),
            concurrency_window: Duration::from_secs(5),
            critical_fields: Vec::new(),
            minor_fields: Vec::new(),
        }
    }
}

/// Outcome of inspecting a (local, remote) pair that diverges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub kind: ConflictKind,
    pub fields: Vec<String>,
    pub priority: ConflictPriority,
}

/// Conflict detector service.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Fields whose values differ between the two snapshots.
    ///
    /// Considers the union of field names, skipping ignored fields. A field
    /// present on one side only counts as differing. Result is sorted.
    pub fn diff(local: &Record, remote: &Record, rules: &DetectionRules) -> Vec<String> {
        let names: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();

        names
            .into_iter()
            .filter(|name| !rules.ignore_fields.iter().any(|f| f == *name))
            .filter(|name| local.get(*name) != remote.get(*name))
            .cloned()
            .collect()
    }

    /// Classify a divergence.
    ///
    /// 1. Remote absent: delete conflict
    /// 2. Both timestamps present and closer than the window: concurrent modification
    /// 3. Both version counters present: version mismatch
    /// 4. Both timestamps present: timestamp conflict
    /// 5. Otherwise: field level
    pub fn classify(local: &Record, remote: Option<&Record>, rules: &DetectionRules) -> ConflictKind {
        let Some(remote) = remote else {
            return ConflictKind::DeleteConflict;
        };

        let local_ts = record_timestamp(local, &rules.timestamp_field);
        let remote_ts = record_timestamp(remote, &rules.timestamp_field);

        if let (Some(l), Some(r)) = (local_ts, remote_ts) {
            let delta = (l - r).num_milliseconds().unsigned_abs();
            if (delta as u128) < rules.concurrency_window.as_millis() {
                return ConflictKind::ConcurrentModification;
            }
        }

        if let Some(field) = &rules.version_field {
            if record_version(local, field).is_some() && record_version(remote, field).is_some() {
                return ConflictKind::VersionMismatch;
            }
        }

        if local_ts.is_some() && remote_ts.is_some() {
            ConflictKind::TimestampConflict
        } else {
            ConflictKind::FieldLevel
        }
    }

    /// Priority of a conflict touching `fields`.
    pub fn priority(fields: &[String], rules: &DetectionRules) -> ConflictPriority {
        if fields.iter().any(|f| rules.critical_fields.contains(f)) {
            ConflictPriority::High
        } else if !fields.is_empty() && fields.iter().all(|f| rules.minor_fields.contains(f)) {
            ConflictPriority::Low
        } else {
            ConflictPriority::Medium
        }
    }

    /// Inspect a pair of snapshots.
    ///
    /// Returns None when the monitored fields agree; an empty diff never
    /// yields a divergence. A missing remote is always a delete divergence.
    pub fn inspect(local: &Record, remote: Option<&Record>, rules: &DetectionRules) -> Option<Divergence> {
        let fields = match remote {
            Some(remote) => {
                let fields = Self::diff(local, remote, rules);
                if fields.is_empty() {
                    return None;
                }
                fields
            }
            None => local
                .keys()
                .filter(|k| !rules.ignore_fields.contains(*k))
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };

        Some(Divergence {
            kind: Self::classify(local, remote, rules),
            priority: Self::priority(&fields, rules),
            fields,
        })
    }
}
