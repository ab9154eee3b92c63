//! Conflict Resolver Service
//!
//! Pure resolution strategies over a (local, remote) pair. Deterministic:
//! no clocks, no randomness, no state.

use crate::domain::value_objects::{
    merge_records, record_timestamp, FieldRule, Record, ResolutionStrategy, ID_FIELD,
};
use std::collections::BTreeSet;

/// Record chosen by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Commit this record to the remote
    Keep(Record),
    /// The record stays deleted
    Delete,
}

/// Conflict resolver service.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Apply `strategy` to a pair of snapshots.
    ///
    /// A missing remote means the record was deleted remotely. Strategies
    /// that would adopt the remote snapshot then resolve to `Delete`.
    pub fn resolve(
        strategy: &ResolutionStrategy,
        local: &Record,
        remote: Option<&Record>,
        conflicting_fields: &[String],
        timestamp_field: &str,
    ) -> Resolution {
        match strategy {
            ResolutionStrategy::LocalWins => Resolution::Keep(local.clone()),
            ResolutionStrategy::RemoteWins => match remote {
                Some(r) => Resolution::Keep(r.clone()),
                None => Resolution::Delete,
            },
            ResolutionStrategy::TimestampWins => match remote {
                Some(r) if Self::local_is_newer(local, r, timestamp_field) => {
                    Resolution::Keep(local.clone())
                }
                Some(r) => Resolution::Keep(r.clone()),
                None => Resolution::Keep(local.clone()),
            },
            ResolutionStrategy::Merge => match remote {
                Some(r) => Resolution::Keep(merge_records(r, local)),
                None => Resolution::Keep(local.clone()),
            },
            ResolutionStrategy::FieldLevel(rules) => {
                let empty = Record::new();
                let remote_rec = remote.unwrap_or(&empty);
                let local_newer = Self::local_is_newer(local, remote_rec, timestamp_field);

                let names: BTreeSet<&String> = local.keys().chain(remote_rec.keys()).collect();
                let mut out = Record::new();
                for name in names {
                    let take_local = match rules.get(name.as_str()).copied() {
                        Some(FieldRule::ClientWins) => true,
                        Some(FieldRule::Latest) => local_newer,
                        Some(FieldRule::ServerWins) | None => false,
                    };
                    let source = if take_local { local } else { remote_rec };
                    if let Some(v) = source.get(name) {
                        out.insert(name.clone(), v.clone());
                    }
                }

                if remote.is_none() && out.keys().all(|k| k == ID_FIELD) {
                    return Resolution::Delete;
                }
                if let Some(id) = local.get(ID_FIELD) {
                    out.entry(ID_FIELD.to_string()).or_insert_with(|| id.clone());
                }
                Resolution::Keep(out)
            }
            ResolutionStrategy::Custom(f) => Resolution::Keep(f(local, remote, conflicting_fields)),
        }
    }

    /// Local wins only when strictly newer; ties and missing local timestamps go to the remote.
    fn local_is_newer(local: &Record, remote: &Record, field: &str) -> bool {
        match (record_timestamp(local, field), record_timestamp(remote, field)) {
            (Some(l), Some(r)) => l > r,
            (Some(_), None) => true,
            _ => false,
        }
    }
}
