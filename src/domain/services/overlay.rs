//! Optimistic Overlay Service
//!
//! Computes the view a caller sees: remote-confirmed records with every
//! still-queued mutation applied on top. Recomputed on demand from
//! `(base, pending)` rather than maintained incrementally.

use crate::domain::entities::{ActionKind, QueuedAction};
use crate::domain::value_objects::{merge_records, record_id, Record, ID_FIELD};
use serde_json::Value;

/// Overlay service.
pub struct OptimisticOverlay;

impl OptimisticOverlay {
    /// Apply pending actions to `base` in queue order.
    ///
    /// - insert: prepend a placeholder; it carries the queued action id as its
    ///   identifier when the payload has none
    /// - upsert: merge into the matching record, or prepend like an insert
    /// - update: shallow-merge the patch into every record the selector matches
    /// - delete: drop every record the selector matches
    ///
    /// Inserts whose identity already exists in the view are merged instead of
    /// duplicated.
    pub fn apply(base: &[Record], pending: &[QueuedAction]) -> Vec<Record> {
        let mut view: Vec<Record> = base.to_vec();

        for action in pending {
            match action.kind {
                ActionKind::Insert | ActionKind::Upsert => {
                    let Some(payload) = &action.payload else {
                        continue;
                    };
                    let placeholder = Self::placeholder(action, payload);
                    let id = record_id(&placeholder);
                    match view.iter().position(|r| id.is_some() && record_id(r) == id) {
                        Some(idx) => view[idx] = merge_records(&view[idx], &placeholder),
                        None => view.insert(0, placeholder),
                    }
                }
                ActionKind::Update => {
                    let (Some(patch), Some(selector)) = (&action.payload, &action.selector) else {
                        continue;
                    };
                    for record in view.iter_mut().filter(|r| selector.matches(r)) {
                        *record = merge_records(record, patch);
                    }
                }
                ActionKind::Delete => {
                    let Some(selector) = &action.selector else {
                        continue;
                    };
                    view.retain(|r| !selector.matches(r));
                }
            }
        }

        view
    }

    /// Overlay for a single record identity.
    ///
    /// Returns None when the record is absent or deleted by a pending action.
    pub fn apply_one(base: Option<&Record>, id: &str, pending: &[QueuedAction]) -> Option<Record> {
        let base: Vec<Record> = base.cloned().into_iter().collect();
        Self::apply(&base, pending)
            .into_iter()
            .find(|r| record_id(r).as_deref() == Some(id))
    }

    fn placeholder(action: &QueuedAction, payload: &Record) -> Record {
        let mut record = payload.clone();
        if record_id(&record).is_none() {
            record.insert(ID_FIELD.to_string(), Value::String(action.id.clone()));
        }
        record
    }
}
