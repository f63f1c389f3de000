//! Push update decoding and cache splice application.
//!
//! Every inbound change notification — decoded from the wire or constructed
//! by hand — goes through [`apply_push_update`], so tests and non-push
//! fallback triggers exercise the identical path as real messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use appraise_api::EvaluationRecord;

use crate::error::ChannelError;
use crate::key::{KeyFilter, RecordKey};
use crate::store::{CacheValue, EntityStore};

/// A change notification pushed by the server.
///
/// Each kind carries the full record payload and the server timestamp of the
/// change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PushUpdate {
    Created {
        record: EvaluationRecord,
        timestamp: DateTime<Utc>,
    },
    Updated {
        record: EvaluationRecord,
        timestamp: DateTime<Utc>,
    },
    Deleted {
        record: EvaluationRecord,
        timestamp: DateTime<Utc>,
    },
    ApprovalAdded {
        record: EvaluationRecord,
        timestamp: DateTime<Utc>,
    },
}

impl PushUpdate {
    /// The record payload.
    pub fn record(&self) -> &EvaluationRecord {
        match self {
            PushUpdate::Created { record, .. }
            | PushUpdate::Updated { record, .. }
            | PushUpdate::Deleted { record, .. }
            | PushUpdate::ApprovalAdded { record, .. } => record,
        }
    }

    /// Server timestamp of the change.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PushUpdate::Created { timestamp, .. }
            | PushUpdate::Updated { timestamp, .. }
            | PushUpdate::Deleted { timestamp, .. }
            | PushUpdate::ApprovalAdded { timestamp, .. } => *timestamp,
        }
    }
}

/// Decode a raw push payload.
pub fn decode_push_message(payload: &str) -> Result<PushUpdate, ChannelError> {
    Ok(serde_json::from_str(payload)?)
}

/// Apply one push update to the store.
///
/// Created/updated records are spliced silently (the payload is authoritative
/// enough for display); the derived views they affect are marked stale so
/// their next read refetches.
pub fn apply_push_update(store: &EntityStore, update: &PushUpdate) {
    match update {
        PushUpdate::Created { record, .. } | PushUpdate::Updated { record, .. } => {
            splice_record(store, record);
            store.invalidate(&KeyFilter::Exact(RecordKey::Stats));
            trace!(id = record.id, kind = "upsert", "push update applied");
        }
        PushUpdate::Deleted { record, .. } => {
            let id = record.id;
            store.set_data(
                &RecordKey::List,
                move |current| {
                    current.map(|value| match value {
                        CacheValue::List(mut list) => {
                            list.retain(|r| r.id != id);
                            CacheValue::List(list)
                        }
                        other => other,
                    })
                },
                false,
            );
            store.clear(&RecordKey::Record(id));
            store.invalidate(&KeyFilter::Exact(RecordKey::Stats));
            trace!(id, kind = "delete", "push update applied");
        }
        PushUpdate::ApprovalAdded { record, .. } => {
            set_single(store, record);
            update_list_entry(store, record);
            store.invalidate(&KeyFilter::Exact(RecordKey::History(record.id)));
            store.invalidate(&KeyFilter::Exact(RecordKey::Stats));
            trace!(id = record.id, kind = "approval", "push update applied");
        }
    }
}

/// Silently splice a record into `record:<id>` and into the list by
/// id-match-or-append, preserving existing order.
pub(crate) fn splice_record(store: &EntityStore, record: &EvaluationRecord) {
    set_single(store, record);

    let incoming = record.clone();
    store.set_data(
        &RecordKey::List,
        move |current| {
            current.map(|value| match value {
                CacheValue::List(mut list) => {
                    match list.iter_mut().find(|r| r.id == incoming.id) {
                        Some(slot) => *slot = incoming,
                        None => list.push(incoming),
                    }
                    CacheValue::List(list)
                }
                other => other,
            })
        },
        false,
    );
}

/// Silently replace the single-record entry.
pub(crate) fn set_single(store: &EntityStore, record: &EvaluationRecord) {
    let incoming = record.clone();
    store.set_data(
        &RecordKey::Record(record.id),
        move |_| Some(CacheValue::Record(incoming)),
        false,
    );
}

/// Silently replace the matching list element, if present. Never appends.
pub(crate) fn update_list_entry(store: &EntityStore, record: &EvaluationRecord) {
    let incoming = record.clone();
    store.set_data(
        &RecordKey::List,
        move |current| {
            current.map(|value| match value {
                CacheValue::List(mut list) => {
                    if let Some(slot) = list.iter_mut().find(|r| r.id == incoming.id) {
                        *slot = incoming;
                    }
                    CacheValue::List(list)
                }
                other => other,
            })
        },
        false,
    );
}
