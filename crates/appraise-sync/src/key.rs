//! Typed cache key namespace.
//!
//! Every cache entry is addressed by a [`RecordKey`]. Bulk invalidation goes
//! through [`KeyFilter`] and [`RecordKey::matches`] instead of string prefix
//! checks; the string shapes only exist for display and logging.

use std::fmt;

use appraise_api::SearchParams;

/// The five key families the cache knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    /// The full record collection.
    List,
    /// A single record.
    Record,
    /// A parameterized search result set.
    Search,
    /// Aggregate counts over the collection.
    Stats,
    /// Approval history of a single record.
    History,
}

/// Address of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// `record-list` — the entire collection, server-defined order.
    List,
    /// `record:<id>` — a single record.
    Record(i64),
    /// `record-search:<canonical params>` — a search result set. The params
    /// live inside the key, so refetching a search needs no side table.
    Search(SearchParams),
    /// `record-stats` — aggregate counts.
    Stats,
    /// `approval-history:<id>` — approval events of one record.
    History(i64),
}

impl RecordKey {
    /// The family this key belongs to.
    pub fn family(&self) -> KeyFamily {
        match self {
            RecordKey::List => KeyFamily::List,
            RecordKey::Record(_) => KeyFamily::Record,
            RecordKey::Search(_) => KeyFamily::Search,
            RecordKey::Stats => KeyFamily::Stats,
            RecordKey::History(_) => KeyFamily::History,
        }
    }

    /// The record id this key is scoped to, if any.
    pub fn record_id(&self) -> Option<i64> {
        match self {
            RecordKey::Record(id) | RecordKey::History(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether this key matches a filter.
    pub fn matches(&self, filter: &KeyFilter) -> bool {
        match filter {
            KeyFilter::Any => true,
            KeyFilter::Family(family) => self.family() == *family,
            KeyFilter::Exact(key) => self == key,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::List => write!(f, "record-list"),
            RecordKey::Record(id) => write!(f, "record:{}", id),
            RecordKey::Search(params) => write!(f, "record-search:{}", params.canonical_query()),
            RecordKey::Stats => write!(f, "record-stats"),
            RecordKey::History(id) => write!(f, "approval-history:{}", id),
        }
    }
}

/// Predicate for selecting a set of keys, e.g. for bulk invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// Exactly one key.
    Exact(RecordKey),
    /// Every key of a family (e.g. all cached searches).
    Family(KeyFamily),
    /// Every key.
    Any,
}
