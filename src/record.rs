//! Typed records stored in the quote keyspace.
//!
//! Every record lives under one logical keyspace and is addressed by a
//! composite key (partition + sort) with a `RecordKind` discriminator.
//! The kinds form a closed sum type rather than an untyped map-of-maps,
//! so every access path stays typed end to end.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const QUOTE_PREFIX: &str = "QUOTE#";
pub const TAG_PREFIX: &str = "TAG#";
pub const AUTHOR_PREFIX: &str = "AUTHOR#";
pub const COUNTER_PARTITION: &str = "METADATA#QUOTES";
pub const COUNTER_SORT: &str = "STATS";

/// Discriminator for the record kinds sharing the keyspace.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Quote,
    Tag,
    Author,
    TagMapping,
    Counter,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Quote => "quote",
            RecordKind::Tag => "tag",
            RecordKind::Author => "author",
            RecordKind::TagMapping => "tag_quote_mapping",
            RecordKind::Counter => "counter",
        }
    }
}

/// Composite key: partition identifier + sort identifier.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub partition: String,
    pub sort: String,
}

impl RecordKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        RecordKey {
            partition: partition.into(),
            sort: sort.into(),
        }
    }

    /// Key of a quote record: `QUOTE#{id}` / `QUOTE#{id}`.
    pub fn quote(id: &str) -> Self {
        let k = format!("{}{}", QUOTE_PREFIX, id);
        RecordKey::new(k.clone(), k)
    }

    /// Key of a tag record: `TAG#{name}` / `TAG#{name}`.
    pub fn tag(name: &str) -> Self {
        let k = format!("{}{}", TAG_PREFIX, name);
        RecordKey::new(k.clone(), k)
    }

    /// Key of an author record: `AUTHOR#{name}` / `AUTHOR#{name}`.
    pub fn author(name: &str) -> Self {
        let k = format!("{}{}", AUTHOR_PREFIX, name);
        RecordKey::new(k.clone(), k)
    }

    /// Key of a tag→quote mapping row: `TAG#{tag}` / `QUOTE#{quote_id}`.
    /// Sharing the tag's partition makes "all quotes for a tag" a single
    /// partition range.
    pub fn mapping(tag: &str, quote_id: &str) -> Self {
        RecordKey::new(
            format!("{}{}", TAG_PREFIX, tag),
            format!("{}{}", QUOTE_PREFIX, quote_id),
        )
    }

    /// Key of the global quote counter.
    pub fn counter() -> Self {
        RecordKey::new(COUNTER_PARTITION, COUNTER_SORT)
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition, self.sort)
    }
}

/// Canonical quote record. `id` is immutable and globally unique; the
/// normalized fields are pure projections of the canonical text and are
/// recomputed on every write.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct QuoteRecord {
    pub id: String,
    pub quote: String,
    pub author: String,
    pub tags: Vec<String>,
    pub author_normalized: String,
    pub quote_normalized: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: Option<String>,
}

/// Tag record with its denormalized usage counter. `quote_count` is
/// written only by the aggregator.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TagRecord {
    pub name: String,
    pub name_normalized: String,
    pub quote_count: i64,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

impl TagRecord {
    /// A fresh tag as the writer's ensure-step creates it: count 0.
    pub fn fresh(name: &str, created_by: &str, now: DateTime<Utc>) -> Self {
        TagRecord {
            name: name.to_string(),
            name_normalized: name.trim().to_lowercase(),
            quote_count: 0,
            last_used: now,
            created_at: now,
            updated_at: now,
            created_by: created_by.to_string(),
        }
    }
}

/// Aggregate record summarizing one author. Created and mutated only by
/// the aggregator.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct AuthorRecord {
    pub name: String,
    pub name_normalized: String,
    pub quote_count: i64,
    pub tags_used: BTreeSet<String>,
    pub first_quote_date: Option<DateTime<Utc>>,
    pub last_quote_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AuthorRecord {
    /// An empty aggregate, used as the create-if-absent initializer.
    pub fn empty(name: &str, name_normalized: &str, now: DateTime<Utc>) -> Self {
        AuthorRecord {
            name: name.to_string(),
            name_normalized: name_normalized.to_string(),
            quote_count: 0,
            tags_used: BTreeSet::new(),
            first_quote_date: None,
            last_quote_date: None,
            updated_at: now,
        }
    }
}

/// Secondary-index row linking a tag to one quote id.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TagMappingRecord {
    pub tag: String,
    pub quote_id: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// The single global quote counter, updated additively.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CounterRecord {
    pub total_quotes: i64,
    pub last_updated: DateTime<Utc>,
}

impl CounterRecord {
    pub fn zero(now: DateTime<Utc>) -> Self {
        CounterRecord {
            total_quotes: 0,
            last_updated: now,
        }
    }
}

/// One record of the keyspace: the tagged union behind every typed
/// access path.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Record {
    Quote(QuoteRecord),
    Tag(TagRecord),
    Author(AuthorRecord),
    TagMapping(TagMappingRecord),
    Counter(CounterRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Quote(_) => RecordKind::Quote,
            Record::Tag(_) => RecordKind::Tag,
            Record::Author(_) => RecordKind::Author,
            Record::TagMapping(_) => RecordKind::TagMapping,
            Record::Counter(_) => RecordKind::Counter,
        }
    }

    pub fn key(&self) -> RecordKey {
        match self {
            Record::Quote(q) => RecordKey::quote(&q.id),
            Record::Tag(t) => RecordKey::tag(&t.name),
            Record::Author(a) => RecordKey::author(&a.name),
            Record::TagMapping(m) => RecordKey::mapping(&m.tag, &m.quote_id),
            Record::Counter(_) => RecordKey::counter(),
        }
    }

    /// Recency timestamp used by the kind + recency access path.
    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Record::Quote(q) => q.updated_at,
            Record::Tag(t) => t.updated_at,
            Record::Author(a) => a.updated_at,
            Record::TagMapping(m) => m.created_at,
            Record::Counter(c) => c.last_updated,
        }
    }

    pub fn as_quote(&self) -> Option<&QuoteRecord> {
        match self {
            Record::Quote(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> Option<&TagRecord> {
        match self {
            Record::Tag(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&TagMappingRecord> {
        match self {
            Record::TagMapping(m) => Some(m),
            _ => None,
        }
    }
}
