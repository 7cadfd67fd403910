//! Transactional Writer - atomic quote create/update/delete.
//!
//! Every operation lands as one all-or-nothing transaction: the quote put
//! or delete plus the mapping rows its tag diff requires. The idempotent
//! ensure-tag step runs before the commit and outside the transaction
//! boundary; repeating it is always safe. Aggregate counters are never
//! written here; the aggregator derives them from the change stream.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::dedup::{normalize, normalized_prefix, DuplicateDetector, DuplicateMatch, DuplicateReport};
use crate::record::{QuoteRecord, Record, RecordKey, TagMappingRecord, TagRecord};
use crate::store::{RecordStore, StoreError, WriteOp};

/// Error type for write operations.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteError {
    /// Malformed or missing input; every problem found is listed.
    Validation { details: Vec<String> },
    /// The referenced quote does not exist.
    NotFound { id: String },
    /// The duplicate gate rejected the submission; up to five sample
    /// matches with reasons.
    Duplicate { matches: Vec<DuplicateMatch> },
    /// The atomic commit was rejected by a concurrent structural change.
    /// Nothing landed.
    Conflict { key: RecordKey },
    /// Bounded commit retries were exhausted. Nothing landed.
    Transaction { attempts: u32 },
    /// Underlying store failure.
    Store(StoreError),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Validation { details } => {
                write!(f, "validation failed: {}", details.join("; "))
            }
            WriteError::NotFound { id } => write!(f, "quote {} not found", id),
            WriteError::Duplicate { matches } => write!(
                f,
                "duplicate quote detected ({} matching quote{})",
                matches.len(),
                if matches.len() == 1 { "" } else { "s" }
            ),
            WriteError::Conflict { key } => {
                write!(f, "commit rejected by a concurrent change at {}", key)
            }
            WriteError::Transaction { attempts } => {
                write!(f, "atomic commit failed after {} attempts", attempts)
            }
            WriteError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<StoreError> for WriteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { key } => WriteError::Conflict { key },
            other => WriteError::Store(other),
        }
    }
}

/// Incoming quote payload, matching the external `{quote, author, tags[]}`
/// contract.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct QuoteDraft {
    pub quote: String,
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl QuoteDraft {
    pub fn new(quote: impl Into<String>, author: impl Into<String>) -> Self {
        QuoteDraft {
            quote: quote.into(),
            author: author.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Validate a draft, returning the cleaned tag list (trimmed, de-duplicated,
/// original order).
fn validate(draft: &QuoteDraft) -> Result<Vec<String>, WriteError> {
    let mut details = Vec::new();
    if draft.quote.trim().is_empty() {
        details.push("'quote' is required and cannot be empty".to_string());
    }
    if draft.author.trim().is_empty() {
        details.push("'author' is required and cannot be empty".to_string());
    }

    let mut tags: Vec<String> = Vec::with_capacity(draft.tags.len());
    let mut empty_tag_seen = false;
    for tag in &draft.tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            if !empty_tag_seen {
                details.push("all tags must be non-empty strings".to_string());
                empty_tag_seen = true;
            }
        } else if !tags.iter().any(|t| t == trimmed) {
            tags.push(trimmed.to_string());
        }
    }

    if details.is_empty() {
        Ok(tags)
    } else {
        Err(WriteError::Validation { details })
    }
}

/// Retry an operation whose commit may be rejected by concurrent writers.
/// Conflicts are retried up to `attempts` times; exhaustion surfaces as
/// `WriteError::Transaction`. Every other outcome passes through.
pub fn with_commit_retries<T, F>(attempts: u32, mut op: F) -> Result<T, WriteError>
where
    F: FnMut() -> Result<T, WriteError>,
{
    let mut tried = 0;
    loop {
        tried += 1;
        match op() {
            Err(WriteError::Conflict { key }) => {
                if tried >= attempts {
                    debug!(%key, attempts = tried, "commit retries exhausted");
                    return Err(WriteError::Transaction { attempts: tried });
                }
                debug!(%key, attempt = tried, "commit conflicted, retrying");
            }
            other => return other,
        }
    }
}

/// The transactional write surface for quotes. Generic over the store so
/// tests and hosts can swap backings.
pub struct QuoteWriter<S> {
    store: S,
    detector: DuplicateDetector,
}

impl<S: RecordStore> QuoteWriter<S> {
    pub fn new(store: S) -> Self {
        QuoteWriter {
            store,
            detector: DuplicateDetector::new(),
        }
    }

    /// Replace the duplicate gate configuration.
    pub fn with_detector(mut self, detector: DuplicateDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Access the underlying store (read paths, aggregator wiring).
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run the duplicate gate without writing anything.
    pub fn check_duplicate(&self, quote: &str, author: &str) -> DuplicateReport {
        self.detector.check(&self.store, quote, author)
    }

    /// Create a quote and its tag mapping rows in one atomic commit.
    /// The duplicate gate runs first; detection rejects the write with
    /// sample matches.
    pub fn create_quote(
        &self,
        draft: &QuoteDraft,
        actor: &str,
    ) -> Result<QuoteRecord, WriteError> {
        let tags = validate(draft)?;

        let report = self.detector.check(&self.store, &draft.quote, &draft.author);
        if report.is_duplicate() {
            return Err(WriteError::Duplicate {
                matches: report.matches,
            });
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let record = compose_quote(&id, draft, &tags, now, actor.to_string(), None, now);

        self.ensure_tags(&tags, actor, now)?;

        let mut ops = Vec::with_capacity(1 + tags.len());
        ops.push(WriteOp::put_if_absent(Record::Quote(record.clone())));
        for tag in &tags {
            ops.push(WriteOp::put(Record::TagMapping(TagMappingRecord {
                tag: tag.clone(),
                quote_id: id.clone(),
                author: record.author.clone(),
                created_at: now,
            })));
        }
        self.store.transact(ops)?;

        debug!(id = %record.id, tags = tags.len(), "quote created");
        Ok(record)
    }

    /// Update a quote, diffing its tag set into added/removed mapping
    /// rows, all in one atomic commit against the version that was read.
    pub fn update_quote(
        &self,
        id: &str,
        draft: &QuoteDraft,
        actor: &str,
    ) -> Result<QuoteRecord, WriteError> {
        let tags = validate(draft)?;

        let key = RecordKey::quote(id);
        let existing = self
            .store
            .get(&key)?
            .ok_or_else(|| WriteError::NotFound { id: id.to_string() })?;
        let old = match existing.record {
            Record::Quote(quote) => quote,
            _ => return Err(WriteError::Store(StoreError::KindMismatch { key })),
        };

        let now = Utc::now();
        let record = compose_quote(
            id,
            draft,
            &tags,
            old.created_at,
            old.created_by.clone(),
            Some(actor.to_string()),
            now,
        );

        let added: Vec<&String> = tags.iter().filter(|t| !old.tags.contains(*t)).collect();
        let removed: Vec<&String> = old.tags.iter().filter(|t| !tags.contains(*t)).collect();

        self.ensure_tags(&added, actor, now)?;

        let mut ops = Vec::with_capacity(1 + added.len() + removed.len());
        ops.push(WriteOp::put_if_version(
            Record::Quote(record.clone()),
            existing.version,
        ));
        for tag in &removed {
            ops.push(WriteOp::delete(RecordKey::mapping(tag, id)));
        }
        for tag in &added {
            ops.push(WriteOp::put(Record::TagMapping(TagMappingRecord {
                tag: (*tag).clone(),
                quote_id: id.to_string(),
                author: record.author.clone(),
                created_at: now,
            })));
        }
        self.store.transact(ops)?;

        debug!(
            %id,
            added = added.len(),
            removed = removed.len(),
            "quote updated"
        );
        Ok(record)
    }

    /// Delete a quote and every one of its mapping rows in one atomic
    /// commit.
    pub fn delete_quote(&self, id: &str) -> Result<(), WriteError> {
        let key = RecordKey::quote(id);
        let existing = self
            .store
            .get(&key)?
            .ok_or_else(|| WriteError::NotFound { id: id.to_string() })?;
        let old = match existing.record {
            Record::Quote(quote) => quote,
            _ => return Err(WriteError::Store(StoreError::KindMismatch { key: key.clone() })),
        };

        let mut ops = Vec::with_capacity(1 + old.tags.len());
        ops.push(WriteOp::delete_if_version(key, existing.version));
        for tag in &old.tags {
            ops.push(WriteOp::delete(RecordKey::mapping(tag, id)));
        }
        self.store.transact(ops)?;

        debug!(%id, mappings = old.tags.len(), "quote deleted");
        Ok(())
    }

    /// Idempotent create-if-absent for tag records, count 0. Runs outside
    /// the transaction boundary; repeating it never changes an existing
    /// tag.
    fn ensure_tags<T: AsRef<str>>(
        &self,
        tags: &[T],
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WriteError> {
        for tag in tags {
            self.store
                .put_if_absent(Record::Tag(TagRecord::fresh(tag.as_ref(), actor, now)))?;
        }
        Ok(())
    }
}

/// Build a quote record from canonical text, recomputing the normalized
/// projections so they can never diverge within a commit.
fn compose_quote(
    id: &str,
    draft: &QuoteDraft,
    tags: &[String],
    created_at: DateTime<Utc>,
    created_by: String,
    updated_by: Option<String>,
    updated_at: DateTime<Utc>,
) -> QuoteRecord {
    let quote = draft.quote.trim().to_string();
    let author = draft.author.trim().to_string();
    QuoteRecord {
        id: id.to_string(),
        author_normalized: normalize(&author),
        quote_normalized: normalized_prefix(&quote),
        quote,
        author,
        tags: tags.to_vec(),
        created_at,
        updated_at,
        created_by,
        updated_by,
    }
}
