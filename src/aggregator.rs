//! Aggregator - derives tag/author counters from the change stream.
//!
//! Runs decoupled from the writer: it polls the stream, applies additive
//! deltas through the store's atomic read-modify-write, and never blocks
//! a write path. A failed event is logged and skipped; the periodic
//! reconciliation pass recomputes counters from ground truth and corrects
//! whatever drifted. Counters are written here and nowhere else.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::record::{
    AuthorRecord, CounterRecord, QuoteRecord, Record, RecordKey, RecordKind, TagMappingRecord,
    TagRecord,
};
use crate::store::{RecordStore, StoreError};
use crate::stream::{ChangeEvent, ChangeStream, ImageError, StreamEventKind};

/// Error applying one stream event. Never surfaced to writers; logged and
/// counted, then left for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationError {
    /// The event carried no image for the side being applied.
    MissingImage { sequence: u64 },
    /// The image failed to decode or decoded to an unexpected kind.
    BadImage { sequence: u64, message: String },
    Store(StoreError),
}

impl fmt::Display for AggregationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationError::MissingImage { sequence } => {
                write!(f, "stream event {} is missing a record image", sequence)
            }
            AggregationError::BadImage { sequence, message } => {
                write!(f, "stream event {} has a bad image: {}", sequence, message)
            }
            AggregationError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for AggregationError {}

impl From<StoreError> for AggregationError {
    fn from(err: StoreError) -> Self {
        AggregationError::Store(err)
    }
}

/// Result of applying one batch of stream events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    /// Events whose deltas landed.
    pub applied: usize,
    /// Events ignored: irrelevant kinds, no-op modifies, already-applied
    /// sequences.
    pub skipped: usize,
    /// Events that errored; logged and left for reconciliation.
    pub failed: usize,
}

/// Result of a reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub tags_corrected: usize,
    pub authors_corrected: usize,
    pub counter_corrected: bool,
}

/// Asynchronous consumer deriving Tag / Author / global-counter records
/// from quote and mapping mutations.
pub struct Aggregator<S> {
    store: S,
    stream: ChangeStream,
    batch_size: usize,
    /// Last applied stream sequence per record key. Per-key delivery is
    /// ordered, so anything at or below the mark is a replay.
    applied: Mutex<HashMap<RecordKey, u64>>,
}

impl<S: RecordStore> Aggregator<S> {
    pub fn new(store: S, stream: ChangeStream) -> Self {
        Aggregator {
            store,
            stream,
            batch_size: 100,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Set how many events one `run_once` polls.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Poll one batch from the stream and apply it.
    pub fn run_once(&self) -> ApplySummary {
        let batch = self.stream.poll(self.batch_size);
        self.apply_batch(&batch)
    }

    /// Poll and apply until the stream is empty.
    pub fn drain(&self) -> ApplySummary {
        let mut total = ApplySummary::default();
        loop {
            let batch = self.stream.poll(self.batch_size);
            if batch.is_empty() {
                return total;
            }
            let summary = self.apply_batch(&batch);
            total.applied += summary.applied;
            total.skipped += summary.skipped;
            total.failed += summary.failed;
        }
    }

    /// Apply a batch of events. One event's failure never blocks the
    /// rest.
    pub fn apply_batch(&self, events: &[ChangeEvent]) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for event in events {
            match self.apply_event(event) {
                Ok(true) => summary.applied += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    error!(
                        sequence = event.sequence,
                        key = %event.key,
                        error = %e,
                        "failed to apply stream event, leaving for reconciliation"
                    );
                    summary.failed += 1;
                }
            }
        }
        debug!(
            applied = summary.applied,
            skipped = summary.skipped,
            failed = summary.failed,
            "stream batch applied"
        );
        summary
    }

    fn apply_event(&self, event: &ChangeEvent) -> Result<bool, AggregationError> {
        if !matches!(
            event.record_kind,
            RecordKind::Quote | RecordKind::TagMapping
        ) {
            return Ok(false);
        }

        {
            let applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = applied.get(&event.key) {
                // per-key delivery is ordered, so this is a replay
                if *last >= event.sequence {
                    return Ok(false);
                }
            }
        }

        let did_apply = match (event.record_kind, event.kind) {
            (RecordKind::TagMapping, StreamEventKind::Insert) => {
                let mapping = self.mapping_image(event, event.new_record(), true)?;
                self.mapping_delta(&mapping, 1)?;
                true
            }
            (RecordKind::TagMapping, StreamEventKind::Remove) => {
                let mapping = self.mapping_image(event, event.old_record(), false)?;
                self.mapping_delta(&mapping, -1)?;
                true
            }
            // mapping rows are immutable; a re-put changes nothing
            (RecordKind::TagMapping, StreamEventKind::Modify) => false,
            (RecordKind::Quote, StreamEventKind::Insert) => {
                let quote = self.quote_image(event, event.new_record(), true)?;
                self.author_delta(
                    &quote.author,
                    &quote.author_normalized,
                    1,
                    Some(&quote.tags),
                    Some(quote.created_at),
                )?;
                self.counter_delta(1)?;
                true
            }
            (RecordKind::Quote, StreamEventKind::Remove) => {
                let quote = self.quote_image(event, event.old_record(), false)?;
                self.author_delta(&quote.author, &quote.author_normalized, -1, None, None)?;
                self.counter_delta(-1)?;
                true
            }
            (RecordKind::Quote, StreamEventKind::Modify) => {
                let old = self.quote_image(event, event.old_record(), false)?;
                let new = self.quote_image(event, event.new_record(), true)?;
                if old.author == new.author {
                    // tag changes arrive as their own mapping events
                    false
                } else {
                    self.author_delta(&old.author, &old.author_normalized, -1, None, None)?;
                    self.author_delta(
                        &new.author,
                        &new.author_normalized,
                        1,
                        Some(&new.tags),
                        Some(new.updated_at),
                    )?;
                    true
                }
            }
            // unreachable: other kinds were filtered above
            _ => false,
        };

        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        applied.insert(event.key.clone(), event.sequence);
        Ok(did_apply)
    }

    fn mapping_image(
        &self,
        event: &ChangeEvent,
        image: Result<Option<Record>, ImageError>,
        new_side: bool,
    ) -> Result<TagMappingRecord, AggregationError> {
        let record = image
            .map_err(|e| AggregationError::BadImage {
                sequence: event.sequence,
                message: e.message,
            })?
            .ok_or(AggregationError::MissingImage {
                sequence: event.sequence,
            })?;
        match record {
            Record::TagMapping(mapping) => Ok(mapping),
            other => Err(AggregationError::BadImage {
                sequence: event.sequence,
                message: format!(
                    "expected tag_quote_mapping {} image, found {}",
                    if new_side { "new" } else { "old" },
                    other.kind().as_str()
                ),
            }),
        }
    }

    fn quote_image(
        &self,
        event: &ChangeEvent,
        image: Result<Option<Record>, ImageError>,
        new_side: bool,
    ) -> Result<QuoteRecord, AggregationError> {
        let record = image
            .map_err(|e| AggregationError::BadImage {
                sequence: event.sequence,
                message: e.message,
            })?
            .ok_or(AggregationError::MissingImage {
                sequence: event.sequence,
            })?;
        match record {
            Record::Quote(quote) => Ok(quote),
            other => Err(AggregationError::BadImage {
                sequence: event.sequence,
                message: format!(
                    "expected quote {} image, found {}",
                    if new_side { "new" } else { "old" },
                    other.kind().as_str()
                ),
            }),
        }
    }

    fn mapping_delta(
        &self,
        mapping: &TagMappingRecord,
        delta: i64,
    ) -> Result<(), AggregationError> {
        let key = RecordKey::tag(&mapping.tag);
        let name = mapping.tag.clone();
        let used_at = mapping.created_at;
        let now = Utc::now();
        self.store.update_with(
            &key,
            || Record::Tag(TagRecord::fresh(&name, "aggregator", used_at)),
            |record| {
                if let Record::Tag(tag) = record {
                    tag.quote_count += delta;
                    if delta > 0 {
                        tag.last_used = used_at;
                    }
                    tag.updated_at = now;
                }
            },
        )?;
        Ok(())
    }

    fn author_delta(
        &self,
        name: &str,
        name_normalized: &str,
        delta: i64,
        tags: Option<&[String]>,
        quote_date: Option<DateTime<Utc>>,
    ) -> Result<(), AggregationError> {
        let key = RecordKey::author(name);
        let now = Utc::now();
        let init_name = name.to_string();
        let init_normalized = name_normalized.to_string();
        self.store.update_with(
            &key,
            || Record::Author(AuthorRecord::empty(&init_name, &init_normalized, now)),
            |record| {
                if let Record::Author(author) = record {
                    author.quote_count += delta;
                    if let Some(tags) = tags {
                        author.tags_used.extend(tags.iter().cloned());
                    }
                    if let Some(date) = quote_date {
                        if author.first_quote_date.is_none() {
                            author.first_quote_date = Some(date);
                        }
                        author.last_quote_date = Some(date);
                    }
                    author.updated_at = now;
                }
            },
        )?;
        Ok(())
    }

    fn counter_delta(&self, delta: i64) -> Result<(), AggregationError> {
        let now = Utc::now();
        self.store.update_with(
            &RecordKey::counter(),
            || Record::Counter(CounterRecord::zero(now)),
            |record| {
                if let Record::Counter(counter) = record {
                    counter.total_quotes += delta;
                    counter.last_updated = now;
                }
            },
        )?;
        Ok(())
    }

    /// Recompute every derived counter from ground truth and overwrite
    /// whatever drifted. Scheduling the cadence is the host's job.
    pub fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        let now = Utc::now();

        let quotes: Vec<QuoteRecord> = self
            .store
            .records_by_kind(RecordKind::Quote)?
            .into_iter()
            .filter_map(|v| match v.record {
                Record::Quote(q) => Some(q),
                _ => None,
            })
            .collect();

        // tag counts from mapping rows
        for versioned in self.store.records_by_kind(RecordKind::Tag)? {
            let tag = match versioned.record {
                Record::Tag(tag) => tag,
                _ => continue,
            };
            let expected = self.store.mappings_by_tag(&tag.name)?.len() as i64;
            if tag.quote_count != expected {
                let name = tag.name.clone();
                self.store.update_with(
                    &RecordKey::tag(&tag.name),
                    || Record::Tag(TagRecord::fresh(&name, "aggregator", now)),
                    |record| {
                        if let Record::Tag(tag) = record {
                            tag.quote_count = expected;
                            tag.updated_at = now;
                        }
                    },
                )?;
                report.tags_corrected += 1;
            }
        }

        // author aggregates from quote records
        struct Expected {
            normalized: String,
            count: i64,
            tags: BTreeSet<String>,
            first: Option<DateTime<Utc>>,
            last: Option<DateTime<Utc>>,
        }
        let mut by_author: HashMap<String, Expected> = HashMap::new();
        for quote in &quotes {
            let entry = by_author
                .entry(quote.author.clone())
                .or_insert_with(|| Expected {
                    normalized: quote.author_normalized.clone(),
                    count: 0,
                    tags: BTreeSet::new(),
                    first: None,
                    last: None,
                });
            entry.count += 1;
            entry.tags.extend(quote.tags.iter().cloned());
            entry.first = Some(match entry.first {
                Some(first) => first.min(quote.created_at),
                None => quote.created_at,
            });
            entry.last = Some(match entry.last {
                Some(last) => last.max(quote.created_at),
                None => quote.created_at,
            });
        }

        // correct authors that still have quotes
        for (name, expected) in &by_author {
            let current = self.store.get(&RecordKey::author(name))?;
            let drifted = match &current {
                Some(versioned) => match &versioned.record {
                    Record::Author(author) => {
                        author.quote_count != expected.count
                            || author.tags_used != expected.tags
                            || author.first_quote_date != expected.first
                            || author.last_quote_date != expected.last
                    }
                    _ => continue,
                },
                None => true,
            };
            if drifted {
                self.store.update_with(
                    &RecordKey::author(name),
                    || {
                        Record::Author(AuthorRecord::empty(name, &expected.normalized, now))
                    },
                    |record| {
                        if let Record::Author(author) = record {
                            author.quote_count = expected.count;
                            author.tags_used = expected.tags.clone();
                            author.first_quote_date = expected.first;
                            author.last_quote_date = expected.last;
                            author.updated_at = now;
                        }
                    },
                )?;
                report.authors_corrected += 1;
            }
        }

        // zero out authors whose quotes are all gone
        for versioned in self.store.records_by_kind(RecordKind::Author)? {
            let author = match versioned.record {
                Record::Author(author) => author,
                _ => continue,
            };
            if !by_author.contains_key(&author.name) && author.quote_count != 0 {
                let name = author.name.clone();
                let normalized = author.name_normalized.clone();
                self.store.update_with(
                    &RecordKey::author(&author.name),
                    || Record::Author(AuthorRecord::empty(&name, &normalized, now)),
                    |record| {
                        if let Record::Author(author) = record {
                            author.quote_count = 0;
                            author.updated_at = now;
                        }
                    },
                )?;
                report.authors_corrected += 1;
            }
        }

        // global counter from quote records
        let expected_total = quotes.len() as i64;
        let current_total = match self.store.get(&RecordKey::counter())? {
            Some(versioned) => match versioned.record {
                Record::Counter(counter) => Some(counter.total_quotes),
                _ => None,
            },
            None => None,
        };
        if current_total != Some(expected_total) {
            self.store.update_with(
                &RecordKey::counter(),
                || Record::Counter(CounterRecord::zero(now)),
                |record| {
                    if let Record::Counter(counter) = record {
                        counter.total_quotes = expected_total;
                        counter.last_updated = now;
                    }
                },
            )?;
            report.counter_corrected = true;
        }

        Ok(report)
    }
}
