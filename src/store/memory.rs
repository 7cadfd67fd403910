//! InMemoryRecordStore - map-backed store for testing and single-process use.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::record::{QuoteRecord, Record, RecordKey, RecordKind, TagMappingRecord, TAG_PREFIX};
use crate::stream::{ChangeStream, StreamEventKind};

use super::{Precondition, RecordStore, StoreError, VersionedRecord, WriteOp};

/// Stored wire form of one record.
struct StoredRecord {
    bytes: Vec<u8>,
    version: u64,
}

type MapKey = (String, String);

/// Keyspace plus the maintained secondary buckets. The buckets only track
/// quote records; they stand in for the attribute-based indexes a real
/// backing table would project.
struct Inner {
    records: BTreeMap<MapKey, StoredRecord>,
    author_bucket: HashMap<String, BTreeSet<MapKey>>,
    prefix_bucket: HashMap<String, BTreeSet<MapKey>>,
}

impl Inner {
    fn index_quote(&mut self, quote: &QuoteRecord, key: &MapKey) {
        self.author_bucket
            .entry(quote.author_normalized.clone())
            .or_default()
            .insert(key.clone());
        self.prefix_bucket
            .entry(quote.quote_normalized.clone())
            .or_default()
            .insert(key.clone());
    }

    fn unindex_quote(&mut self, quote: &QuoteRecord, key: &MapKey) {
        if let Some(bucket) = self.author_bucket.get_mut(&quote.author_normalized) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.author_bucket.remove(&quote.author_normalized);
            }
        }
        if let Some(bucket) = self.prefix_bucket.get_mut(&quote.quote_normalized) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.prefix_bucket.remove(&quote.quote_normalized);
            }
        }
    }
}

/// In-memory record store. Clone-friendly via `Arc`; every committed
/// mutation is appended to the change stream while the write lock is
/// held, so per-key event order matches write order.
#[derive(Clone)]
pub struct InMemoryRecordStore {
    inner: Arc<RwLock<Inner>>,
    stream: ChangeStream,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        InMemoryRecordStore {
            inner: Arc::new(RwLock::new(Inner {
                records: BTreeMap::new(),
                author_bucket: HashMap::new(),
                prefix_bucket: HashMap::new(),
            })),
            stream: ChangeStream::new(),
        }
    }

    /// An independent consumer over this store's change stream.
    pub fn stream(&self) -> ChangeStream {
        self.stream.new_consumer()
    }
}

fn map_key(key: &RecordKey) -> MapKey {
    (key.partition.clone(), key.sort.clone())
}

fn encode(record: &Record) -> Result<Vec<u8>, StoreError> {
    bitcode::serialize(record).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Record, StoreError> {
    bitcode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

fn check_precondition(
    precondition: Precondition,
    existing: Option<&StoredRecord>,
    key: &RecordKey,
) -> Result<(), StoreError> {
    let ok = match precondition {
        Precondition::None => true,
        Precondition::Absent => existing.is_none(),
        Precondition::Version(version) => {
            existing.map(|stored| stored.version == version).unwrap_or(false)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::Conflict { key: key.clone() })
    }
}

/// A write that has passed its precondition and is ready to apply.
/// Planning resolves every fallible step (codec, preconditions) before
/// anything is mutated, which is what makes the transaction atomic.
enum Planned {
    Put {
        key: RecordKey,
        record: Record,
        bytes: Vec<u8>,
        old: Option<(Vec<u8>, Record)>,
        new_version: u64,
    },
    Delete {
        key: RecordKey,
        old: (Vec<u8>, Record),
    },
}

impl InMemoryRecordStore {
    fn plan(inner: &Inner, ops: Vec<WriteOp>) -> Result<Vec<Planned>, StoreError> {
        let mut planned = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                WriteOp::Put {
                    record,
                    precondition,
                } => {
                    let key = record.key();
                    let existing = inner.records.get(&map_key(&key));
                    check_precondition(precondition, existing, &key)?;
                    let old = existing
                        .map(|stored| Ok::<_, StoreError>((stored.bytes.clone(), decode(&stored.bytes)?)))
                        .transpose()?;
                    let new_version = existing.map(|stored| stored.version + 1).unwrap_or(1);
                    let bytes = encode(&record)?;
                    planned.push(Planned::Put {
                        key,
                        record,
                        bytes,
                        old,
                        new_version,
                    });
                }
                WriteOp::Delete { key, precondition } => {
                    let existing = inner.records.get(&map_key(&key));
                    check_precondition(precondition, existing, &key)?;
                    match existing {
                        Some(stored) => {
                            let old = (stored.bytes.clone(), decode(&stored.bytes)?);
                            planned.push(Planned::Delete { key, old });
                        }
                        // unconditioned delete of an absent key is a no-op
                        None => {}
                    }
                }
            }
        }
        Ok(planned)
    }

    fn apply(&self, inner: &mut Inner, planned: Vec<Planned>) {
        let now = Utc::now();
        for item in planned {
            match item {
                Planned::Put {
                    key,
                    record,
                    bytes,
                    old,
                    new_version,
                } => {
                    let mk = map_key(&key);
                    if let Some((_, Record::Quote(old_quote))) = &old {
                        inner.unindex_quote(old_quote, &mk);
                    }
                    if let Record::Quote(quote) = &record {
                        inner.index_quote(quote, &mk);
                    }
                    let old_image = old.map(|(bytes, _)| bytes);
                    let kind = record.kind();
                    let event_kind = if old_image.is_some() {
                        StreamEventKind::Modify
                    } else {
                        StreamEventKind::Insert
                    };
                    inner.records.insert(
                        mk,
                        StoredRecord {
                            bytes: bytes.clone(),
                            version: new_version,
                        },
                    );
                    self.stream
                        .append(event_kind, key, kind, old_image, Some(bytes), now);
                }
                Planned::Delete { key, old } => {
                    let mk = map_key(&key);
                    let (old_bytes, old_record) = old;
                    if let Record::Quote(old_quote) = &old_record {
                        inner.unindex_quote(old_quote, &mk);
                    }
                    inner.records.remove(&mk);
                    self.stream.append(
                        StreamEventKind::Remove,
                        key,
                        old_record.kind(),
                        Some(old_bytes),
                        None,
                        now,
                    );
                }
            }
        }
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get(&self, key: &RecordKey) -> Result<Option<VersionedRecord>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))?;
        match inner.records.get(&map_key(key)) {
            Some(stored) => Ok(Some(VersionedRecord {
                record: decode(&stored.bytes)?,
                version: stored.version,
            })),
            None => Ok(None),
        }
    }

    fn put_if_absent(&self, record: Record) -> Result<bool, StoreError> {
        match self.transact(vec![WriteOp::put_if_absent(record)]) {
            Ok(()) => Ok(true),
            Err(StoreError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn transact(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| StoreError::LockPoisoned("transact"))?;
        let planned = Self::plan(&inner, ops)?;
        self.apply(&mut inner, planned);
        Ok(())
    }

    fn update_with<I, F>(
        &self,
        key: &RecordKey,
        init: I,
        apply: F,
    ) -> Result<VersionedRecord, StoreError>
    where
        I: FnOnce() -> Record,
        F: FnOnce(&mut Record),
    {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| StoreError::LockPoisoned("update"))?;
        let mk = map_key(key);

        let (mut record, old) = match inner.records.get(&mk) {
            Some(stored) => {
                let record = decode(&stored.bytes)?;
                (
                    record.clone(),
                    Some((stored.bytes.clone(), stored.version, record)),
                )
            }
            None => (init(), None),
        };

        apply(&mut record);
        if record.key() != *key {
            // the closure is not allowed to move the record to another key
            return Err(StoreError::KindMismatch { key: key.clone() });
        }

        let bytes = encode(&record)?;
        let version = old.as_ref().map(|(_, v, _)| v + 1).unwrap_or(1);

        if let Some((_, _, Record::Quote(old_quote))) = &old {
            inner.unindex_quote(old_quote, &mk);
        }
        if let Record::Quote(quote) = &record {
            inner.index_quote(quote, &mk);
        }

        inner.records.insert(
            mk,
            StoredRecord {
                bytes: bytes.clone(),
                version,
            },
        );

        let (event_kind, old_image) = match old {
            Some((old_bytes, _, _)) => (StreamEventKind::Modify, Some(old_bytes)),
            None => (StreamEventKind::Insert, None),
        };
        self.stream.append(
            event_kind,
            key.clone(),
            record.kind(),
            old_image,
            Some(bytes),
            Utc::now(),
        );

        Ok(VersionedRecord { record, version })
    }

    fn records_by_kind(&self, kind: RecordKind) -> Result<Vec<VersionedRecord>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))?;
        let mut records = Vec::new();
        for stored in inner.records.values() {
            let record = decode(&stored.bytes)?;
            if record.kind() == kind {
                records.push(VersionedRecord {
                    record,
                    version: stored.version,
                });
            }
        }
        records.sort_by(|a, b| b.record.updated_at().cmp(&a.record.updated_at()));
        Ok(records)
    }

    fn quotes_by_author(
        &self,
        author_normalized: &str,
    ) -> Result<Vec<QuoteRecord>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))?;
        let mut quotes = Vec::new();
        if let Some(bucket) = inner.author_bucket.get(author_normalized) {
            for mk in bucket {
                if let Some(stored) = inner.records.get(mk) {
                    if let Record::Quote(quote) = decode(&stored.bytes)? {
                        quotes.push(quote);
                    }
                }
            }
        }
        quotes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(quotes)
    }

    fn mappings_by_tag(&self, tag: &str) -> Result<Vec<TagMappingRecord>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))?;
        let partition = format!("{}{}", TAG_PREFIX, tag);
        let mut mappings = Vec::new();
        for ((p, _), stored) in inner.records.range((partition.clone(), String::new())..) {
            if *p != partition {
                break;
            }
            if let Record::TagMapping(mapping) = decode(&stored.bytes)? {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    fn duplicate_candidates(
        &self,
        author_normalized: &str,
        quote_normalized: &str,
    ) -> Result<Vec<QuoteRecord>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))?;
        let mut keys: BTreeSet<&MapKey> = BTreeSet::new();
        if let Some(bucket) = inner.author_bucket.get(author_normalized) {
            keys.extend(bucket.iter());
        }
        if let Some(bucket) = inner.prefix_bucket.get(quote_normalized) {
            keys.extend(bucket.iter());
        }

        let mut candidates = Vec::with_capacity(keys.len());
        for mk in keys {
            if let Some(stored) = inner.records.get(mk) {
                if let Record::Quote(quote) = decode(&stored.bytes)? {
                    candidates.push(quote);
                }
            }
        }
        Ok(candidates)
    }
}
