//! Record Store - typed keyspace with conditional and transactional writes.
//!
//! One logical keyspace holds every record kind; the trait below is the
//! only mutation surface. Writers build multi-record transactions with
//! preconditions; the aggregator goes through `update_with` (atomic
//! read-modify-write with a create-if-absent initializer). Every committed
//! mutation is mirrored onto the Change Stream.

mod memory;

use std::fmt;

use crate::record::{QuoteRecord, Record, RecordKey, RecordKind, TagMappingRecord};

pub use memory::InMemoryRecordStore;

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    LockPoisoned(&'static str),
    /// A precondition failed; the whole transaction was canceled and no
    /// write landed.
    Conflict { key: RecordKey },
    /// A typed accessor hit a record of another kind.
    KindMismatch { key: RecordKey },
    /// Encoding or decoding a stored record failed.
    Codec(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::LockPoisoned(operation) => {
                write!(f, "store lock poisoned during {}", operation)
            }
            StoreError::Conflict { key } => {
                write!(f, "transaction canceled: precondition failed for {}", key)
            }
            StoreError::KindMismatch { key } => {
                write!(f, "record at {} has an unexpected kind", key)
            }
            StoreError::Codec(message) => write!(f, "record codec error: {}", message),
        }
    }
}

impl std::error::Error for StoreError {}

/// A record together with its storage version. Versions increment on
/// every write and back the optimistic preconditions.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedRecord {
    pub record: Record,
    pub version: u64,
}

/// Condition a write must satisfy against the current stored state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// Write unconditionally.
    None,
    /// The key must not exist (create-if-absent).
    Absent,
    /// The key must exist at exactly this version.
    Version(u64),
}

/// One write inside a transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    Put {
        record: Record,
        precondition: Precondition,
    },
    Delete {
        key: RecordKey,
        precondition: Precondition,
    },
}

impl WriteOp {
    pub fn put(record: Record) -> Self {
        WriteOp::Put {
            record,
            precondition: Precondition::None,
        }
    }

    pub fn put_if_absent(record: Record) -> Self {
        WriteOp::Put {
            record,
            precondition: Precondition::Absent,
        }
    }

    pub fn put_if_version(record: Record, version: u64) -> Self {
        WriteOp::Put {
            record,
            precondition: Precondition::Version(version),
        }
    }

    pub fn delete(key: RecordKey) -> Self {
        WriteOp::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn delete_if_version(key: RecordKey, version: u64) -> Self {
        WriteOp::Delete {
            key,
            precondition: Precondition::Version(version),
        }
    }
}

/// Typed repository interface over the keyspace.
pub trait RecordStore {
    /// Get one record by key.
    fn get(&self, key: &RecordKey) -> Result<Option<VersionedRecord>, StoreError>;

    /// Conditionally create a record. Returns `false` (without error) if
    /// the key already exists, keeping the caller's ensure-steps idempotent.
    fn put_if_absent(&self, record: Record) -> Result<bool, StoreError>;

    /// Apply every write or none. All preconditions are checked against
    /// the same consistent snapshot; the first failure cancels the whole
    /// set with `StoreError::Conflict` and nothing lands.
    fn transact(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    /// Atomic read-modify-write. If the key is absent, `init` supplies
    /// the starting record before `apply` runs. Additive counter updates
    /// go through here so concurrent deltas cannot be lost.
    fn update_with<I, F>(
        &self,
        key: &RecordKey,
        init: I,
        apply: F,
    ) -> Result<VersionedRecord, StoreError>
    where
        I: FnOnce() -> Record,
        F: FnOnce(&mut Record);

    /// All records of one kind, most recently updated first.
    fn records_by_kind(&self, kind: RecordKind) -> Result<Vec<VersionedRecord>, StoreError>;

    /// Quotes for one normalized author, most recent first.
    fn quotes_by_author(&self, author_normalized: &str)
        -> Result<Vec<QuoteRecord>, StoreError>;

    /// Mapping rows in one tag partition, ordered by quote sort key.
    fn mappings_by_tag(&self, tag: &str) -> Result<Vec<TagMappingRecord>, StoreError>;

    /// Candidate quotes for duplicate checking: the union of the
    /// normalized-author bucket and the normalized-prefix bucket. Narrows
    /// the expensive similarity pass without a full scan.
    fn duplicate_candidates(
        &self,
        author_normalized: &str,
        quote_normalized: &str,
    ) -> Result<Vec<QuoteRecord>, StoreError>;
}
