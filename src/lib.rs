mod aggregator;
mod dedup;
mod record;
mod store;
mod stream;
mod writer;

pub use aggregator::{AggregationError, Aggregator, ApplySummary, ReconcileReport};
pub use dedup::{
    classify, normalize, normalized_prefix, similarity, DuplicateDetector, DuplicateMatch,
    DuplicateReport, MatchReason, NORMALIZED_PREFIX_LEN,
};
pub use record::{
    AuthorRecord, CounterRecord, QuoteRecord, Record, RecordKey, RecordKind, TagMappingRecord,
    TagRecord,
};
pub use store::{
    InMemoryRecordStore, Precondition, RecordStore, StoreError, VersionedRecord, WriteOp,
};
pub use stream::{ChangeEvent, ChangeStream, ImageError, StreamEventKind};
pub use writer::{with_commit_retries, QuoteDraft, QuoteWriter, WriteError};
