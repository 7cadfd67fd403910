//! Change Stream - ordered-per-key feed of record mutations.
//!
//! The store appends one `ChangeEvent` for every committed mutation while
//! it still holds its write lock, so events for the same key always appear
//! in write order. Events for different keys interleave arbitrarily;
//! consumers must not assume cross-key ordering.
//!
//! ## Example
//!
//! ```ignore
//! let stream = store.stream();
//! let batch = stream.poll(100);
//! for event in &batch {
//!     // apply, keyed dedup via event.sequence
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Record, RecordKey, RecordKind};

/// What happened to the record.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum StreamEventKind {
    Insert,
    Modify,
    Remove,
}

/// Error when decoding a record image from an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageError {
    pub message: String,
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image error: {}", self.message)
    }
}

impl std::error::Error for ImageError {}

/// One mutation of one record. Images are carried as encoded bytes (the
/// store's wire form); consumers decode the side they need.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ChangeEvent {
    /// Globally unique, monotonically increasing across the stream.
    pub sequence: u64,
    pub key: RecordKey,
    pub kind: StreamEventKind,
    pub record_kind: RecordKind,
    #[serde(with = "image_serde")]
    pub old_image: Option<Vec<u8>>,
    #[serde(with = "image_serde")]
    pub new_image: Option<Vec<u8>>,
    pub occurred_at: DateTime<Utc>,
}

mod image_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(image: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        image
            .as_ref()
            .map(|bytes| STANDARD.encode(bytes))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl ChangeEvent {
    /// Decode the record image before the mutation (absent on Insert).
    pub fn old_record(&self) -> Result<Option<Record>, ImageError> {
        decode_image(self.old_image.as_deref())
    }

    /// Decode the record image after the mutation (absent on Remove).
    pub fn new_record(&self) -> Result<Option<Record>, ImageError> {
        decode_image(self.new_image.as_deref())
    }
}

fn decode_image(image: Option<&[u8]>) -> Result<Option<Record>, ImageError> {
    image
        .map(|bytes| {
            bitcode::deserialize(bytes).map_err(|e| ImageError {
                message: e.to_string(),
            })
        })
        .transpose()
}

/// Append-only change feed with independent consumers.
///
/// Cloning shares the log and the read position; `new_consumer` yields a
/// handle over the same log with its own position, so several consumers
/// can drain the full stream independently.
#[derive(Clone)]
pub struct ChangeStream {
    log: Arc<RwLock<Vec<ChangeEvent>>>,
    position: Arc<Mutex<usize>>,
    sequence: Arc<AtomicU64>,
}

impl Default for ChangeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeStream {
    pub fn new() -> Self {
        ChangeStream {
            log: Arc::new(RwLock::new(Vec::new())),
            position: Arc::new(Mutex::new(0)),
            sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A consumer over the same log with an independent read position.
    pub fn new_consumer(&self) -> Self {
        ChangeStream {
            log: Arc::clone(&self.log),
            position: Arc::new(Mutex::new(0)),
            sequence: Arc::clone(&self.sequence),
        }
    }

    /// Append one event, stamping the next stream sequence. Called by the
    /// store inside its write critical section so per-key order matches
    /// write order.
    pub fn append(
        &self,
        kind: StreamEventKind,
        key: RecordKey,
        record_kind: RecordKind,
        old_image: Option<Vec<u8>>,
        new_image: Option<Vec<u8>>,
        occurred_at: DateTime<Utc>,
    ) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let event = ChangeEvent {
            sequence,
            key,
            kind,
            record_kind,
            old_image,
            new_image,
            occurred_at,
        };
        let mut log = self.log.write().unwrap_or_else(|e| e.into_inner());
        log.push(event);
        sequence
    }

    /// Take up to `max` events past this consumer's position.
    pub fn poll(&self, max: usize) -> Vec<ChangeEvent> {
        let log = self.log.read().unwrap_or_else(|e| e.into_inner());
        let mut position = self.position.lock().unwrap_or_else(|e| e.into_inner());
        let end = (*position + max).min(log.len());
        let batch = log[*position..end].to_vec();
        *position = end;
        batch
    }

    /// Events appended but not yet polled by this consumer.
    pub fn pending(&self) -> usize {
        let log = self.log.read().unwrap_or_else(|e| e.into_inner());
        let position = self.position.lock().unwrap_or_else(|e| e.into_inner());
        log.len() - *position
    }
}
