//! Duplicate Detector - heuristic near-duplicate gate for new quotes.
//!
//! Deliberately simple and approximate: normalization folds the glyph and
//! whitespace variations people paste in, similarity is a cheap
//! positional/word-overlap ratio, and candidate narrowing goes through
//! the store's normalized buckets instead of a full scan. The gate fails
//! open on scan errors or budget exhaustion: availability over strict
//! deduplication.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::QuoteRecord;
use crate::store::RecordStore;

/// Length of the normalized quote prefix kept on records and used as the
/// candidate bucket key.
pub const NORMALIZED_PREFIX_LEN: usize = 100;

const SIMILAR_QUOTE_SAME_AUTHOR: f64 = 0.90;
const SAME_QUOTE_SIMILAR_AUTHOR: f64 = 0.85;
const BOTH_SIMILAR_QUOTE: f64 = 0.95;
const BOTH_SIMILAR_AUTHOR: f64 = 0.90;

const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(30);
const DEFAULT_MAX_SAMPLES: usize = 5;

/// Normalize text for comparison: trim, lowercase, fold smart quotes /
/// apostrophes / em-en dashes / ellipsis, collapse whitespace, strip
/// trailing periods. Idempotent.
pub fn normalize(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for ch in text.trim().chars() {
        match ch {
            '\u{201C}' | '\u{201D}' => folded.push('"'),
            '\u{2018}' | '\u{2019}' => folded.push('\''),
            '\u{2014}' | '\u{2013}' => folded.push('-'),
            '\u{2026}' => folded.push_str("..."),
            '\n' | '\t' => folded.push(' '),
            _ => folded.extend(ch.to_lowercase()),
        }
    }
    let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| c == '.' || c == ' ')
        .to_string()
}

/// The normalized-prefix projection stored on quote records.
pub fn normalized_prefix(text: &str) -> String {
    normalize(text).chars().take(NORMALIZED_PREFIX_LEN).collect()
}

/// Similarity ratio between two normalized strings.
///
/// Near-equal lengths (delta ≤ 3 chars) compare position by position;
/// otherwise the ratio is word overlap, counting only words longer than
/// two characters.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.len().abs_diff(b_chars.len()) <= 3 {
        let max_len = a_chars.len().max(b_chars.len());
        let matches = a_chars
            .iter()
            .zip(b_chars.iter())
            .filter(|(x, y)| x == y)
            .count();
        return matches as f64 / max_len as f64;
    }

    let words_a: Vec<&str> = a.split(' ').collect();
    let words_b: Vec<&str> = b.split(' ').collect();
    let common = words_a
        .iter()
        .filter(|word| word.chars().count() > 2 && words_b.contains(word))
        .count();
    (2.0 * common as f64) / (words_a.len() + words_b.len()) as f64
}

/// Why a candidate was classified as a duplicate.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum MatchReason {
    ExactMatch,
    SimilarQuoteSameAuthor,
    SameQuoteSimilarAuthor,
    BothSimilar,
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::ExactMatch => "exact_match",
            MatchReason::SimilarQuoteSameAuthor => "similar_quote_same_author",
            MatchReason::SameQuoteSimilarAuthor => "same_quote_similar_author",
            MatchReason::BothSimilar => "both_similar",
        }
    }
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a candidate pair of normalized (quote, author) values.
/// Rules are ordered; the first match wins.
pub fn classify(
    quote_a: &str,
    author_a: &str,
    quote_b: &str,
    author_b: &str,
) -> Option<MatchReason> {
    if quote_a == quote_b && author_a == author_b {
        return Some(MatchReason::ExactMatch);
    }

    let quote_similarity = similarity(quote_a, quote_b);
    if quote_similarity >= SIMILAR_QUOTE_SAME_AUTHOR && author_a == author_b {
        return Some(MatchReason::SimilarQuoteSameAuthor);
    }

    let author_similarity = similarity(author_a, author_b);
    if quote_a == quote_b && author_similarity >= SAME_QUOTE_SIMILAR_AUTHOR {
        return Some(MatchReason::SameQuoteSimilarAuthor);
    }

    if quote_similarity >= BOTH_SIMILAR_QUOTE && author_similarity >= BOTH_SIMILAR_AUTHOR {
        return Some(MatchReason::BothSimilar);
    }

    None
}

/// One existing quote flagged against a submission.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DuplicateMatch {
    pub quote: QuoteRecord,
    pub reason: MatchReason,
}

/// Outcome of a duplicate check. Empty means the write may proceed,
/// including the fail-open cases where the scan could not finish.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct DuplicateReport {
    pub matches: Vec<DuplicateMatch>,
}

impl DuplicateReport {
    pub fn clean() -> Self {
        DuplicateReport::default()
    }

    pub fn is_duplicate(&self) -> bool {
        !self.matches.is_empty()
    }
}

/// Pre-write duplicate gate.
pub struct DuplicateDetector {
    time_budget: Duration,
    max_samples: usize,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateDetector {
    pub fn new() -> Self {
        DuplicateDetector {
            time_budget: DEFAULT_TIME_BUDGET,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    /// Cap the scan duration; exceeding it fails open.
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    /// Cap how many sample matches a rejection reports.
    pub fn with_max_samples(mut self, max: usize) -> Self {
        self.max_samples = max;
        self
    }

    /// Check a submission against existing quotes. Never errors: a failed
    /// or over-budget scan logs a warning and returns whatever it found,
    /// letting the write proceed.
    pub fn check<S: RecordStore>(
        &self,
        store: &S,
        quote_text: &str,
        author: &str,
    ) -> DuplicateReport {
        let quote_norm = normalize(quote_text);
        let author_norm = normalize(author);
        let prefix = normalized_prefix(quote_text);

        let candidates = match store.duplicate_candidates(&author_norm, &prefix) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "duplicate candidate scan failed, failing open");
                return DuplicateReport::clean();
            }
        };

        let deadline = Instant::now() + self.time_budget;
        let mut matches = Vec::new();
        for candidate in candidates {
            if Instant::now() >= deadline {
                warn!(
                    found = matches.len(),
                    "duplicate scan exceeded time budget, failing open"
                );
                break;
            }
            let candidate_quote = normalize(&candidate.quote);
            let candidate_author = normalize(&candidate.author);
            if let Some(reason) =
                classify(&quote_norm, &author_norm, &candidate_quote, &candidate_author)
            {
                matches.push(DuplicateMatch {
                    quote: candidate,
                    reason,
                });
                if matches.len() >= self.max_samples {
                    break;
                }
            }
        }

        DuplicateReport { matches }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        QuoteRecord, Record, RecordKey, RecordKind, TagMappingRecord,
    };
    use crate::store::{InMemoryRecordStore, StoreError, VersionedRecord, WriteOp};
    use chrono::Utc;

    fn quote(id: &str, author: &str, text: &str) -> QuoteRecord {
        let now = Utc::now();
        QuoteRecord {
            id: id.to_string(),
            quote: text.to_string(),
            author: author.to_string(),
            tags: vec![],
            author_normalized: normalize(author),
            quote_normalized: normalized_prefix(text),
            created_at: now,
            updated_at: now,
            created_by: "test".to_string(),
            updated_by: None,
        }
    }

    fn seed(store: &InMemoryRecordStore, quotes: &[QuoteRecord]) {
        let ops = quotes
            .iter()
            .map(|q| WriteOp::put(Record::Quote(q.clone())))
            .collect();
        store.transact(ops).unwrap();
    }

    // --- normalize ---

    #[test]
    fn normalize_folds_glyph_variants() {
        assert_eq!(normalize("\u{201C}Smart quotes\u{201D}"), "\"smart quotes\"");
        assert_eq!(normalize("Text\u{2014}with\u{2013}dashes"), "text-with-dashes");
        assert_eq!(normalize("It\u{2019}s fine"), "it's fine");
        assert_eq!(normalize("Multiple\n\twhitespace"), "multiple whitespace");
        assert_eq!(normalize("  Hello   World!  "), "hello world!");
    }

    #[test]
    fn normalize_strips_trailing_periods() {
        assert_eq!(normalize("Einstein."), "einstein");
        assert_eq!(normalize("Einstein..."), "einstein");
        assert_eq!(normalize("a.b."), "a.b");
    }

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            "The only way to do great work is to love what you do.",
            "wait\u{2026}",
            "a . . .",
            "\u{201C}Quoted\u{201D}  text\u{2014}here.",
            "",
            "...",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", input);
        }
    }

    // --- similarity ---

    #[test]
    fn similarity_identities() {
        assert_eq!(similarity("hello world", "hello world"), 1.0);
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("hello", ""), 0.0);
        assert_eq!(similarity("", "hello"), 0.0);
    }

    #[test]
    fn near_equal_lengths_compare_positionally() {
        // one char appended: 11 of 12 positions match
        let score = similarity("hello world", "hello world!");
        assert!((score - 11.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn different_lengths_compare_by_word_overlap() {
        // "albert einstein" vs "einstein": one common word > 2 chars,
        // 2 + 1 words total
        let score = similarity("albert einstein", "einstein");
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
        assert!(similarity("completely different", "totally unrelated") < 0.3);
    }

    // --- classify ---

    #[test]
    fn trailing_period_is_still_an_exact_match() {
        let a = normalize("The only way to do great work is to love what you do.");
        let b = normalize("The only way to do great work is to love what you do");
        let author = normalize("Steve Jobs");
        assert_eq!(
            classify(&a, &author, &b, &author),
            Some(MatchReason::ExactMatch)
        );
    }

    #[test]
    fn author_trailing_period_resolves_to_exact_match() {
        let text = normalize("Life is what happens");
        let a1 = normalize("Albert Einstein");
        let a2 = normalize("Albert Einstein.");
        // period stripping makes the authors equal, so this is a full
        // exact match rather than same_quote_similar_author
        assert_eq!(
            classify(&text, &a1, &text, &a2),
            Some(MatchReason::ExactMatch)
        );
    }

    #[test]
    fn minor_quote_change_same_author_matches() {
        let a = normalize("Be yourself; everyone else is taken");
        let b = normalize("Be yourself, everyone else is taken");
        let author = normalize("Oscar Wilde");
        assert_eq!(
            classify(&a, &author, &b, &author),
            Some(MatchReason::SimilarQuoteSameAuthor)
        );
    }

    #[test]
    fn same_quote_different_author_is_not_a_duplicate() {
        let text = normalize("Same quote");
        assert_eq!(
            classify(
                &text,
                &normalize("Author One"),
                &text,
                &normalize("Completely Different Author")
            ),
            None
        );
    }

    #[test]
    fn unrelated_quotes_do_not_match() {
        assert_eq!(
            classify(
                &normalize("The best time to plant a tree"),
                &normalize("Chinese Proverb"),
                &normalize("A journey of a thousand miles"),
                &normalize("Lao Tzu")
            ),
            None
        );
    }

    // --- detector ---

    #[test]
    fn detector_flags_resubmission() {
        let store = InMemoryRecordStore::new();
        seed(
            &store,
            &[quote(
                "q-1",
                "Steve Jobs",
                "The only way to do great work is to love what you do.",
            )],
        );

        let detector = DuplicateDetector::new();
        let report = detector.check(
            &store,
            "The only way to do great work is to love what you do",
            "Steve Jobs",
        );
        assert!(report.is_duplicate());
        assert_eq!(report.matches[0].reason, MatchReason::ExactMatch);
        assert_eq!(report.matches[0].quote.id, "q-1");
    }

    #[test]
    fn detector_reports_at_most_max_samples() {
        let store = InMemoryRecordStore::new();
        let quotes: Vec<QuoteRecord> = (0..8)
            .map(|n| quote(&format!("q-{}", n), "Steve Jobs", "Stay hungry, stay foolish."))
            .collect();
        seed(&store, &quotes);

        let report = DuplicateDetector::new().check(
            &store,
            "Stay hungry, stay foolish.",
            "Steve Jobs",
        );
        assert_eq!(report.matches.len(), 5);
    }

    #[test]
    fn detector_passes_clean_submissions() {
        let store = InMemoryRecordStore::new();
        seed(&store, &[quote("q-1", "Steve Jobs", "Stay hungry.")]);

        let report = DuplicateDetector::new().check(
            &store,
            "Imagine all the people",
            "John Lennon",
        );
        assert!(!report.is_duplicate());
    }

    #[test]
    fn exhausted_budget_fails_open() {
        let store = InMemoryRecordStore::new();
        seed(&store, &[quote("q-1", "Steve Jobs", "Stay hungry.")]);

        let detector = DuplicateDetector::new().with_time_budget(Duration::from_secs(0));
        let report = detector.check(&store, "Stay hungry.", "Steve Jobs");
        assert!(!report.is_duplicate());
    }

    struct BrokenStore;

    impl RecordStore for BrokenStore {
        fn get(&self, _key: &RecordKey) -> Result<Option<VersionedRecord>, StoreError> {
            Err(StoreError::LockPoisoned("read"))
        }

        fn put_if_absent(&self, _record: Record) -> Result<bool, StoreError> {
            Err(StoreError::LockPoisoned("write"))
        }

        fn transact(&self, _ops: Vec<WriteOp>) -> Result<(), StoreError> {
            Err(StoreError::LockPoisoned("transact"))
        }

        fn update_with<I, F>(
            &self,
            key: &RecordKey,
            _init: I,
            _apply: F,
        ) -> Result<VersionedRecord, StoreError>
        where
            I: FnOnce() -> Record,
            F: FnOnce(&mut Record),
        {
            Err(StoreError::Conflict { key: key.clone() })
        }

        fn records_by_kind(
            &self,
            _kind: RecordKind,
        ) -> Result<Vec<VersionedRecord>, StoreError> {
            Err(StoreError::LockPoisoned("read"))
        }

        fn quotes_by_author(
            &self,
            _author_normalized: &str,
        ) -> Result<Vec<QuoteRecord>, StoreError> {
            Err(StoreError::LockPoisoned("read"))
        }

        fn mappings_by_tag(&self, _tag: &str) -> Result<Vec<TagMappingRecord>, StoreError> {
            Err(StoreError::LockPoisoned("read"))
        }

        fn duplicate_candidates(
            &self,
            _author_normalized: &str,
            _quote_normalized: &str,
        ) -> Result<Vec<QuoteRecord>, StoreError> {
            Err(StoreError::LockPoisoned("read"))
        }
    }

    #[test]
    fn scan_failure_fails_open() {
        let report = DuplicateDetector::new().check(&BrokenStore, "anything", "anyone");
        assert!(!report.is_duplicate());
    }
}
