//! Integration tests for the transactional write path: atomicity of the
//! quote + mapping commits and the caller-visible error taxonomy.

use std::sync::{Arc, Barrier};
use std::thread;

use quotestore::{
    with_commit_retries, InMemoryRecordStore, QuoteDraft, QuoteWriter, RecordKey, RecordStore,
    WriteError,
};

fn draft(quote: &str, author: &str, tags: &[&str]) -> QuoteDraft {
    QuoteDraft::new(quote, author).with_tags(tags.iter().copied())
}

fn writer() -> QuoteWriter<InMemoryRecordStore> {
    QuoteWriter::new(InMemoryRecordStore::new())
}

#[test]
fn create_leaves_exactly_one_mapping_per_tag() {
    let writer = writer();
    let record = writer
        .create_quote(
            &draft("Stay hungry, stay foolish.", "Steve Jobs", &["Wisdom", "Life", "Work"]),
            "admin",
        )
        .unwrap();

    for tag in &record.tags {
        let mappings = writer.store().mappings_by_tag(tag).unwrap();
        assert_eq!(mappings.len(), 1, "tag {} should map exactly once", tag);
        assert_eq!(mappings[0].quote_id, record.id);
    }
}

#[test]
fn delete_leaves_no_mapping_behind() {
    let writer = writer();
    let record = writer
        .create_quote(&draft("Stay hungry.", "Steve Jobs", &["Wisdom", "Life"]), "admin")
        .unwrap();
    let tags = record.tags.clone();

    writer.delete_quote(&record.id).unwrap();

    for tag in &tags {
        assert!(
            writer.store().mappings_by_tag(tag).unwrap().is_empty(),
            "mapping for tag {} survived the delete",
            tag
        );
    }
    assert!(writer
        .store()
        .get(&RecordKey::quote(&record.id))
        .unwrap()
        .is_none());
}

#[test]
fn update_recomputes_normalized_projections() {
    let writer = writer();
    let record = writer
        .create_quote(&draft("Stay hungry.", "Steve Jobs", &[]), "admin")
        .unwrap();

    let updated = writer
        .update_quote(&record.id, &draft("Imagine all the people.", "John Lennon", &[]), "admin")
        .unwrap();

    assert_eq!(updated.author_normalized, "john lennon");
    assert_eq!(updated.quote_normalized, "imagine all the people");
    // the stored copy and the returned copy agree
    let stored = writer
        .store()
        .get(&RecordKey::quote(&record.id))
        .unwrap()
        .unwrap();
    match stored.record {
        quotestore::Record::Quote(q) => {
            assert_eq!(q.author_normalized, updated.author_normalized);
            assert_eq!(q.quote_normalized, updated.quote_normalized);
        }
        _ => panic!("expected quote"),
    }
}

#[test]
fn quote_id_is_immutable_across_updates() {
    let writer = writer();
    let record = writer
        .create_quote(&draft("Stay hungry.", "Steve Jobs", &[]), "admin")
        .unwrap();
    let updated = writer
        .update_quote(&record.id, &draft("Stay foolish.", "Steve Jobs", &[]), "admin")
        .unwrap();
    assert_eq!(updated.id, record.id);
}

#[test]
fn missing_ids_surface_not_found() {
    let writer = writer();
    assert!(matches!(
        writer.update_quote("ghost", &draft("x", "y", &[]), "admin"),
        Err(WriteError::NotFound { .. })
    ));
    assert!(matches!(
        writer.delete_quote("ghost"),
        Err(WriteError::NotFound { .. })
    ));
}

#[test]
fn malformed_input_surfaces_validation() {
    let writer = writer();
    match writer.create_quote(&draft("", "  ", &[""]), "admin") {
        Err(WriteError::Validation { details }) => assert_eq!(details.len(), 3),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn concurrent_updates_commit_exactly_once_per_version() {
    let store = InMemoryRecordStore::new();
    let writer = Arc::new(QuoteWriter::new(store));
    let record = writer
        .create_quote(&draft("Stay hungry.", "Steve Jobs", &["base"]), "admin")
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for tag in ["red", "blue"] {
        let writer = Arc::clone(&writer);
        let barrier = Arc::clone(&barrier);
        let id = record.id.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            writer.update_quote(&id, &draft("Stay hungry.", "Steve Jobs", &[tag]), "editor")
        }));
    }

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // every outcome is a commit or a clean optimistic conflict
    let committed: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert!(!committed.is_empty());
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, WriteError::Conflict { .. }), "unexpected error: {}", e);
        }
    }

    // whatever happened, mappings exactly mirror the final tag list
    let final_quote = writer
        .store()
        .get(&RecordKey::quote(&record.id))
        .unwrap()
        .unwrap();
    let final_tags = match final_quote.record {
        quotestore::Record::Quote(q) => q.tags,
        _ => panic!("expected quote"),
    };
    for tag in ["base", "red", "blue"] {
        let mappings = writer.store().mappings_by_tag(tag).unwrap();
        if final_tags.iter().any(|t| t == tag) {
            assert_eq!(mappings.len(), 1, "tag {} should have one mapping", tag);
        } else {
            assert!(mappings.is_empty(), "orphan mapping left for tag {}", tag);
        }
    }
}

#[test]
fn retries_resolve_contention_or_surface_transaction_errors() {
    let store = InMemoryRecordStore::new();
    let writer = Arc::new(QuoteWriter::new(store));
    let record = writer
        .create_quote(&draft("Stay hungry.", "Steve Jobs", &[]), "admin")
        .unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let mut handles = Vec::new();
    for n in 0..4 {
        let writer = Arc::clone(&writer);
        let barrier = Arc::clone(&barrier);
        let id = record.id.clone();
        handles.push(thread::spawn(move || {
            let tag = format!("tag-{}", n);
            barrier.wait();
            with_commit_retries(5, || {
                writer.update_quote(
                    &id,
                    &draft("Stay hungry.", "Steve Jobs", &[tag.as_str()]),
                    "editor",
                )
            })
        }));
    }

    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => {}
            // acceptable only as the documented exhaustion outcome
            Err(WriteError::Transaction { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
