//! Entry model used from several threads at once

use std::{
    collections::BTreeSet,
    sync::{Arc, Barrier},
    thread,
};

use courier_core::{EntryId, MessageEntry, Priority, QueueEntry, ReturnValue};

#[test]
fn test_racing_clones_write_return_value_once() {
    let original = Arc::new(MessageEntry::builder("orders").want_return_value(true).build().unwrap());
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let clone = original.clone_for_dispatch();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                clone.set_return_value(ReturnValue::Delivered { consumer: format!("c{i}") });
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    match original.return_value() {
        Some(ReturnValue::Delivered { consumer }) => assert!(consumer.starts_with('c')),
        other => panic!("unexpected return value {other:?}"),
    }
}

#[test]
fn test_ids_unique_across_threads() {
    let handles: Vec<_> = (0..4)
        .map(|_| thread::spawn(|| (0..500).map(|_| EntryId::generate()).collect::<Vec<_>>()))
        .collect();

    let mut seen = BTreeSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id.as_u64()));
        }
    }
    assert_eq!(seen.len(), 2_000);
}

#[test]
fn test_sort_key_follows_priority_then_age() {
    let older_low = MessageEntry::builder("t").with_priority(Priority::LOW).build().unwrap();
    let newer_high = MessageEntry::builder("t").with_priority(Priority::HIGH).build().unwrap();
    let newest_high = MessageEntry::builder("t").with_priority(Priority::HIGH).build().unwrap();

    let mut keys = [older_low.sort_key(), newest_high.sort_key(), newer_high.sort_key()];
    keys.sort();
    assert_eq!(keys, [newer_high.sort_key(), newest_high.sort_key(), older_low.sort_key()]);
}
