use std::collections::HashSet;
use std::sync::Arc;

use wy::engine::counter::RequestCounter;

#[test]
fn ids_start_at_one_and_increase() {
    let counter = RequestCounter::new();
    assert_eq!(counter.issued(), 0);
    assert_eq!(counter.next_id(), 1);
    assert_eq!(counter.next_id(), 2);
    assert_eq!(counter.next_id(), 3);
    assert_eq!(counter.issued(), 3);
}

#[test]
fn concurrent_ids_are_unique_and_gapless() {
    let counter = Arc::new(RequestCounter::new());
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || (0..500).map(|_| counter.next_id()).collect::<Vec<_>>())
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in threads {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "id {} handed out twice", id);
        }
    }

    assert_eq!(seen.len(), 4000);
    assert_eq!(seen.iter().min(), Some(&1));
    assert_eq!(seen.iter().max(), Some(&4000));
}
