//! Integration tests for the LRU-K replacer

use lode::buffer::LruKReplacer;
use lode::common::FrameId;

#[test]
fn test_lru_k_eviction_order() {
    let replacer = LruKReplacer::new(2);

    for i in 0..5 {
        replacer.record_access(FrameId::new(i));
        replacer.set_evictable(FrameId::new(i), true);
    }

    assert_eq!(replacer.size(), 5);

    // All frames have only 1 access (< k=2), so all have +inf distance
    // and go in order of earliest timestamp
    for i in 0..5 {
        assert_eq!(replacer.evict(), Some(FrameId::new(i)));
    }

    assert_eq!(replacer.size(), 0);
    assert_eq!(replacer.evict(), None);
}

#[test]
fn test_lru_k_respects_k_distance() {
    let replacer = LruKReplacer::new(2);

    // Frame 0: accessed once (+inf k-distance)
    replacer.record_access(FrameId::new(0));

    // Frames 1 and 2: accessed twice, frame 2 more recently
    replacer.record_access(FrameId::new(1));
    replacer.record_access(FrameId::new(1));
    replacer.record_access(FrameId::new(2));
    replacer.record_access(FrameId::new(2));

    for i in 0..3 {
        replacer.set_evictable(FrameId::new(i), true);
    }

    assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    assert_eq!(replacer.evict(), Some(FrameId::new(2)));
}

#[test]
fn test_lru_k_pinned_frames_not_evicted() {
    let replacer = LruKReplacer::new(1);

    replacer.record_access(FrameId::new(0));
    replacer.record_access(FrameId::new(1));
    replacer.record_access(FrameId::new(2));

    // Frame 0 stays pinned
    replacer.set_evictable(FrameId::new(1), true);
    replacer.set_evictable(FrameId::new(2), true);

    assert_eq!(replacer.size(), 2);
    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    assert_eq!(replacer.evict(), None);
}

#[test]
fn test_lru_k_toggle_evictable() {
    let replacer = LruKReplacer::new(2);

    replacer.record_access(FrameId::new(0));
    replacer.set_evictable(FrameId::new(0), true);
    assert_eq!(replacer.size(), 1);

    replacer.set_evictable(FrameId::new(0), false);
    assert_eq!(replacer.size(), 0);
    assert_eq!(replacer.evict(), None);

    // Setting the same state twice does not double count
    replacer.set_evictable(FrameId::new(0), true);
    replacer.set_evictable(FrameId::new(0), true);
    assert_eq!(replacer.size(), 1);
    assert_eq!(replacer.evict(), Some(FrameId::new(0)));
}

#[test]
fn test_lru_k_remove() {
    let replacer = LruKReplacer::new(2);

    replacer.record_access(FrameId::new(0));
    replacer.record_access(FrameId::new(1));
    replacer.set_evictable(FrameId::new(0), true);
    replacer.set_evictable(FrameId::new(1), true);

    replacer.remove(FrameId::new(0));
    assert_eq!(replacer.size(), 1);

    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    assert_eq!(replacer.evict(), None);
}

#[test]
fn test_lru_k_plain_lru_with_k_one() {
    let replacer = LruKReplacer::new(1);

    for i in 0..3 {
        replacer.record_access(FrameId::new(i));
        replacer.set_evictable(FrameId::new(i), true);
    }
    // touching frame 0 makes frame 1 the least recently used
    replacer.record_access(FrameId::new(0));

    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    assert_eq!(replacer.evict(), Some(FrameId::new(2)));
    assert_eq!(replacer.evict(), Some(FrameId::new(0)));
}

#[test]
fn test_lru_k_history_limit() {
    let replacer = LruKReplacer::new(2);

    for _ in 0..10 {
        replacer.record_access(FrameId::new(0));
    }
    replacer.record_access(FrameId::new(1));
    replacer.record_access(FrameId::new(1));

    replacer.set_evictable(FrameId::new(0), true);
    replacer.set_evictable(FrameId::new(1), true);

    // Only the last k accesses count, so frame 0 is further back
    assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    assert_eq!(replacer.evict(), Some(FrameId::new(1)));
}

#[test]
fn test_lru_k_concurrent_access() {
    use std::sync::Arc;
    use std::thread;

    let replacer = Arc::new(LruKReplacer::new(2));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let replacer = Arc::clone(&replacer);
            thread::spawn(move || {
                for i in 0..25 {
                    let frame_id = FrameId::new((t * 25 + i) as u32);
                    replacer.record_access(frame_id);
                    replacer.set_evictable(frame_id, true);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(replacer.size(), 100);
    for _ in 0..100 {
        assert!(replacer.evict().is_some());
    }
    assert_eq!(replacer.size(), 0);
}
