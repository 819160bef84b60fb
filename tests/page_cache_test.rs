//! Integration tests for the page cache

use std::sync::Arc;
use std::thread;

use lode::buffer::PageCache;
use lode::common::PageNumber;

const PAGE_SIZE: usize = 1024;

fn image(tag: u32) -> Vec<u8> {
    let mut data = vec![0u8; PAGE_SIZE];
    data[..4].copy_from_slice(&tag.to_be_bytes());
    data
}

fn tag_of(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

#[test]
fn test_page_cache_basic_operations() {
    let cache = PageCache::new(10, 1, PAGE_SIZE);
    let pgno = PageNumber::new(3);

    drop(cache.insert(pgno, &image(3)));
    {
        let mut page = cache.get_mut(pgno).unwrap();
        page.data_mut()[4..8].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    }
    {
        let page = cache.get(pgno).unwrap();
        assert_eq!(page.page_number(), pgno);
        assert_eq!(&page.data()[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
    assert!(cache.is_dirty(pgno));
    assert_eq!(cache.dirty_pages(), vec![pgno]);
}

#[test]
fn test_page_cache_evicts_least_recently_used() {
    let cache = PageCache::new(3, 1, PAGE_SIZE);
    for pgno in 1..=3 {
        drop(cache.insert(PageNumber::new(pgno), &image(pgno)));
    }

    // touch page 1 so page 2 is the oldest
    drop(cache.get(PageNumber::new(1)).unwrap());
    drop(cache.insert(PageNumber::new(4), &image(4)));

    assert!(cache.contains(PageNumber::new(1)));
    assert!(!cache.contains(PageNumber::new(2)));
    assert!(cache.contains(PageNumber::new(3)));
    assert!(cache.contains(PageNumber::new(4)));
    assert_eq!(cache.frame_count(), 3);
}

#[test]
fn test_page_cache_dirty_pages_are_never_evicted() {
    let cache = PageCache::new(2, 1, PAGE_SIZE);
    drop(cache.insert_dirty(PageNumber::new(1), &image(1)));
    drop(cache.insert(PageNumber::new(2), &image(2)));
    drop(cache.insert(PageNumber::new(3), &image(3)));

    // the clean page made room, the dirty one stayed
    assert!(cache.contains(PageNumber::new(1)));
    assert!(!cache.contains(PageNumber::new(2)));
    assert_eq!(tag_of(&cache.copy_page(PageNumber::new(1)).unwrap()), 1);
}

#[test]
fn test_page_cache_grows_when_everything_is_pinned() {
    let cache = PageCache::new(2, 1, PAGE_SIZE);
    let handles = (1..=5)
        .map(|pgno| cache.insert(PageNumber::new(pgno), &image(pgno)))
        .collect::<Vec<_>>();

    assert_eq!(cache.len(), 5);
    assert!(cache.frame_count() > cache.capacity());
    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(tag_of(&handle.data()), i as u32 + 1);
    }
    drop(handles);

    // once unpinned, new pages reuse frames instead of growing further
    drop(cache.insert(PageNumber::new(6), &image(6)));
    assert_eq!(cache.frame_count(), 5);
}

#[test]
fn test_page_cache_mark_clean_allows_eviction() {
    let cache = PageCache::new(1, 1, PAGE_SIZE);
    drop(cache.insert_dirty(PageNumber::new(1), &image(1)));
    cache.mark_clean(PageNumber::new(1));
    assert!(cache.dirty_pages().is_empty());

    drop(cache.insert(PageNumber::new(2), &image(2)));
    assert!(!cache.contains(PageNumber::new(1)));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_page_cache_reinsert_replaces_image() {
    let cache = PageCache::new(4, 1, PAGE_SIZE);
    drop(cache.insert(PageNumber::new(1), &image(1)));
    drop(cache.insert(PageNumber::new(1), &image(100)));

    assert_eq!(cache.len(), 1);
    assert_eq!(tag_of(&cache.get(PageNumber::new(1)).unwrap().data()), 100);
}

#[test]
fn test_page_cache_concurrent_readers() {
    let cache = Arc::new(PageCache::new(16, 2, PAGE_SIZE));
    for pgno in 1..=8 {
        drop(cache.insert(PageNumber::new(pgno), &image(pgno)));
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..100 {
                    for pgno in 1..=8 {
                        let page = cache.get(PageNumber::new(pgno)).unwrap();
                        assert_eq!(tag_of(&page.data()), pgno);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for pgno in 1..=8 {
        assert_eq!(cache.get_pin_count(PageNumber::new(pgno)), Some(0));
    }
}
