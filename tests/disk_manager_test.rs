//! Integration tests for the disk manager

use std::sync::Arc;
use std::thread;

use lode::common::PageNumber;
use lode::storage::disk::DiskManager;
use tempfile::NamedTempFile;

const PAGE_SIZE: usize = 4096;

#[test]
fn test_disk_manager_create_file() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path(), PAGE_SIZE).unwrap();

    assert_eq!(dm.file_pages().unwrap(), 0);
    assert_eq!(dm.get_num_reads(), 0);
    assert_eq!(dm.get_num_writes(), 0);
    assert_eq!(dm.page_size(), PAGE_SIZE);
}

#[test]
fn test_disk_manager_read_write_page() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path(), PAGE_SIZE).unwrap();

    let mut write_data = [0u8; PAGE_SIZE];
    for (i, byte) in write_data.iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }
    dm.write_page(PageNumber::new(1), &write_data).unwrap();

    let mut read_data = [0u8; PAGE_SIZE];
    dm.read_page(PageNumber::new(1), &mut read_data).unwrap();

    assert_eq!(write_data, read_data);
    assert_eq!(dm.file_pages().unwrap(), 1);
}

#[test]
fn test_disk_manager_random_access() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path(), PAGE_SIZE).unwrap();

    // Write to pages in random order
    let write_order = [5u32, 2, 8, 10, 7, 3, 9, 1, 6, 4];
    for &i in &write_order {
        let mut data = [0u8; PAGE_SIZE];
        data[0] = i as u8;
        dm.write_page(PageNumber::new(i), &data).unwrap();
    }

    for i in 1..=10u32 {
        let mut data = [0u8; PAGE_SIZE];
        dm.read_page(PageNumber::new(i), &mut data).unwrap();
        assert_eq!(data[0], i as u8);
    }
}

#[test]
fn test_disk_manager_persistence() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let test_data = b"Persistence test";

    {
        let dm = DiskManager::new(&path, PAGE_SIZE).unwrap();
        let mut data = [0u8; PAGE_SIZE];
        data[..test_data.len()].copy_from_slice(test_data);
        dm.write_page(PageNumber::new(2), &data).unwrap();
        dm.sync().unwrap();
    }

    {
        let dm = DiskManager::new(&path, PAGE_SIZE).unwrap();
        assert_eq!(dm.file_pages().unwrap(), 2);

        let mut data = [0u8; PAGE_SIZE];
        dm.read_page(PageNumber::new(2), &mut data).unwrap();
        assert_eq!(&data[..test_data.len()], test_data);

        // the gap before page 2 reads back as zeros
        dm.read_page(PageNumber::new(1), &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }
}

#[test]
fn test_disk_manager_io_stats() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path(), PAGE_SIZE).unwrap();

    let data = [0u8; PAGE_SIZE];
    dm.write_page(PageNumber::new(1), &data).unwrap();
    assert_eq!(dm.get_num_writes(), 1);

    let mut read_data = [0u8; PAGE_SIZE];
    dm.read_page(PageNumber::new(1), &mut read_data).unwrap();
    assert_eq!(dm.get_num_reads(), 1);

    // a failed read is not counted
    assert!(dm.read_page(PageNumber::new(5), &mut read_data).is_err());
    assert_eq!(dm.get_num_reads(), 1);
}

#[test]
fn test_disk_manager_read_at_partial_header() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path(), 512).unwrap();

    let mut header = [0u8; 100];
    assert_eq!(dm.read_at(0, &mut header).unwrap(), 0);

    let mut data = [0u8; 512];
    data[..4].copy_from_slice(b"lode");
    dm.write_page(PageNumber::new(1), &data).unwrap();
    assert_eq!(dm.read_at(0, &mut header).unwrap(), 100);
    assert_eq!(&header[..4], b"lode");
    assert_eq!(dm.read_at(500, &mut header).unwrap(), 12);
}

#[test]
fn test_disk_manager_truncate_drops_tail_pages() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = DiskManager::new(temp_file.path(), 1024).unwrap();

    let data = [7u8; 1024];
    for pgno in 1..=6 {
        dm.write_page(PageNumber::new(pgno), &data).unwrap();
    }
    dm.truncate_pages(3).unwrap();
    assert_eq!(dm.file_pages().unwrap(), 3);
    assert_eq!(dm.file_size().unwrap(), 3 * 1024);

    let mut read = [0u8; 1024];
    assert!(dm.read_page(PageNumber::new(4), &mut read).is_err());
    dm.read_page(PageNumber::new(3), &mut read).unwrap();
    assert_eq!(read, data);
}

#[test]
fn test_disk_manager_concurrent_writers() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path(), PAGE_SIZE).unwrap());

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let dm = Arc::clone(&dm);
            thread::spawn(move || {
                for i in 0..10u32 {
                    let pgno = PageNumber::new(t * 10 + i + 1);
                    let mut data = [0u8; PAGE_SIZE];
                    data[..4].copy_from_slice(&pgno.as_u32().to_le_bytes());
                    dm.write_page(pgno, &data).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(dm.file_pages().unwrap(), 40);
    for pgno in 1..=40u32 {
        let mut data = [0u8; PAGE_SIZE];
        dm.read_page(PageNumber::new(pgno), &mut data).unwrap();
        let id_bytes: [u8; 4] = data[..4].try_into().unwrap();
        assert_eq!(u32::from_le_bytes(id_bytes), pgno);
    }
}
