use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{FrameId, PageNumber};

/// FrameHeader manages a single slot of the page cache.
/// It stores metadata about the cached page and the page image itself.
pub struct FrameHeader {
    /// The frame ID (index in the cache)
    frame_id: FrameId,
    /// The page held by this frame (None if empty)
    page: RwLock<Option<PageNumber>>,
    /// Pin count - number of live page handles
    pin_count: AtomicU32,
    /// Whether the image differs from the committed database
    is_dirty: AtomicBool,
    /// The page image
    pub(crate) data: RwLock<Box<[u8]>>,
}

impl FrameHeader {
    /// Creates an empty frame holding `page_size` bytes.
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page: RwLock::new(None),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
        }
    }

    /// Returns the frame ID.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page held in this frame.
    pub fn page(&self) -> Option<PageNumber> {
        *self.page.read()
    }

    pub fn set_page(&self, page: Option<PageNumber>) {
        *self.page.write() = page;
    }

    /// Returns the current pin count.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count and returns the new value.
    /// Returns None if the pin count was already 0.
    pub fn unpin(&self) -> Option<u32> {
        loop {
            let current = self.pin_count.load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            if self
                .pin_count
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(current - 1);
            }
        }
    }

    /// Returns whether the page is dirty.
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Sets the dirty flag.
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// A frame may be evicted only when nobody holds it and it carries no
    /// uncommitted changes.
    pub fn is_evictable(&self) -> bool {
        self.pin_count() == 0 && !self.is_dirty()
    }

    pub fn read_data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    pub fn write_data(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Copies data from the given slice into the frame.
    pub fn copy_from(&self, data: &[u8]) {
        let mut guard = self.data.write();
        guard.copy_from_slice(data);
    }

    /// Copies the frame image into the given slice.
    pub fn copy_to(&self, data: &mut [u8]) {
        let guard = self.data.read();
        data.copy_from_slice(&guard);
    }

    /// Resets the frame to its initial state.
    pub fn reset(&self) {
        *self.page.write() = None;
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}
