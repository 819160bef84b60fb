use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{FrameId, PageNumber};

use super::FrameHeader;

/// Callback run when the last reference of a handle goes away
pub(crate) type ReleaseCallback = Box<dyn FnOnce(FrameId) + Send + Sync>;

/// Pin held on one cache frame. Dropping it unpins the frame.
struct PinnedFrame {
    pgno: PageNumber,
    frame: Arc<FrameHeader>,
    release_callback: Option<ReleaseCallback>,
}

impl PinnedFrame {
    fn new(pgno: PageNumber, frame: Arc<FrameHeader>, release_callback: ReleaseCallback) -> Self {
        Self {
            pgno,
            frame,
            release_callback: Some(release_callback),
        }
    }
}

impl Drop for PinnedFrame {
    fn drop(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.frame.frame_id());
        }
    }
}

/// Read handle on a cached page.
///
/// The page stays pinned (never evicted) for the lifetime of the handle. The
/// image is locked only while a guard returned by [`PageRef::data`] is alive.
pub struct PageRef {
    pin: PinnedFrame,
}

impl PageRef {
    pub(crate) fn new(
        pgno: PageNumber,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self {
            pin: PinnedFrame::new(pgno, frame, release_callback),
        }
    }

    pub fn page_number(&self) -> PageNumber {
        self.pin.pgno
    }

    /// Borrows the page image.
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.pin.frame.read_data(), |d| &d[..])
    }
}

/// Write handle on a cached page. The page was marked dirty when the handle
/// was issued, so it cannot be evicted until the transaction ends.
pub struct PageMut {
    pin: PinnedFrame,
}

impl PageMut {
    pub(crate) fn new(
        pgno: PageNumber,
        frame: Arc<FrameHeader>,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self {
            pin: PinnedFrame::new(pgno, frame, release_callback),
        }
    }

    pub fn page_number(&self) -> PageNumber {
        self.pin.pgno
    }

    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.pin.frame.read_data(), |d| &d[..])
    }

    /// Borrows the page image for modification.
    pub fn data_mut(&mut self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.pin.frame.write_data(), |d| &mut d[..])
    }
}
