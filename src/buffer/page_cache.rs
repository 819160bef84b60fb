use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::common::{FrameId, PageNumber};

use super::page_guard::ReleaseCallback;
use super::{FrameHeader, LruKReplacer, PageMut, PageRef};

/// Internal state shared with the release callbacks of outstanding handles
struct CacheState {
    page_size: usize,
    /// Cache frames; grows lazily
    frames: RwLock<Vec<Arc<FrameHeader>>>,
    /// Page table: maps page numbers to frame IDs
    page_table: Mutex<HashMap<PageNumber, FrameId>>,
    /// Frames that hold no page
    free_list: Mutex<Vec<FrameId>>,
    replacer: LruKReplacer,
}

impl CacheState {
    fn frame(&self, frame_id: FrameId) -> Arc<FrameHeader> {
        Arc::clone(&self.frames.read()[frame_id.as_usize()])
    }

    /// Runs when a page handle is dropped.
    fn release(&self, frame_id: FrameId) {
        let page_table = self.page_table.lock();
        let frame = self.frame(frame_id);
        if frame.unpin() != Some(0) {
            return;
        }

        let still_mapped = frame
            .page()
            .is_some_and(|pgno| page_table.get(&pgno) == Some(&frame_id));
        if !still_mapped {
            // discarded while a handle was outstanding
            frame.reset();
            self.replacer.remove(frame_id);
            self.free_list.lock().push(frame_id);
        } else if !frame.is_dirty() {
            self.replacer.set_evictable(frame_id, true);
        }
    }
}

/// PageCache keeps page images of one connection in memory.
///
/// The capacity is a soft bound: when every frame is pinned or dirty the
/// cache grows instead of failing, because dirty pages may only leave memory
/// through a commit. Clean, unpinned pages are evicted least-recently-used first.
pub struct PageCache {
    capacity: usize,
    state: Arc<CacheState>,
}

impl PageCache {
    /// Creates an empty cache of `capacity` pages using LRU-`k` replacement.
    pub fn new(capacity: usize, k: usize, page_size: usize) -> Self {
        let state = Arc::new(CacheState {
            page_size,
            frames: RwLock::new(Vec::with_capacity(capacity)),
            page_table: Mutex::new(HashMap::new()),
            free_list: Mutex::new(Vec::new()),
            replacer: LruKReplacer::new(k),
        });

        Self {
            capacity: capacity.max(1),
            state,
        }
    }

    /// Returns a pinned read handle if `pgno` is cached.
    pub fn get(&self, pgno: PageNumber) -> Option<PageRef> {
        let page_table = self.state.page_table.lock();
        let frame_id = *page_table.get(&pgno)?;
        let frame = self.pin_frame(frame_id);
        Some(PageRef::new(pgno, frame, self.release_callback()))
    }

    /// Returns a pinned write handle if `pgno` is cached, marking it dirty.
    pub fn get_mut(&self, pgno: PageNumber) -> Option<PageMut> {
        let page_table = self.state.page_table.lock();
        let frame_id = *page_table.get(&pgno)?;
        let frame = self.pin_frame(frame_id);
        frame.set_dirty(true);
        Some(PageMut::new(pgno, frame, self.release_callback()))
    }

    /// Caches a clean copy of `data` as page `pgno` and returns it pinned.
    pub fn insert(&self, pgno: PageNumber, data: &[u8]) -> PageRef {
        let frame = self.install(pgno, data, false);
        PageRef::new(pgno, frame, self.release_callback())
    }

    /// Caches `data` as a dirty page `pgno` and returns it pinned for writing.
    pub fn insert_dirty(&self, pgno: PageNumber, data: &[u8]) -> PageMut {
        let frame = self.install(pgno, data, true);
        PageMut::new(pgno, frame, self.release_callback())
    }

    /// Copies the cached image of `pgno`.
    pub fn copy_page(&self, pgno: PageNumber) -> Option<Vec<u8>> {
        let page_table = self.state.page_table.lock();
        let frame_id = *page_table.get(&pgno)?;
        let frame = self.state.frame(frame_id);
        drop(page_table);
        let data = frame.read_data().to_vec();
        Some(data)
    }

    pub fn is_dirty(&self, pgno: PageNumber) -> bool {
        let page_table = self.state.page_table.lock();
        page_table
            .get(&pgno)
            .is_some_and(|&fid| self.state.frame(fid).is_dirty())
    }

    /// Page numbers of all dirty pages, ascending.
    pub fn dirty_pages(&self) -> Vec<PageNumber> {
        let page_table = self.state.page_table.lock();
        let mut dirty = page_table
            .iter()
            .filter(|(_, fid)| self.state.frame(**fid).is_dirty())
            .map(|(&pgno, _)| pgno)
            .collect::<Vec<_>>();
        dirty.sort();
        dirty
    }

    /// Clears the dirty flag after the page reached the log.
    pub fn mark_clean(&self, pgno: PageNumber) {
        let page_table = self.state.page_table.lock();
        if let Some(&frame_id) = page_table.get(&pgno) {
            let frame = self.state.frame(frame_id);
            frame.set_dirty(false);
            if frame.pin_count() == 0 {
                self.state.replacer.set_evictable(frame_id, true);
            }
        }
    }

    /// Drops `pgno` from the cache, dirty or not. A frame still held by a
    /// handle is recycled when the last handle goes away.
    pub fn discard(&self, pgno: PageNumber) -> bool {
        let mut page_table = self.state.page_table.lock();
        let Some(frame_id) = page_table.remove(&pgno) else {
            return false;
        };
        let frame = self.state.frame(frame_id);
        frame.set_dirty(false);
        if frame.pin_count() == 0 {
            frame.reset();
            self.state.replacer.remove(frame_id);
            self.state.free_list.lock().push(frame_id);
        }
        trace!(pgno = pgno.as_u32(), "discarded cached page");
        true
    }

    /// Drops every cached page.
    pub fn clear(&self) {
        let pages = self
            .state
            .page_table
            .lock()
            .keys()
            .copied()
            .collect::<Vec<_>>();
        for pgno in pages {
            self.discard(pgno);
        }
    }

    /// Returns the pin count for a cached page.
    pub fn get_pin_count(&self, pgno: PageNumber) -> Option<u32> {
        let page_table = self.state.page_table.lock();
        page_table
            .get(&pgno)
            .map(|&fid| self.state.frame(fid).pin_count())
    }

    pub fn contains(&self, pgno: PageNumber) -> bool {
        self.state.page_table.lock().contains_key(&pgno)
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.state.page_table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames allocated, which exceeds the capacity only while
    /// more pages than that are pinned or dirty.
    pub fn frame_count(&self) -> usize {
        self.state.frames.read().len()
    }

    fn release_callback(&self) -> ReleaseCallback {
        let state = Arc::clone(&self.state);
        Box::new(move |frame_id| state.release(frame_id))
    }

    /// Pins a mapped frame. Caller holds the page table lock.
    fn pin_frame(&self, frame_id: FrameId) -> Arc<FrameHeader> {
        let frame = self.state.frame(frame_id);
        frame.pin();
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);
        frame
    }

    /// Maps `pgno` to a frame holding `data` and pins it.
    fn install(&self, pgno: PageNumber, data: &[u8], dirty: bool) -> Arc<FrameHeader> {
        let mut page_table = self.state.page_table.lock();
        let frame_id = match page_table.get(&pgno) {
            Some(&fid) => fid,
            None => {
                let fid = self.obtain_frame(&mut page_table);
                page_table.insert(pgno, fid);
                fid
            }
        };

        let frame = self.state.frame(frame_id);
        frame.copy_from(data);
        frame.set_page(Some(pgno));
        frame.set_dirty(dirty || frame.is_dirty());
        frame.pin();
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);
        frame
    }

    /// Finds an empty frame: free list, then a new frame below capacity, then
    /// an eviction victim, and finally a new frame past the soft bound.
    fn obtain_frame(&self, page_table: &mut HashMap<PageNumber, FrameId>) -> FrameId {
        if let Some(frame_id) = self.state.free_list.lock().pop() {
            return frame_id;
        }

        let frame_count = self.state.frames.read().len();
        if frame_count >= self.capacity {
            if let Some(victim) = self.state.replacer.evict() {
                let frame = self.state.frame(victim);
                if let Some(old) = frame.page() {
                    page_table.remove(&old);
                    trace!(pgno = old.as_u32(), "evicted page");
                }
                frame.reset();
                return victim;
            }
            trace!(frames = frame_count, "page cache over capacity, growing");
        }

        let mut frames = self.state.frames.write();
        let frame_id = FrameId::new(frames.len() as u32);
        frames.push(Arc::new(FrameHeader::new(frame_id, self.state.page_size)));
        frame_id
    }
}
