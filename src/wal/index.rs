use std::collections::{BTreeMap, HashMap};

use crate::common::{FrameNumber, PageNumber};

use super::WalChecksum;

/// What the index remembers about one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    pub pgno: PageNumber,
    /// Nonzero for commit frames
    pub db_size: u32,
    /// Running checksum through the end of this frame
    pub checksum: WalChecksum,
}

/// In-memory map from page numbers to the log frames holding them, rebuilt
/// by scanning the log file.
#[derive(Debug, Default)]
pub struct WalIndex {
    /// Entry for frame N lives at N - 1
    frames: Vec<FrameEntry>,
    /// Frames of each page, ascending
    pages: HashMap<PageNumber, Vec<FrameNumber>>,
}

impl WalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed frames.
    pub fn len(&self) -> FrameNumber {
        self.frames.len() as FrameNumber
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Records the next frame and returns its number.
    pub fn push(&mut self, entry: FrameEntry) -> FrameNumber {
        self.frames.push(entry);
        let frame = self.len();
        self.pages.entry(entry.pgno).or_default().push(frame);
        frame
    }

    pub fn entry(&self, frame: FrameNumber) -> Option<&FrameEntry> {
        if frame == 0 {
            return None;
        }
        self.frames.get(frame as usize - 1)
    }

    /// Drops every frame after `max_frame`.
    pub fn truncate(&mut self, max_frame: FrameNumber) {
        if max_frame >= self.len() {
            return;
        }
        for entry in &self.frames[max_frame as usize..] {
            if let Some(list) = self.pages.get_mut(&entry.pgno) {
                list.retain(|&f| f <= max_frame);
                if list.is_empty() {
                    self.pages.remove(&entry.pgno);
                }
            }
        }
        self.frames.truncate(max_frame as usize);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.pages.clear();
    }

    /// Most recent frame at or below `max_frame` holding `pgno`.
    pub fn find(&self, pgno: PageNumber, max_frame: FrameNumber) -> Option<FrameNumber> {
        let list = self.pages.get(&pgno)?;
        let visible = list.partition_point(|&f| f <= max_frame);
        visible.checked_sub(1).map(|i| list[i])
    }

    /// Pages written by frames in `(after, through]`.
    pub fn pages_between(&self, after: FrameNumber, through: FrameNumber) -> Vec<PageNumber> {
        let end = (through as usize).min(self.frames.len());
        let start = (after as usize).min(end);
        let mut pages = self.frames[start..end]
            .iter()
            .map(|e| e.pgno)
            .collect::<Vec<_>>();
        pages.sort();
        pages.dedup();
        pages
    }

    /// Latest frame of every page written in `(after, through]`, ordered by
    /// page number.
    pub fn latest_frames(&self, after: FrameNumber, through: FrameNumber) -> Vec<(PageNumber, FrameNumber)> {
        let end = (through as usize).min(self.frames.len());
        let start = (after as usize).min(end);
        let mut latest = BTreeMap::new();
        for (i, entry) in self.frames[start..end].iter().enumerate() {
            latest.insert(entry.pgno, (start + i + 1) as FrameNumber);
        }
        latest.into_iter().collect()
    }
}
