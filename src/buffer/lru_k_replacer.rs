use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::{FrameId, Timestamp};

/// Access history of one cache frame
#[derive(Debug, Default)]
struct AccessHistory {
    /// Last k access timestamps, oldest first
    accesses: VecDeque<Timestamp>,
    evictable: bool,
}

impl AccessHistory {
    fn record(&mut self, now: Timestamp, k: usize) {
        self.accesses.push_back(now);
        while self.accesses.len() > k {
            self.accesses.pop_front();
        }
    }

    /// Backward k-distance, or None (+inf) with fewer than k recorded accesses.
    fn k_distance(&self, now: Timestamp, k: usize) -> Option<Timestamp> {
        if self.accesses.len() < k {
            None
        } else {
            Some(now - self.accesses[self.accesses.len() - k])
        }
    }

    fn oldest(&self) -> Timestamp {
        self.accesses.front().copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct ReplacerState {
    now: Timestamp,
    frames: HashMap<FrameId, AccessHistory>,
    evictable: usize,
}

/// LRU-K replacement policy for the page cache.
///
/// Evicts the evictable frame with the largest backward k-distance. Frames
/// with fewer than k accesses have infinite distance and go first, oldest
/// access first. With k = 1 this is plain least-recently-used.
pub struct LruKReplacer {
    k: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(1),
            state: Mutex::new(ReplacerState::default()),
        }
    }

    /// Picks and forgets a victim frame, or None if nothing is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        if state.evictable == 0 {
            return None;
        }

        let now = state.now;
        let victim = state
            .frames
            .iter()
            .filter(|(_, history)| history.evictable)
            .max_by(|(_, a), (_, b)| {
                match (a.k_distance(now, self.k), b.k_distance(now, self.k)) {
                    (None, None) => b.oldest().cmp(&a.oldest()),
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (Some(da), Some(db)) => da.cmp(&db),
                }
            })
            .map(|(frame_id, _)| *frame_id)?;

        state.frames.remove(&victim);
        state.evictable -= 1;
        Some(victim)
    }

    /// Records an access to `frame_id` at the current logical time.
    pub fn record_access(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let now = state.now;
        state.now += 1;
        state
            .frames
            .entry(frame_id)
            .or_default()
            .record(now, self.k);
    }

    /// Marks a tracked frame as evictable or pinned.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut state = self.state.lock();
        let changed = match state.frames.get_mut(&frame_id) {
            Some(history) if history.evictable != evictable => {
                history.evictable = evictable;
                true
            }
            _ => false,
        };
        if changed {
            if evictable {
                state.evictable += 1;
            } else {
                state.evictable -= 1;
            }
        }
    }

    /// Stops tracking a frame.
    pub fn remove(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        if let Some(history) = state.frames.remove(&frame_id) {
            if history.evictable {
                state.evictable -= 1;
            }
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.state.lock().evictable
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_k_replacer_evict_empty() {
        let replacer = LruKReplacer::new(2);
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_k_one_is_lru() {
        let replacer = LruKReplacer::new(1);
        for id in 0..3 {
            replacer.record_access(FrameId::new(id));
            replacer.set_evictable(FrameId::new(id), true);
        }
        // touch frame 0 again so frame 1 becomes least recent
        replacer.record_access(FrameId::new(0));

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_untracked_frame_cannot_become_evictable() {
        let replacer = LruKReplacer::new(1);
        replacer.set_evictable(FrameId::new(4), true);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_infinite_distance_goes_first() {
        let replacer = LruKReplacer::new(2);
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    }
}
