//! The LRU-K replacement policy.
//!
//! Each tracked frame carries up to `k` access timestamps. A frame
//! observed fewer than `k` times has infinite backward-k-distance and is
//! preferred as a victim over any frame with a full history; ties within
//! either group fall to the smallest retained timestamp.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::FrameId;

struct LruKNode {
    /// Oldest retained access at the front; at most `k` entries.
    history: VecDeque<u64>,
    evictable: bool,
}

struct ReplacerState {
    nodes: HashMap<FrameId, LruKNode>,
    current_timestamp: u64,
    evictable_count: usize,
}

pub struct LruKReplacer {
    state: Mutex<ReplacerState>,
    capacity: usize,
    k: usize,
}

impl LruKReplacer {
    pub fn new(capacity: usize, k: usize) -> Self {
        assert!(k >= 1, "k must be positive");
        LruKReplacer {
            state: Mutex::new(ReplacerState {
                nodes: HashMap::with_capacity(capacity),
                current_timestamp: 0,
                evictable_count: 0,
            }),
            capacity,
            k,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ReplacerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stamps an access on the frame. New frames start out non-evictable;
    /// an access to a new frame is dropped when the replacer is already
    /// tracking its full capacity.
    pub fn record_access(&self, frame_id: FrameId) {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        if !state.nodes.contains_key(&frame_id) && state.nodes.len() == self.capacity {
            return;
        }

        let timestamp = state.current_timestamp;
        state.current_timestamp += 1;

        let node = state.nodes.entry(frame_id).or_insert_with(|| LruKNode {
            history: VecDeque::with_capacity(self.k),
            evictable: false,
        });
        if node.history.len() == self.k {
            node.history.pop_front();
        }
        node.history.push_back(timestamp);
    }

    /// Flips the frame's eviction eligibility. Untracked frames are
    /// ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let Some(node) = state.nodes.get_mut(&frame_id) else {
            return;
        };
        if node.evictable == evictable {
            return;
        }
        node.evictable = evictable;
        if evictable {
            state.evictable_count += 1;
        } else {
            state.evictable_count -= 1;
        }
    }

    /// Drops a frame from tracking. Removing a tracked frame that is not
    /// evictable is a caller bug and aborts the process.
    pub fn remove(&self, frame_id: FrameId) {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let Some(node) = state.nodes.get(&frame_id) else {
            return;
        };
        if !node.evictable {
            panic!("removed non-evictable frame {frame_id} from the replacer");
        }
        state.nodes.remove(&frame_id);
        state.evictable_count -= 1;
    }

    /// The number of evictable frames.
    pub fn size(&self) -> usize {
        self.lock_state().evictable_count
    }

    /// Selects, erases, and returns the victim: frames with infinite
    /// backward-k-distance first, then the oldest front-of-history
    /// timestamp. `None` when nothing is evictable.
    pub fn evict(&self) -> Option<FrameId> {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let victim = state
            .nodes
            .iter()
            .filter(|(_, node)| node.evictable)
            .min_by_key(|(_, node)| (node.history.len() >= self.k, node.history.front().copied()))
            .map(|(&frame_id, _)| frame_id)?;

        state.nodes.remove(&victim);
        state.evictable_count -= 1;
        Some(victim)
    }
}
