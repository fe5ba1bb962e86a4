//! The buffer pool: a fixed set of in-memory frames caching disk pages.
//!
//! The pool composes the extendible page directory with the LRU-K
//! replacer. Frame metadata, the free list, and the page-id counter live
//! under a single mutex; page bytes sit behind per-frame locks so pin
//! holders can work a buffer without holding up the pool. Disk transfers
//! are issued while the pool lock is held: between victim selection and
//! the end of the write-back or read-in, no caller can observe a
//! half-bound frame.
//!
//! Lock order is pool state, then page table, then replacer. The pool is
//! the sole caller of the latter two, so no cycle can form.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::hash_table::ExtendibleHashTable;
use crate::page::{Page, INVALID_PAGE_ID};
use crate::pager::Pager;
use crate::replacer::LruKReplacer;
use crate::wal::LogManager;
use crate::{FrameId, PageId};

fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pool sizing knobs. The page size is fixed per process as
/// [`crate::PAGE_SIZE`].
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub pool_size: usize,
    /// How many accesses the replacer remembers per frame.
    pub replacer_k: usize,
    /// Entries per bucket in the page directory.
    pub bucket_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1024,
            replacer_k: 2,
            bucket_capacity: 4,
        }
    }
}

struct FrameMeta {
    /// The resident page, or `None` for free and unused frames.
    page_id: Option<PageId>,
    pin_count: u32,
    is_dirty: bool,
}

struct PoolState {
    meta: Vec<FrameMeta>,
    free_list: VecDeque<FrameId>,
    next_page_id: PageId,
}

/// The buffer pool manager.
pub struct BufferPoolManager {
    frames: Vec<RwLock<Page>>,
    state: Mutex<PoolState>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruKReplacer,
    pub pager: Mutex<Pager>,
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    pub fn new(
        pager: Pager,
        config: BufferPoolConfig,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        assert!(config.pool_size > 0, "pool must hold at least one frame");

        let mut frames = Vec::with_capacity(config.pool_size);
        let mut meta = Vec::with_capacity(config.pool_size);
        let mut free_list = VecDeque::with_capacity(config.pool_size);
        for frame_id in 0..config.pool_size {
            frames.push(RwLock::new(Page::new(INVALID_PAGE_ID)));
            meta.push(FrameMeta {
                page_id: None,
                pin_count: 0,
                is_dirty: false,
            });
            free_list.push_back(frame_id);
        }

        BufferPoolManager {
            frames,
            state: Mutex::new(PoolState {
                meta,
                free_list,
                next_page_id: 0,
            }),
            page_table: ExtendibleHashTable::new(config.bucket_capacity),
            replacer: LruKReplacer::new(config.pool_size, config.replacer_k),
            pager: Mutex::new(pager),
            log_manager,
        }
    }

    /// The recovery handle this pool was built with. The pool itself
    /// never writes log records.
    pub fn log_manager(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref()
    }

    /// Allocates and pins a brand-new zeroed page. `None` when the free
    /// list is empty and nothing can be evicted.
    pub fn new_page(&self) -> Option<PageRef<'_>> {
        let mut guard = lock_mutex_recover(&self.state);
        let state = &mut *guard;

        let frame_id = self.acquire_frame(state)?;
        let page_id = state.next_page_id;
        state.next_page_id += 1;

        self.frames[frame_id].write().reset(page_id);
        self.bind_frame(state, frame_id, page_id);

        crate::granite_debug_log!("[BufferPool] new page {page_id} in frame {frame_id}");
        Some(PageRef {
            pool: self,
            page_id,
            frame_id,
        })
    }

    /// Pins the page, reading it from disk on a miss. `None` when the
    /// page is absent and no frame can be acquired.
    pub fn fetch_page(&self, page_id: PageId) -> Option<PageRef<'_>> {
        let mut guard = lock_mutex_recover(&self.state);
        let state = &mut *guard;

        if let Some(frame_id) = self.page_table.find(&page_id) {
            state.meta[frame_id].pin_count += 1;
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Some(PageRef {
                pool: self,
                page_id,
                frame_id,
            });
        }

        let frame_id = self.acquire_frame(state)?;
        let page = match lock_mutex_recover(&self.pager).read_page(page_id) {
            Ok(page) => page,
            Err(err) => panic!("read of page {page_id} failed: {err}"),
        };
        *self.frames[frame_id].write() = page;
        self.bind_frame(state, frame_id, page_id);

        crate::granite_debug_log!("[BufferPool] fetched page {page_id} into frame {frame_id}");
        Some(PageRef {
            pool: self,
            page_id,
            frame_id,
        })
    }

    /// Releases one pin. The caller's dirty bit is merged in, never
    /// cleared. False when the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut guard = lock_mutex_recover(&self.state);
        let state = &mut *guard;

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let meta = &mut state.meta[frame_id];
        if meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Writes the page out regardless of pin count and marks the frame
    /// clean. False when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> bool {
        let mut guard = lock_mutex_recover(&self.state);
        let state = &mut *guard;

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        self.write_frame_to_disk(frame_id);
        state.meta[frame_id].is_dirty = false;
        true
    }

    /// Flushes every resident page.
    pub fn flush_all_pages(&self) {
        let mut guard = lock_mutex_recover(&self.state);
        let state = &mut *guard;

        for frame_id in 0..state.meta.len() {
            if state.meta[frame_id].page_id.is_some() {
                self.write_frame_to_disk(frame_id);
                state.meta[frame_id].is_dirty = false;
            }
        }
    }

    /// Retires the page id and, when the page is resident and unpinned,
    /// releases its frame. False only for resident pinned pages.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut guard = lock_mutex_recover(&self.state);
        let state = &mut *guard;

        lock_mutex_recover(&self.pager).deallocate_page(page_id);

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return true;
        };
        if state.meta[frame_id].pin_count > 0 {
            return false;
        }
        if state.meta[frame_id].is_dirty {
            self.write_frame_to_disk(frame_id);
        }
        state.meta[frame_id] = FrameMeta {
            page_id: None,
            pin_count: 0,
            is_dirty: false,
        };
        self.replacer.remove(frame_id);
        self.page_table.remove(&page_id);
        state.free_list.push_back(frame_id);

        crate::granite_debug_log!("[BufferPool] deleted page {page_id}, frame {frame_id} freed");
        true
    }

    /// Pops a free frame, or evicts a victim. Dirty victims are written
    /// back before their directory binding disappears. `None` when every
    /// frame is pinned.
    fn acquire_frame(&self, state: &mut PoolState) -> Option<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Some(frame_id);
        }

        let victim = self.replacer.evict()?;
        let meta = &mut state.meta[victim];
        if let Some(old_page_id) = meta.page_id.take() {
            if meta.is_dirty {
                self.write_frame_to_disk(victim);
            }
            self.page_table.remove(&old_page_id);
            crate::granite_debug_log!("[BufferPool] evicted page {old_page_id} from frame {victim}");
        }
        meta.pin_count = 0;
        meta.is_dirty = false;
        Some(victim)
    }

    /// Binds a freshly loaded frame: directory entry, one pin, clean,
    /// recorded and protected from eviction.
    fn bind_frame(&self, state: &mut PoolState, frame_id: FrameId, page_id: PageId) {
        state.meta[frame_id] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
            is_dirty: false,
        };
        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);
    }

    /// Disk failures here are environmental and unrecoverable: abort with
    /// the error rather than hand out a frame in an unknown state.
    fn write_frame_to_disk(&self, frame_id: FrameId) {
        let frame = self.frames[frame_id].read();
        if let Err(err) = lock_mutex_recover(&self.pager).write_page(&frame) {
            panic!("write-back of page {} failed: {err}", frame.id);
        }
    }
}

/// A pinned page. Holding one is the permission to touch the frame
/// buffer. The pin is released through
/// [`BufferPoolManager::unpin_page`], not on drop, because the caller
/// must say whether it dirtied the page.
pub struct PageRef<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    frame_id: FrameId,
}

impl<'a> PageRef<'a> {
    pub fn id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.pool.frames[self.frame_id].read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.pool.frames[self.frame_id].write()
    }

    pub fn pin_count(&self) -> u32 {
        lock_mutex_recover(&self.pool.state).meta[self.frame_id].pin_count
    }

    pub fn is_dirty(&self) -> bool {
        lock_mutex_recover(&self.pool.state).meta[self.frame_id].is_dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn test_pool(pool_size: usize, dir: &TempDir) -> BufferPoolManager {
        let pager = Pager::open(dir.path().join("test.db")).unwrap();
        let config = BufferPoolConfig {
            pool_size,
            replacer_k: 2,
            bucket_capacity: 4,
        };
        BufferPoolManager::new(pager, config, None)
    }

    #[test]
    fn exhausted_pool_recovers_after_unpin() {
        let dir = tempdir().unwrap();
        let pool = test_pool(2, &dir);

        let p0 = pool.new_page().unwrap();
        assert_eq!(p0.id(), 0);
        assert_eq!(p0.pin_count(), 1);
        let p1 = pool.new_page().unwrap();
        assert_eq!(p1.id(), 1);

        // Both frames pinned: no free frame, nothing evictable.
        assert!(pool.new_page().is_none());

        assert!(pool.unpin_page(0, false));
        let p2 = pool.new_page().unwrap();
        assert_eq!(p2.id(), 2);
    }

    #[test]
    fn fetch_hit_stacks_pins() {
        let dir = tempdir().unwrap();
        let pool = test_pool(2, &dir);

        let page = pool.new_page().unwrap();
        let page_id = page.id();
        assert!(pool.unpin_page(page_id, false));

        let first = pool.fetch_page(page_id).unwrap();
        let second = pool.fetch_page(page_id).unwrap();
        assert_eq!(second.pin_count(), 2);

        assert!(pool.unpin_page(page_id, false));
        assert_eq!(first.pin_count(), 1);
        assert!(pool.unpin_page(page_id, false));
        assert!(!pool.unpin_page(page_id, false));

        // Pin count zero again: the page can now be evicted to make room.
        let _ = pool.new_page().unwrap();
        let replacement = pool.new_page().unwrap();
        assert!(replacement.id() > page_id);
    }

    #[test]
    fn unpin_of_absent_page_fails() {
        let dir = tempdir().unwrap();
        let pool = test_pool(2, &dir);

        assert!(!pool.unpin_page(99, false));
        assert!(!pool.flush_page(99));
    }

    #[test]
    fn dirty_bit_merges_and_never_clears_on_unpin() {
        let dir = tempdir().unwrap();
        let pool = test_pool(2, &dir);

        let page = pool.new_page().unwrap();
        let page_id = page.id();
        assert!(!page.is_dirty());
        assert!(pool.unpin_page(page_id, true));

        let again = pool.fetch_page(page_id).unwrap();
        assert!(again.is_dirty());
        // A clean unpin must not wash out the earlier dirty one.
        assert!(pool.unpin_page(page_id, false));
        assert!(pool.flush_page(page_id));

        let again = pool.fetch_page(page_id).unwrap();
        assert!(!again.is_dirty());
        pool.unpin_page(page_id, false);
    }
}
