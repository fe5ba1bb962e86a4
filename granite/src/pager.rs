use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::failpoint;
use crate::{Page, PageId, PAGE_SIZE};

/// The disk manager: one database file addressed in page-sized blocks.
/// Also serves as the id-space allocator for external collaborators; the
/// buffer pool keeps its own monotonic counter for brand-new pages and
/// defers deallocation here.
pub struct Pager {
    file: File,
    pub num_pages: u32,
}

impl Pager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;
        crate::granite_debug_log!("[Pager::open] {path:?}: {num_pages} pages on disk");

        Ok(Pager { file, num_pages })
    }

    /// Fills a fresh `Page` with the stable-storage contents of `page_id`.
    /// Reads past the end of the file, and the tail of a short read, come
    /// back zeroed, so freshly allocated pages need no explicit extension.
    pub fn read_page(&mut self, page_id: PageId) -> io::Result<Page> {
        failpoint::maybe_fail("pager.read_page")?;

        let mut page = Page::new(page_id);
        if page_id >= self.num_pages {
            return Ok(page);
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let bytes_read = self.file.read(&mut page.data)?;
        if bytes_read < PAGE_SIZE {
            page.data[bytes_read..].fill(0);
        }
        Ok(page)
    }

    /// Persists the page at its offset. Blocking; the file is synced
    /// before returning.
    pub fn write_page(&mut self, page: &Page) -> io::Result<()> {
        failpoint::maybe_fail("pager.write_page")?;

        let offset = page.id as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&page.data)?;
        self.file.sync_all()?;
        if page.id >= self.num_pages {
            self.num_pages = page.id + 1;
        }
        crate::granite_debug_log!("[Pager::write_page] page {} persisted", page.id);
        Ok(())
    }

    /// Hands out the next unused id in the file's page space.
    pub fn allocate_page(&mut self) -> io::Result<PageId> {
        let page_id = self.num_pages;
        self.num_pages += 1;
        Ok(page_id)
    }

    /// Retires an id. There is no free-space map yet, so the block stays
    /// in place and the id is simply forgotten.
    pub fn deallocate_page(&mut self, _page_id: PageId) {}
}
