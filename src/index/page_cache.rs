//! Bounded LRU page cache shared by all random-access index reads.
//!
//! A cache miss reads exactly one page from disk; no lookup ever scans a
//! file. The cache is owned by the Snapshot that created it, never global.

use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

pub const PAGE_SIZE: usize = 64 * 1024;
const MIN_PAGES: usize = 16;

pub struct PageCache {
    pages: Mutex<LruCache<(u8, u64), Arc<Vec<u8>>>>,
}

impl PageCache {
    /// Build a cache holding at most `capacity_bytes` worth of pages (with a
    /// small floor so tiny budgets still function).
    pub fn new(capacity_bytes: usize) -> Self {
        let page_count = (capacity_bytes / PAGE_SIZE).max(MIN_PAGES);
        PageCache {
            pages: Mutex::new(LruCache::new(
                NonZeroUsize::new(page_count).expect("page count has a non-zero floor"),
            )),
        }
    }

    fn page(
        &self,
        file_id: u8,
        file: &File,
        file_len: u64,
        page_no: u64,
    ) -> io::Result<Arc<Vec<u8>>> {
        if let Some(page) = self.pages.lock().get(&(file_id, page_no)) {
            return Ok(Arc::clone(page));
        }
        let start = page_no * PAGE_SIZE as u64;
        let len = (PAGE_SIZE as u64).min(file_len.saturating_sub(start)) as usize;
        let mut buffer = vec![0u8; len];
        file.read_exact_at(&mut buffer, start)?;
        let page = Arc::new(buffer);
        self.pages.lock().put((file_id, page_no), Arc::clone(&page));
        Ok(page)
    }

    /// Fill `out` from `file` starting at `offset`, touching only the pages
    /// the range spans.
    pub fn read(
        &self,
        file_id: u8,
        file: &File,
        file_len: u64,
        offset: u64,
        out: &mut [u8],
    ) -> io::Result<()> {
        if offset + out.len() as u64 > file_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of index file",
            ));
        }
        let mut copied = 0usize;
        while copied < out.len() {
            let absolute = offset + copied as u64;
            let page_no = absolute / PAGE_SIZE as u64;
            let within = (absolute % PAGE_SIZE as u64) as usize;
            let page = self.page(file_id, file, file_len, page_no)?;
            let take = (page.len() - within).min(out.len() - copied);
            out[copied..copied + take].copy_from_slice(&page[within..within + take]);
            copied += take;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_span_page_boundaries() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..(PAGE_SIZE * 2 + 100)).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let cache = PageCache::new(0); // floor still gives a working cache
        let file = tmp.reopen().unwrap();
        let file_len = data.len() as u64;

        let mut out = vec![0u8; 300];
        let start = PAGE_SIZE - 150;
        cache
            .read(0, &file, file_len, start as u64, &mut out)
            .unwrap();
        assert_eq!(&out[..], &data[start..start + 300]);
    }

    #[test]
    fn read_past_eof_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1, 2, 3]).unwrap();
        let cache = PageCache::new(PAGE_SIZE);
        let file = tmp.reopen().unwrap();
        let mut out = vec![0u8; 4];
        assert!(cache.read(0, &file, 3, 0, &mut out).is_err());
    }
}
