use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::{Result, SombraError};

use super::records::Record;

/// One page of fixed record slots.
pub struct RecordPage<R> {
    slots: RwLock<Vec<R>>,
}

impl<R: Record> RecordPage<R> {
    fn new(slots: usize) -> Self {
        Self {
            slots: RwLock::new(vec![R::default(); slots]),
        }
    }
}

/// Paged record file with a monotonically growing high mark.
///
/// Ids are handed out in order and never reused; a slot whose record is not in
/// use reads as a hole.
pub struct RecordFile<R> {
    name: &'static str,
    pages: RwLock<Vec<Arc<RecordPage<R>>>>,
    per_page: usize,
    high_id: AtomicU64,
    live: AtomicU64,
    alloc: Mutex<()>,
}

impl<R: Record> RecordFile<R> {
    /// Creates an empty file with `per_page` slots per page.
    pub fn new(name: &'static str, per_page: usize) -> Self {
        Self {
            name,
            pages: RwLock::new(Vec::new()),
            per_page: per_page.max(1),
            high_id: AtomicU64::new(0),
            live: AtomicU64::new(0),
            alloc: Mutex::new(()),
        }
    }

    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Highest id handed out plus one.
    pub fn high_id(&self) -> u64 {
        self.high_id.load(Ordering::Acquire)
    }

    /// Number of records currently in use.
    pub fn live_count(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    /// Slots per page.
    pub fn per_page(&self) -> usize {
        self.per_page
    }

    /// Stores `record` under a fresh id and publishes the new high mark.
    pub fn append(&self, record: R) -> u64 {
        let _alloc = self.alloc.lock();
        let id = self.high_id.load(Ordering::Relaxed);
        let page_no = (id / self.per_page as u64) as usize;
        {
            let mut pages = self.pages.write();
            while pages.len() <= page_no {
                pages.push(Arc::new(RecordPage::new(self.per_page)));
            }
        }
        if record.in_use() {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        let page = self.pages.read()[page_no].clone();
        page.slots.write()[(id % self.per_page as u64) as usize] = record;
        self.high_id.store(id + 1, Ordering::Release);
        id
    }

    /// Overwrites the record at `id`.
    pub fn update(&self, id: u64, record: R) -> Result<()> {
        let page = self
            .page(id)
            .ok_or(SombraError::Corruption("record update beyond high mark"))?;
        let mut slots = page.slots.write();
        let slot = &mut slots[(id % self.per_page as u64) as usize];
        match (slot.in_use(), record.in_use()) {
            (false, true) => {
                self.live.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.live.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
        *slot = record;
        Ok(())
    }

    /// Reads a copy of the record at `id`; `None` past the high mark.
    pub fn get(&self, id: u64) -> Option<R> {
        let page = self.page(id)?;
        let slots = page.slots.read();
        Some(slots[(id % self.per_page as u64) as usize].clone())
    }

    /// Reads a live record or fails with `NotFound`.
    pub fn get_live(&self, id: u64) -> Result<R> {
        match self.get(id) {
            Some(record) if record.in_use() => Ok(record),
            _ => Err(SombraError::NotFound),
        }
    }

    fn page(&self, id: u64) -> Option<Arc<RecordPage<R>>> {
        if id >= self.high_id() {
            return None;
        }
        let page_no = (id / self.per_page as u64) as usize;
        self.pages.read().get(page_no).cloned()
    }
}

/// A cursor's private handle on the page it is currently reading.
pub struct PageCursor<R> {
    page: Option<Arc<RecordPage<R>>>,
    page_no: u64,
}

impl<R> Default for PageCursor<R> {
    fn default() -> Self {
        Self {
            page: None,
            page_no: u64::MAX,
        }
    }
}

impl<R: Record> PageCursor<R> {
    /// Copies the record at `id` into `out`. Returns false past the high mark.
    pub fn read(&mut self, file: &RecordFile<R>, id: u64, out: &mut R) -> bool {
        if id >= file.high_id() {
            return false;
        }
        let page_no = id / file.per_page as u64;
        if self.page.is_none() || self.page_no != page_no {
            match file.page(id) {
                Some(page) => {
                    self.page = Some(page);
                    self.page_no = page_no;
                }
                None => return false,
            }
        }
        match &self.page {
            Some(page) => {
                let slots = page.slots.read();
                out.clone_from(&slots[(id % file.per_page as u64) as usize]);
                true
            }
            None => false,
        }
    }

    /// Drops the pinned page.
    pub fn release(&mut self) {
        self.page = None;
        self.page_no = u64::MAX;
    }
}
