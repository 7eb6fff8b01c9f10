#![forbid(unsafe_code)]
//! Page model and user-memory pinning.
//!
//! The engine moves data through fixed-size pages. User memory is a
//! page-granular address space behind the [`UserMemory`] trait; pinning a
//! batch of pages hands out [`PageRef`] handles whose clone/drop pair *is*
//! the pin/release protocol — a page cannot be released twice or leak a pin
//! without leaking the handle itself.
//!
//! A single shared read-only zero page ([`zero_page`]) stands in for user
//! memory in two places: sub-block zero-fill of newly allocated blocks, and
//! covering already-reserved blocks after a pin fault during a write.

use dio_error::{DioError, Result};
use dio_types::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// A page-sized buffer with pin accounting.
///
/// `pins` counts outstanding [`PageRef`] handles; `dirty` records that a
/// device read landed in this page (the read side of the page-cache
/// "set_page_dirty" contract).
pub struct Page {
    data: Mutex<Vec<u8>>,
    pins: AtomicUsize,
    dirty: AtomicBool,
    read_only: bool,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("pins", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Page {
    /// Allocate a zeroed, writable page.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0_u8; PAGE_SIZE]),
            pins: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            read_only: false,
        })
    }

    fn new_read_only_zeroed() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0_u8; PAGE_SIZE]),
            pins: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            read_only: true,
        })
    }

    /// Copy `out.len()` bytes out of the page starting at `offset`.
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) {
        let data = self.data.lock();
        out.copy_from_slice(&data[offset..offset + out.len()]);
    }

    /// Copy `src` into the page starting at `offset`.
    ///
    /// The shared zero page is read-only; writing to it is a protocol
    /// violation, not an I/O error.
    pub fn copy_in(&self, offset: usize, src: &[u8]) {
        assert!(!self.read_only, "write to the shared zero page");
        let mut data = self.data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero_range(&self, offset: usize, len: usize) {
        assert!(!self.read_only, "write to the shared zero page");
        let mut data = self.data.lock();
        data[offset..offset + len].fill(0);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Number of outstanding pins.
    #[must_use]
    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_zero_page(&self) -> bool {
        self.read_only
    }
}

/// A pinned reference to a [`Page`].
///
/// Cloning takes another pin; dropping releases one. Release-exactly-once
/// is therefore structural: there is no separate "unpin" call to forget or
/// to double-invoke.
pub struct PageRef {
    page: Arc<Page>,
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef").field("page", &*self.page).finish()
    }
}

impl PageRef {
    /// Pin `page`.
    #[must_use]
    pub fn pin(page: &Arc<Page>) -> Self {
        page.pins.fetch_add(1, Ordering::AcqRel);
        Self { page: Arc::clone(page) }
    }

    /// Whether two references pin the same page.
    #[must_use]
    pub fn same_page(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.page, &other.page)
    }
}

impl Clone for PageRef {
    fn clone(&self) -> Self {
        Self::pin(&self.page)
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.page.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::ops::Deref for PageRef {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

/// The shared read-only zero page.
#[must_use]
pub fn zero_page() -> PageRef {
    static ZERO: OnceLock<Arc<Page>> = OnceLock::new();
    PageRef::pin(ZERO.get_or_init(Page::new_read_only_zeroed))
}

/// One scatter/gather segment of a direct I/O request: a user-space address
/// and a byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub base: u64,
    pub len: u64,
}

/// Pinnable user memory.
///
/// The engine never touches user memory directly; it pins batches of pages
/// through this trait and reads or fills the pinned pages.
pub trait UserMemory: Send + Sync {
    /// Pin up to `max` pages starting at the page containing `addr`.
    ///
    /// Returns at least one page on success. `Err(DioError::PageFault)`
    /// when `addr` does not map to pinnable memory.
    fn pin_pages(&self, addr: u64, max: usize) -> Result<Vec<PageRef>>;
}

/// Page-backed user memory: a contiguous region of `len` bytes starting at
/// address `base`, stored as real pages so pinning is zero-copy.
pub struct PageUserMemory {
    base: u64,
    len: u64,
    pages: Vec<Arc<Page>>,
    granted: Mutex<Vec<usize>>,
}

impl std::fmt::Debug for PageUserMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageUserMemory")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("pages", &self.pages.len())
            .finish()
    }
}

impl PageUserMemory {
    /// Create a region of `len` bytes at address `base` (`base` need not be
    /// page aligned).
    #[must_use]
    pub fn new(base: u64, len: u64) -> Self {
        let first = base >> PAGE_SHIFT;
        let last = if len == 0 { first } else { (base + len - 1) >> PAGE_SHIFT };
        let count = usize::try_from(last - first + 1).unwrap_or(0);
        Self {
            base,
            len,
            pages: (0..count).map(|_| Page::new()).collect(),
            granted: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sizes of the pin batches granted so far, in order.
    #[must_use]
    pub fn pin_batches(&self) -> Vec<usize> {
        self.granted.lock().clone()
    }

    /// True when no page in the region is pinned.
    #[must_use]
    pub fn all_pins_released(&self) -> bool {
        self.pages.iter().all(|p| p.pin_count() == 0)
    }

    fn page_index(&self, addr: u64) -> Option<usize> {
        if addr < self.base || addr >= self.base + self.len {
            return None;
        }
        usize::try_from((addr >> PAGE_SHIFT) - (self.base >> PAGE_SHIFT)).ok()
    }

    /// Copy `data` into the region at `addr` (test/setup helper).
    pub fn write(&self, addr: u64, data: &[u8]) {
        let mut addr = addr;
        let mut data = data;
        while !data.is_empty() {
            let idx = self.page_index(addr).expect("address in region");
            let in_page = usize::try_from(addr & PAGE_MASK).unwrap_or(0);
            let take = data.len().min(PAGE_SIZE - in_page);
            self.pages[idx].copy_in(in_page, &data[..take]);
            addr += take as u64;
            data = &data[take..];
        }
    }

    /// Copy `len` bytes out of the region at `addr` (test/verify helper).
    #[must_use]
    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0_u8; len];
        let mut addr = addr;
        let mut filled = 0;
        while filled < len {
            let idx = self.page_index(addr).expect("address in region");
            let in_page = usize::try_from(addr & PAGE_MASK).unwrap_or(0);
            let take = (len - filled).min(PAGE_SIZE - in_page);
            self.pages[idx].copy_out(in_page, &mut out[filled..filled + take]);
            addr += take as u64;
            filled += take;
        }
        out
    }
}

impl UserMemory for PageUserMemory {
    fn pin_pages(&self, addr: u64, max: usize) -> Result<Vec<PageRef>> {
        let Some(first) = self.page_index(addr) else {
            return Err(DioError::PageFault);
        };
        let count = max.min(self.pages.len() - first);
        if count == 0 {
            return Err(DioError::PageFault);
        }
        self.granted.lock().push(count);
        Ok(self.pages[first..first + count]
            .iter()
            .map(PageRef::pin)
            .collect())
    }
}

/// User memory that faults from a given page onward. Pages before the fault
/// boundary pin normally; any batch starting at or past it faults.
pub struct FaultingMemory {
    inner: PageUserMemory,
    fault_page: usize,
}

impl FaultingMemory {
    #[must_use]
    pub fn new(inner: PageUserMemory, fault_page: usize) -> Self {
        Self { inner, fault_page }
    }

    #[must_use]
    pub fn inner(&self) -> &PageUserMemory {
        &self.inner
    }
}

impl UserMemory for FaultingMemory {
    fn pin_pages(&self, addr: u64, max: usize) -> Result<Vec<PageRef>> {
        let Some(first) = self.inner.page_index(addr) else {
            return Err(DioError::PageFault);
        };
        if first >= self.fault_page {
            return Err(DioError::PageFault);
        }
        let max = max.min(self.fault_page - first);
        self.inner.pin_pages(addr, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ref_pins_and_releases() {
        let page = Page::new();
        assert_eq!(page.pin_count(), 0);
        let a = PageRef::pin(&page);
        let b = a.clone();
        assert_eq!(page.pin_count(), 2);
        drop(a);
        assert_eq!(page.pin_count(), 1);
        drop(b);
        assert_eq!(page.pin_count(), 0);
    }

    #[test]
    fn zero_page_is_shared_and_read_only() {
        let a = zero_page();
        let b = zero_page();
        assert!(a.same_page(&b));
        assert!(a.is_zero_page());
        let mut buf = [0xFF_u8; 16];
        a.copy_out(100, &mut buf);
        assert_eq!(buf, [0_u8; 16]);
    }

    #[test]
    #[should_panic(expected = "zero page")]
    fn zero_page_rejects_writes() {
        zero_page().copy_in(0, &[1, 2, 3]);
    }

    #[test]
    fn region_write_read_roundtrip_across_pages() {
        let mem = PageUserMemory::new(0x1000, 3 * PAGE_SIZE as u64);
        let data: Vec<u8> = (0..PAGE_SIZE * 2).map(|i| (i % 251) as u8).collect();
        mem.write(0x1800, &data);
        assert_eq!(mem.read(0x1800, data.len()), data);
    }

    #[test]
    fn pin_pages_clamps_to_region_end() {
        let mem = PageUserMemory::new(0, 3 * PAGE_SIZE as u64);
        let pages = mem.pin_pages(PAGE_SIZE as u64, 64).expect("pin");
        assert_eq!(pages.len(), 2);
        assert_eq!(mem.pin_batches(), vec![2]);
        drop(pages);
        assert!(mem.all_pins_released());
    }

    #[test]
    fn pin_pages_outside_region_faults() {
        let mem = PageUserMemory::new(0, PAGE_SIZE as u64);
        assert!(matches!(
            mem.pin_pages(2 * PAGE_SIZE as u64, 1),
            Err(DioError::PageFault)
        ));
    }

    #[test]
    fn unaligned_base_spans_extra_page() {
        // 100 bytes starting 8 bytes before a page boundary.
        let base = PAGE_SIZE as u64 - 8;
        let mem = PageUserMemory::new(base, 100);
        let pages = mem.pin_pages(base, 64).expect("pin");
        assert_eq!(pages.len(), 2);
    }

    #[test]
    fn faulting_memory_grants_then_faults() {
        let mem = FaultingMemory::new(PageUserMemory::new(0, 4 * PAGE_SIZE as u64), 2);
        let pages = mem.pin_pages(0, 64).expect("pin");
        assert_eq!(pages.len(), 2);
        assert!(matches!(
            mem.pin_pages(2 * PAGE_SIZE as u64, 64),
            Err(DioError::PageFault)
        ));
    }
}
