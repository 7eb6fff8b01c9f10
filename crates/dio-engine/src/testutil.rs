//! In-memory fixtures for engine tests: a file stub with call recording, a
//! bitmap-backed block mapper, and a counting completion callback.

use crate::{BlockMap, DioComplete, DioFile, MappedRun};
use dio_error::{DioError, Result};
use dio_types::NativeBlock;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// File stub: a size, a real (blocking) lock, and recorders for every call
/// the engine makes.
pub(crate) struct MemFile {
    size: Mutex<u64>,
    locked: Mutex<bool>,
    released: Condvar,
    lock_calls: AtomicUsize,
    unlock_calls: AtomicUsize,
    flush_calls: Mutex<Vec<(u64, u64)>>,
    truncate_calls: Mutex<Vec<u64>>,
}

impl MemFile {
    pub(crate) fn new(size: u64) -> Self {
        Self {
            size: Mutex::new(size),
            locked: Mutex::new(false),
            released: Condvar::new(),
            lock_calls: AtomicUsize::new(0),
            unlock_calls: AtomicUsize::new(0),
            flush_calls: Mutex::new(Vec::new()),
            truncate_calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    pub(crate) fn lock_calls(&self) -> usize {
        self.lock_calls.load(Ordering::Acquire)
    }

    pub(crate) fn unlock_calls(&self) -> usize {
        self.unlock_calls.load(Ordering::Acquire)
    }

    pub(crate) fn flush_calls(&self) -> Vec<(u64, u64)> {
        self.flush_calls.lock().clone()
    }

    pub(crate) fn truncate_calls(&self) -> Vec<u64> {
        self.truncate_calls.lock().clone()
    }
}

impl DioFile for MemFile {
    fn size(&self) -> u64 {
        *self.size.lock()
    }

    fn truncate(&self, size: u64) -> Result<()> {
        *self.size.lock() = size;
        self.truncate_calls.lock().push(size);
        Ok(())
    }

    fn flush_cached(&self, offset: u64, len: u64) -> Result<()> {
        self.flush_calls.lock().push((offset, len));
        Ok(())
    }

    fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.released.wait(&mut locked);
        }
        *locked = true;
        self.lock_calls.fetch_add(1, Ordering::AcqRel);
    }

    fn unlock(&self) {
        *self.locked.lock() = false;
        self.unlock_calls.fetch_add(1, Ordering::AcqRel);
        self.released.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapCall {
    pub(crate) start: u64,
    pub(crate) max: u64,
    pub(crate) create: bool,
}

/// Identity-mapped extent mapper: file native block `n` lives at device
/// native block `n` once allocated. Allocation state is a bitmap; runs stop
/// at allocation-state changes and at configured boundary blocks.
pub(crate) struct TestMapper {
    native_shift: u32,
    allocated: Mutex<BTreeSet<u64>>,
    boundaries: Mutex<BTreeSet<u64>>,
    fail_from: Mutex<Option<u64>>,
    calls: Mutex<Vec<MapCall>>,
}

impl TestMapper {
    pub(crate) fn new(native_shift: u32) -> Self {
        Self {
            native_shift,
            allocated: Mutex::new(BTreeSet::new()),
            boundaries: Mutex::new(BTreeSet::new()),
            fail_from: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Pre-allocate a range of native blocks (an existing extent).
    pub(crate) fn allocate(&self, range: Range<u64>) {
        let mut allocated = self.allocated.lock();
        for block in range {
            allocated.insert(block);
        }
    }

    /// Mark `block` as a boundary: any run ends there and carries the flag.
    pub(crate) fn set_boundary(&self, block: u64) {
        self.boundaries.lock().insert(block);
    }

    /// Fail every lookup starting at or past `block`.
    pub(crate) fn fail_from(&self, block: u64) {
        *self.fail_from.lock() = Some(block);
    }

    pub(crate) fn is_allocated(&self, block: u64) -> bool {
        self.allocated.lock().contains(&block)
    }

    pub(crate) fn calls(&self) -> Vec<MapCall> {
        self.calls.lock().clone()
    }
}

impl BlockMap for TestMapper {
    fn native_block_shift(&self) -> u32 {
        self.native_shift
    }

    fn map(
        &self,
        start: NativeBlock,
        max_blocks: u64,
        create: bool,
    ) -> Result<Option<MappedRun>> {
        self.calls.lock().push(MapCall {
            start: start.0,
            max: max_blocks,
            create,
        });
        if self.fail_from.lock().is_some_and(|from| start.0 >= from) {
            return Err(DioError::Map(format!(
                "injected mapping failure at native block {}",
                start.0
            )));
        }
        let mut allocated = self.allocated.lock();
        let boundaries = self.boundaries.lock();
        let existing = allocated.contains(&start.0);
        if !existing && !create {
            return Ok(None);
        }
        let mut blocks = 1;
        while blocks < max_blocks {
            let next = start.0 + blocks;
            if allocated.contains(&next) != existing || boundaries.contains(&(next - 1)) {
                break;
            }
            blocks += 1;
        }
        if !existing {
            for block in start.0..start.0 + blocks {
                allocated.insert(block);
            }
        }
        Ok(Some(MappedRun {
            start: NativeBlock(start.0),
            blocks,
            new_alloc: !existing,
            boundary: boundaries.contains(&(start.0 + blocks - 1)),
        }))
    }
}

/// Records every `transfer_done` call and lets tests wait for the first.
#[derive(Default)]
pub(crate) struct CountingDone {
    calls: Mutex<Vec<(u64, u64)>>,
    arrived: Condvar,
}

impl CountingDone {
    pub(crate) fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().clone()
    }

    pub(crate) fn wait_for_call(&self) {
        let mut calls = self.calls.lock();
        while calls.is_empty() {
            let timeout = self
                .arrived
                .wait_for(&mut calls, std::time::Duration::from_secs(5));
            assert!(!timeout.timed_out(), "no completion callback within 5s");
        }
    }
}

impl DioComplete for CountingDone {
    fn transfer_done(&self, offset: u64, bytes: u64) {
        self.calls.lock().push((offset, bytes));
        self.arrived.notify_all();
    }
}
