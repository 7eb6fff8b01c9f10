//! Request generation: walking user memory block by block and packing the
//! blocks into as few device requests as possible.
//!
//! [`DioSubmit`] is the translator's cursor. It is single-threaded state,
//! alive only while generation runs; everything shared with completions
//! lives in [`Dio`]. Three layers of batching stack up here:
//!
//! 1. pages are pinned in batches of up to [`RING_CAPACITY`],
//! 2. contiguous in-page, on-device block runs grow a *staged run*,
//! 3. staged runs append to the open request until it fills or the device
//!    blocks stop being adjacent.

use crate::ctl::Dio;
use crate::BlockMap;
use dio_block::{CompletionSink, DevRequest, RequestCompletion, RequestQueue};
use dio_error::{DioError, Result};
use dio_mem::{zero_page, IoVec, PageRef, UserMemory};
use dio_types::{DevBlock, IoGeometry, NativeBlock, PAGE_MASK, PAGE_SHIFT};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Pages pinned per batch.
pub(crate) const RING_CAPACITY: usize = 64;
/// Completed requests are reaped after this many created ones, so pins do
/// not pile up during long generations.
pub(crate) const REAP_INTERVAL: u32 = 64;

/// A contiguous run within one page, headed for one device block run.
struct StagedRun {
    page: PageRef,
    offset: u32,
    len: u32,
    /// Fine-grained device block the run starts at.
    block: u64,
}

/// The live state of the most recent mapping.
struct MapState {
    new_alloc: bool,
    boundary: bool,
}

pub(crate) struct DioSubmit<'a> {
    dio: &'a Arc<Dio>,
    queue: &'a Arc<dyn RequestQueue>,
    memory: &'a Arc<dyn UserMemory>,
    mapper: &'a Arc<dyn BlockMap>,
    geom: IoGeometry,

    /// Cursor into the file, in fine-grained blocks.
    block_in_file: u64,
    /// One past the last block of the current segment.
    final_block: u64,
    /// Mapped blocks not yet consumed, and where the next one lands.
    blocks_available: u64,
    next_block_for_io: u64,
    map: Option<MapState>,
    /// Pending boundary: the next staged run must go out alone.
    boundary: bool,
    /// The leading sub-block zero-fill happens at most once per call.
    zero_head_done: bool,

    cur: Option<StagedRun>,

    req: Option<DevRequest>,
    /// One past the last device block covered by `req`'s segments.
    req_final_block: u64,
    /// Upper-bound estimate of pages still to stage; sizes new requests.
    pages_in_io: usize,
    reap_counter: u32,

    /// Pinned pages not yet consumed.
    ring: VecDeque<PageRef>,
    /// User address of the next page to pin, and pages left in the segment.
    curr_addr: u64,
    pages_left: usize,
}

fn in_page_u32(value: u64) -> u32 {
    debug_assert!(value <= u64::from(u32::MAX));
    u32::try_from(value).unwrap_or(u32::MAX)
}

impl<'a> DioSubmit<'a> {
    pub(crate) fn new(
        dio: &'a Arc<Dio>,
        queue: &'a Arc<dyn RequestQueue>,
        memory: &'a Arc<dyn UserMemory>,
        mapper: &'a Arc<dyn BlockMap>,
        geom: IoGeometry,
        offset: u64,
    ) -> Self {
        let block_in_file = offset >> geom.unit_shift();
        Self {
            dio,
            queue,
            memory,
            mapper,
            geom,
            block_in_file,
            final_block: block_in_file,
            blocks_available: 0,
            next_block_for_io: 0,
            map: None,
            boundary: false,
            zero_head_done: false,
            cur: None,
            req: None,
            req_final_block: 0,
            // Two spare slots so zero-page staging never starves a request.
            pages_in_io: 2,
            reap_counter: 0,
            ring: VecDeque::new(),
            curr_addr: 0,
            pages_left: 0,
        }
    }

    pub(crate) fn block_in_file(&self) -> u64 {
        self.block_in_file
    }

    pub(crate) fn final_block(&self) -> u64 {
        self.final_block
    }

    /// Count the pages `vec` spans into the request-size estimate. Called
    /// for every segment before generation starts.
    pub(crate) fn count_segment_pages(&mut self, vec: &IoVec) {
        if vec.len == 0 {
            return;
        }
        let first = vec.base >> PAGE_SHIFT;
        let last = (vec.base + vec.len - 1) >> PAGE_SHIFT;
        self.pages_in_io += usize::try_from(last - first + 1).unwrap_or(usize::MAX);
    }

    // ── Page supply ────────────────────────────────────────────────────────

    fn refill_ring(&mut self) -> Result<()> {
        let want = self.pages_left.min(RING_CAPACITY).max(1);
        match self.memory.pin_pages(self.curr_addr, want) {
            Ok(pages) => {
                let granted = pages.len();
                trace!(addr = self.curr_addr, granted, "pinned page batch");
                self.curr_addr = (self.curr_addr & !PAGE_MASK) + ((granted as u64) << PAGE_SHIFT);
                self.pages_left = self.pages_left.saturating_sub(granted);
                self.ring.extend(pages);
                Ok(())
            }
            Err(err) => {
                if self.dio.dir.is_write() && self.blocks_available > 0 {
                    // Blocks already reserved on the device must not keep
                    // their stale contents. Cover them with zeros and let
                    // the fault surface once they are spent.
                    self.dio.record_page_fault();
                    self.ring.push_back(zero_page());
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    fn next_page(&mut self) -> Result<PageRef> {
        if self.ring.is_empty() {
            self.refill_ring()?;
        }
        self.ring.pop_front().ok_or(DioError::PageFault)
    }

    // ── Mapping ────────────────────────────────────────────────────────────

    /// Ask the filesystem for the next run of blocks at the cursor.
    fn refresh_mapping(&mut self) -> Result<()> {
        // A deferred pin fault ends generation once the blocks it was
        // covering are exhausted.
        if self.dio.has_page_fault() {
            return Err(DioError::PageFault);
        }
        let factor = self.geom.factor();
        let fs_start = self.block_in_file >> factor;
        let fs_end = (self.final_block - 1) >> factor;
        let mut create = self.dio.dir.is_write();
        if create && self.dio.skip_holes && self.dio.file_size > 0 {
            // Inside the file proper a hole must stay a hole. The file's
            // last native block belongs to "inside" even when the cursor
            // sits past EOF within it.
            let last_native = (self.dio.file_size - 1) >> self.geom.native_shift();
            if fs_start <= last_native {
                create = false;
            }
        }
        let run = self
            .mapper
            .map(NativeBlock(fs_start), fs_end - fs_start + 1, create)?;
        trace!(
            fs_start,
            max = fs_end - fs_start + 1,
            create,
            mapped = run.is_some(),
            "block mapping"
        );
        let Some(run) = run else {
            self.map = None;
            return Ok(());
        };
        if run.blocks == 0 {
            return Err(DioError::Map("mapper returned an empty run".into()));
        }
        self.blocks_available = run.blocks << factor;
        self.next_block_for_io = run.start.0 << factor;
        // The mapping covers whole native blocks but the cursor may sit
        // mid-block. Skip the lead-in; for a fresh allocation keep the
        // device cursor at the block head so the lead-in gets zeroed.
        let rem = self.geom.native_remainder(self.block_in_file);
        if !run.new_alloc {
            self.next_block_for_io += rem;
        }
        self.blocks_available -= rem;
        self.map = Some(MapState {
            new_alloc: run.new_alloc,
            boundary: run.boundary,
        });
        Ok(())
    }

    // ── Zero-fill ──────────────────────────────────────────────────────────

    /// Zero the untouched part of a newly allocated native block: the
    /// lead-in before the transfer (`tail == false`) or the lead-out after
    /// it (`tail == true`).
    fn zero_block(&mut self, tail: bool) {
        self.zero_head_done = true;
        let Some(map) = &self.map else { return };
        if self.geom.factor() == 0 || !map.new_alloc {
            return;
        }
        let mut chunk = self.geom.native_remainder(self.block_in_file);
        if chunk == 0 {
            return;
        }
        if tail {
            chunk = self.geom.units_per_native() - chunk;
        }
        let bytes = in_page_u32(chunk << self.geom.unit_shift());
        trace!(tail, blocks = chunk, "zero-fill partial native block");
        self.stage(zero_page(), 0, bytes, self.next_block_for_io);
        self.next_block_for_io += chunk;
    }

    // ── Staging and flushing ───────────────────────────────────────────────

    /// Hand one in-page block run to the assembler. Grows the staged run
    /// when page and device positions are both adjacent, otherwise flushes
    /// and restages.
    fn stage(&mut self, page: PageRef, offset: u32, len: u32, first_block: u64) {
        let unit = self.geom.unit_shift();
        let extended = match &mut self.cur {
            Some(cur)
                if cur.page.same_page(&page)
                    && cur.offset + cur.len == offset
                    && cur.block + (u64::from(cur.len) >> unit) == first_block =>
            {
                cur.len += len;
                true
            }
            _ => false,
        };
        if !extended {
            if self.cur.is_some() {
                self.flush_run();
            }
            self.cur = Some(StagedRun {
                page,
                offset,
                len,
                block: first_block,
            });
        }
        if self.boundary {
            // The device needs this block's I/O issued before anything that
            // depends on the mapping past it.
            self.flush_run();
            if let Some(req) = self.req.take() {
                self.submit_request(req);
            }
            self.boundary = false;
        }
    }

    /// Move the staged run into the open request, submitting and reopening
    /// as needed.
    fn flush_run(&mut self) {
        let Some(run) = self.cur.take() else { return };
        let StagedRun {
            page,
            offset,
            len,
            block,
        } = run;
        if self.req.is_some() && (self.req_final_block != block || self.boundary) {
            // Device discontinuity: the open request cannot absorb this run.
            if let Some(req) = self.req.take() {
                self.submit_request(req);
            }
        }
        if self.req.is_none() {
            self.new_request(block);
        }
        let appended = match &mut self.req {
            Some(req) => req.try_append(page.clone(), offset, len),
            None => false,
        };
        if !appended {
            // Full request. Submit it; an append to a fresh one cannot fail.
            if let Some(req) = self.req.take() {
                self.submit_request(req);
            }
            self.new_request(block);
            if let Some(req) = &mut self.req {
                let ok = req.try_append(page, offset, len);
                debug_assert!(ok, "append to an empty request");
            }
        }
        self.req_final_block = block + (u64::from(len) >> self.geom.unit_shift());
        self.pages_in_io = self.pages_in_io.saturating_sub(1);
    }

    fn new_request(&mut self, first_block: u64) {
        self.reap();
        let cap = self.pages_in_io.min(self.queue.max_segments()).max(1);
        let first_byte = self.geom.block_to_byte(DevBlock(first_block));
        self.req = Some(DevRequest::new(self.dio.dir, first_byte, cap));
        self.req_final_block = first_block;
    }

    fn reap(&mut self) {
        self.reap_counter += 1;
        if self.reap_counter >= REAP_INTERVAL {
            self.dio.drain_completed();
            self.reap_counter = 0;
        }
    }

    fn submit_request(&mut self, req: DevRequest) {
        debug!(
            first_byte = req.first_byte(),
            segments = req.segments().len(),
            bytes = req.len_bytes(),
            queue = self.queue.name(),
            "submit device request"
        );
        // The request's reference must exist before submit: an inline
        // completion decrements it immediately.
        self.dio.ref_inc();
        let sink = Arc::clone(self.dio) as Arc<dyn CompletionSink>;
        self.queue.submit(req, RequestCompletion::new(sink));
    }

    // ── The per-segment walk ───────────────────────────────────────────────

    /// Translate one scatter/gather segment into staged block runs.
    ///
    /// On an error the cursor stops where it stopped; the caller accounts
    /// transferred bytes from the cursor and decides what to abort.
    pub(crate) fn do_segment(&mut self, vec: &IoVec) -> Result<()> {
        if vec.len == 0 {
            return Ok(());
        }
        let unit = self.geom.unit_shift();
        let units_per_page = self.geom.units_per_page();
        self.final_block = self.block_in_file + (vec.len >> unit);
        self.curr_addr = vec.base;
        let first = vec.base >> PAGE_SHIFT;
        let last = (vec.base + vec.len - 1) >> PAGE_SHIFT;
        self.pages_left = usize::try_from(last - first + 1)
            .map_err(|_| DioError::Misaligned("segment spans too many pages".into()))?;
        let mut block_in_page = (vec.base & PAGE_MASK) >> unit;

        while self.block_in_file < self.final_block {
            let page = self.next_page()?;
            loop {
                if self.blocks_available == 0 {
                    self.refresh_mapping()?;
                }
                if self.map.is_none() {
                    // A hole. Writes cannot proceed without a mapping; the
                    // caller falls back to the buffered path.
                    if self.dio.dir.is_write() {
                        return Err(DioError::BufferedFallback);
                    }
                    // Reads see zeros inside the file and stop at EOF
                    // (rounded up to the unit, since a final partial block
                    // still holds data).
                    let size_blocks =
                        (self.dio.file_size + self.geom.unit_size() - 1) >> unit;
                    if self.block_in_file >= size_blocks {
                        return Ok(());
                    }
                    page.zero_range(
                        usize::try_from(block_in_page << unit).unwrap_or(0),
                        usize::try_from(self.geom.unit_size()).unwrap_or(0),
                    );
                    self.block_in_file += 1;
                    block_in_page += 1;
                    if self.block_in_file == self.final_block || block_in_page == units_per_page
                    {
                        break;
                    }
                    continue;
                }
                if self.geom.factor() > 0 && !self.zero_head_done {
                    self.zero_block(false);
                }
                let chunk = self
                    .blocks_available
                    .min(units_per_page - block_in_page)
                    .min(self.final_block - self.block_in_file);
                debug_assert!(chunk > 0);
                self.boundary = self.map.as_ref().is_some_and(|m| m.boundary);
                self.stage(
                    page.clone(),
                    in_page_u32(block_in_page << unit),
                    in_page_u32(chunk << unit),
                    self.next_block_for_io,
                );
                self.next_block_for_io += chunk;
                self.block_in_file += chunk;
                block_in_page += chunk;
                self.blocks_available -= chunk;
                if self.block_in_file == self.final_block || block_in_page == units_per_page {
                    break;
                }
            }
            // This page's staging is done; staged runs and requests hold
            // their own pins.
            drop(page);
            block_in_page = 0;
        }
        Ok(())
    }

    /// Wind down generation: zero the tail of a part-filled fresh native
    /// block, push out whatever is staged, submit the open request, release
    /// unconsumed pinned pages.
    pub(crate) fn finish(&mut self) {
        self.zero_block(true);
        if self.cur.is_some() {
            self.flush_run();
        }
        if let Some(req) = self.req.take() {
            self.submit_request(req);
        }
        self.release_pages();
    }

    /// Drop pinned pages the walk did not consume.
    pub(crate) fn release_pages(&mut self) {
        self.ring.clear();
    }
}
