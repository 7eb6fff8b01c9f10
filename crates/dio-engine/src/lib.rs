#![forbid(unsafe_code)]
//! Direct (unbuffered) scatter/gather block I/O.
//!
//! [`direct_io`] translates one read or write call — an offset plus a list
//! of user-memory segments — into block-device requests that bypass any
//! caching layer, waits for them (or not, for a nonblocking call), and
//! settles the outcome. The filesystem plugs in through [`BlockMap`], the
//! device through [`dio_block::RequestQueue`], user memory through
//! [`dio_mem::UserMemory`].
//!
//! The split mirrors the lifetime of the two halves: [`ctl`] holds the
//! shared per-call state both the translator and the device completions
//! touch; [`submit`] holds the single-threaded cursor that only lives while
//! requests are being generated.

mod ctl;
mod submit;
#[cfg(test)]
pub(crate) mod testutil;

pub use dio_block::{
    CompletionMode, CompletionSink, DevRequest, FileQueue, MemQueue, QueueStats, RequestCompletion,
    RequestQueue,
};
pub use dio_error::{DioError, Result};
pub use dio_mem::{FaultingMemory, IoVec, PageUserMemory, UserMemory};
pub use dio_types::{DevBlock, Direction, FileBlock, IoGeometry, NativeBlock};

use std::sync::Arc;
use tracing::{debug, warn};

/// One mapped run of native blocks, device-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRun {
    /// First device block of the run.
    pub start: NativeBlock,
    /// Run length in native blocks. Never zero.
    pub blocks: u64,
    /// The blocks were allocated by this very lookup: their prior contents
    /// are garbage and partial overwrites must zero the rest.
    pub new_alloc: bool,
    /// I/O to this run must be issued before blocks past it are touched.
    pub boundary: bool,
}

/// The filesystem's block-mapping callback.
pub trait BlockMap: Send + Sync {
    /// Base-2 log of the filesystem's native block size.
    fn native_block_shift(&self) -> u32;

    /// Resolve up to `max_blocks` file-relative native blocks starting at
    /// `start` into one device-relative run. `create` asks for allocation;
    /// `Ok(None)` is a hole.
    fn map(&self, start: NativeBlock, max_blocks: u64, create: bool)
        -> Result<Option<MappedRun>>;
}

/// The file object a transfer targets. Locking and flushing are only
/// exercised when [`DioOptions::locking`] is set.
pub trait DioFile: Send + Sync {
    /// Current file size (i_size).
    fn size(&self) -> u64;

    /// Trim the file back to `size` after an aborted extending write.
    fn truncate(&self, size: u64) -> Result<()>;

    /// Write out and drop cached pages overlapping the range, so a direct
    /// read cannot see stale cache.
    fn flush_cached(&self, offset: u64, len: u64) -> Result<()>;

    fn lock(&self);
    fn unlock(&self);
}

/// Completion callback, invoked once with the settled byte count when any
/// bytes moved.
pub trait DioComplete: Send + Sync {
    fn transfer_done(&self, offset: u64, bytes: u64);
}

/// Per-call behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DioOptions {
    /// Hold the file lock across the call and flush cached pages before a
    /// read.
    pub locking: bool,
    /// Never allocate blocks inside the current file size; a write over a
    /// hole reports [`DioError::BufferedFallback`] instead.
    pub skip_holes: bool,
    /// Allow [`DioOutcome::Queued`]: return once all requests are submitted
    /// instead of waiting for them.
    pub nonblocking: bool,
}

/// How a [`direct_io`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DioOutcome {
    /// The transfer settled: this many bytes moved.
    Transferred(u64),
    /// All requests are in flight; the outcome arrives through
    /// [`DioComplete`].
    Queued,
}

/// Validate alignment and pick the call's block geometry.
///
/// The first attempt uses the filesystem's native block as the unit. When
/// offset or any segment misses that alignment, the check relaxes once to
/// the device's logical block size — smaller transfers than a native block
/// are fine as long as the device itself can address them.
fn validated_geometry(
    queue: &dyn RequestQueue,
    mapper: &dyn BlockMap,
    offset: u64,
    iovecs: &[IoVec],
) -> Result<IoGeometry> {
    let native_shift = mapper.native_block_shift();
    let aligned = |geom: IoGeometry| {
        geom.is_unit_aligned(offset)
            && iovecs
                .iter()
                .all(|v| geom.is_unit_aligned(v.base) && geom.is_unit_aligned(v.len))
    };
    let geom = IoGeometry::new(native_shift, native_shift)
        .map_err(|e| DioError::Misaligned(e.to_string()))?;
    if aligned(geom) {
        return Ok(geom);
    }
    let logical = queue.logical_block_shift();
    if logical < native_shift {
        let geom = IoGeometry::new(logical, native_shift)
            .map_err(|e| DioError::Misaligned(e.to_string()))?;
        if aligned(geom) {
            debug!(
                unit_shift = logical,
                native_shift, "alignment relaxed to the device logical block"
            );
            return Ok(geom);
        }
    }
    Err(DioError::Misaligned(format!(
        "offset {offset} or a segment is not aligned to {} bytes",
        1_u64 << logical.min(native_shift)
    )))
}

/// Perform one direct I/O transfer.
///
/// Reads fill the segments from the device, substituting zeros for holes
/// and stopping at end of file. Writes push the segments out, allocating
/// blocks as the mapper permits and zero-filling the unwritten parts of
/// freshly allocated native blocks.
///
/// A blocking call returns [`DioOutcome::Transferred`] once everything
/// settled. With [`DioOptions::nonblocking`] set, a call that submitted its
/// full length without errors may return [`DioOutcome::Queued`] while
/// device I/O is still in flight; `done` fires when it settles. Writes that
/// extend the file always settle synchronously.
#[expect(clippy::too_many_arguments)]
pub fn direct_io(
    dir: Direction,
    file: &Arc<dyn DioFile>,
    queue: &Arc<dyn RequestQueue>,
    memory: &Arc<dyn UserMemory>,
    iovecs: &[IoVec],
    offset: u64,
    mapper: &Arc<dyn BlockMap>,
    done: Option<Arc<dyn DioComplete>>,
    opts: DioOptions,
) -> Result<DioOutcome> {
    let geom = validated_geometry(queue.as_ref(), mapper.as_ref(), offset, iovecs)?;
    let total: u64 = iovecs.iter().map(|v| v.len).sum();
    let end = offset
        .checked_add(total)
        .ok_or_else(|| DioError::Misaligned("transfer length overflows the offset".into()))?;
    if total == 0 {
        return Ok(DioOutcome::Transferred(0));
    }

    if opts.locking {
        file.lock();
        if dir == Direction::Read {
            // Cached pages would otherwise shadow what the device holds.
            if let Err(err) = file.flush_cached(offset, total) {
                file.unlock();
                return Err(err);
            }
        }
    }
    let i_size = file.size();
    if dir == Direction::Read && offset >= i_size {
        if opts.locking {
            file.unlock();
        }
        return Ok(DioOutcome::Transferred(0));
    }
    // An extending write publishes a new file size; that must not happen
    // before the data is on disk, so such writes settle synchronously.
    let is_async = opts.nonblocking && !(dir.is_write() && end > i_size);

    debug!(
        ?dir,
        offset,
        total,
        unit_shift = geom.unit_shift(),
        native_shift = geom.native_shift(),
        is_async,
        "direct I/O start"
    );

    let dio = ctl::Dio::new(
        dir,
        offset,
        i_size,
        opts.locking,
        opts.skip_holes,
        Arc::clone(file),
        done,
    );
    let result = drive(&dio, queue, memory, mapper, geom, iovecs, total, is_async);

    if opts.locking && dir.is_write() && result.is_err() && end > i_size {
        // Blocks may have been allocated past the old size before the
        // failure; do not leave them exposed.
        if let Err(err) = file.truncate(i_size) {
            warn!(%err, "failed to trim aborted extending write");
        }
    }
    result
}

/// Generation plus settlement: run the translator over every segment, then
/// either wait out the I/O or leave it to the completion side.
#[expect(clippy::too_many_arguments)]
fn drive(
    dio: &Arc<ctl::Dio>,
    queue: &Arc<dyn RequestQueue>,
    memory: &Arc<dyn UserMemory>,
    mapper: &Arc<dyn BlockMap>,
    geom: IoGeometry,
    iovecs: &[IoVec],
    total: u64,
    is_async: bool,
) -> Result<DioOutcome> {
    let mut sdio = submit::DioSubmit::new(dio, queue, memory, mapper, geom, dio.offset);
    for vec in iovecs {
        sdio.count_segment_pages(vec);
    }
    let mut gen_err = None;
    for vec in iovecs {
        if vec.len == 0 {
            continue;
        }
        let outcome = sdio.do_segment(vec);
        // Whatever the walk consumed counts: holes and fault-covered
        // blocks included, since the cursor crossed them. Head and tail
        // zero-fill lie outside the cursor range and never count.
        let consumed = vec.len - ((sdio.final_block() - sdio.block_in_file()) << geom.unit_shift());
        dio.add_transferred(consumed);
        if let Err(err) = outcome {
            sdio.release_pages();
            gen_err = Some(err);
            break;
        }
    }
    sdio.finish();
    drop(sdio);

    // A deferred pin fault leaves the cursor at the end (zero-covered
    // blocks count as consumed), but the call did not succeed: it must
    // settle synchronously so the fault reaches the caller.
    let queued =
        is_async && gen_err.is_none() && !dio.has_page_fault() && dio.transferred() == total;
    if !queued {
        dio.await_all();
    }
    if dio.drop_ref() {
        dio.finalize(gen_err).map(DioOutcome::Transferred)
    } else {
        // Only reachable on the queued path: completions still hold
        // references and whichever drops the last one finalizes.
        Ok(DioOutcome::Queued)
    }
}
