//! The shared per-call control block.
//!
//! One [`Dio`] exists per `direct_io` call. It owns everything both sides of
//! the transfer need: the generation side (the translator loop) and the
//! completion side (the queue's completion callbacks, possibly on other
//! threads) share it through an `Arc`.
//!
//! The reference count starts at one — the translator's own reference — and
//! gains one per submitted request. Each completion drops one; the translator
//! drops its own when generation ends. Whichever side's drop reaches zero
//! processes the remaining completions and finalizes, so finalization runs
//! exactly once without either side needing to know which one it is.

use crate::{DioComplete, DioFile};
use dio_block::{CompletionSink, DevRequest};
use dio_error::{DioError, Result};
use dio_types::Direction;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A completed request queued for processing by whichever side drains it.
pub(crate) struct FinishedReq {
    req: DevRequest,
    status: Result<()>,
}

struct DioState {
    /// One for the translator plus one per in-flight request.
    refcount: usize,
    /// FIFO so errors fold in completion order.
    completed: VecDeque<FinishedReq>,
    /// Set while the translator is parked in [`Dio::await_one`].
    waiter: bool,
    io_error: Option<DioError>,
    page_error: Option<DioError>,
    /// Bytes of user memory consumed by generation, holes included.
    transferred: u64,
    finalized: bool,
}

pub(crate) struct Dio {
    pub(crate) dir: Direction,
    pub(crate) offset: u64,
    pub(crate) file_size: u64,
    pub(crate) skip_holes: bool,
    locking: bool,
    file: Arc<dyn DioFile>,
    done: Option<Arc<dyn DioComplete>>,
    state: Mutex<DioState>,
    wake: Condvar,
}

impl Dio {
    pub(crate) fn new(
        dir: Direction,
        offset: u64,
        file_size: u64,
        locking: bool,
        skip_holes: bool,
        file: Arc<dyn DioFile>,
        done: Option<Arc<dyn DioComplete>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dir,
            offset,
            file_size,
            skip_holes,
            locking,
            file,
            done,
            state: Mutex::new(DioState {
                refcount: 1,
                completed: VecDeque::new(),
                waiter: false,
                io_error: None,
                page_error: None,
                transferred: 0,
                finalized: false,
            }),
            wake: Condvar::new(),
        })
    }

    /// Take a reference on behalf of a request about to be submitted. Must
    /// happen before `submit` so an inline completion cannot drop the count
    /// to zero while the translator still runs.
    pub(crate) fn ref_inc(&self) {
        self.state.lock().refcount += 1;
    }

    pub(crate) fn add_transferred(&self, bytes: u64) {
        self.state.lock().transferred += bytes;
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.state.lock().transferred
    }

    /// Record a pin fault. During a write the fault is deferred: generation
    /// keeps covering already-reserved blocks with zeros and the error
    /// surfaces once those run out.
    pub(crate) fn record_page_fault(&self) {
        self.state.lock().page_error.get_or_insert(DioError::PageFault);
    }

    pub(crate) fn has_page_fault(&self) -> bool {
        self.state.lock().page_error.is_some()
    }

    /// Consume one finished request: fold its status into the first-error
    /// slot, dirty the target pages of a read, release its page pins.
    fn process(&self, fin: FinishedReq) {
        if let Err(err) = fin.status {
            warn!(first_byte = fin.req.first_byte(), %err, "device request failed");
            self.state.lock().io_error.get_or_insert(err);
        } else if self.dir == Direction::Read {
            for seg in fin.req.segments() {
                if !seg.page.is_zero_page() {
                    seg.page.mark_dirty();
                }
            }
        }
        // Dropping the request drops its segments' PageRefs: the pins taken
        // at staging time end here.
        drop(fin.req);
    }

    /// Process whatever has completed so far without blocking.
    pub(crate) fn drain_completed(&self) {
        loop {
            let Some(fin) = self.state.lock().completed.pop_front() else {
                return;
            };
            self.process(fin);
        }
    }

    /// Park until a completion arrives or the last in-flight request is
    /// already accounted for.
    fn await_one(&self) -> Option<FinishedReq> {
        let mut state = self.state.lock();
        while state.refcount > 1 && state.completed.is_empty() {
            state.waiter = true;
            self.wake.wait(&mut state);
            state.waiter = false;
        }
        state.completed.pop_front()
    }

    /// Wait out and process every outstanding request. Called only after all
    /// submissions, so the refcount can only fall from here.
    pub(crate) fn await_all(&self) {
        while let Some(fin) = self.await_one() {
            self.process(fin);
        }
    }

    /// Drop the caller's reference. Returns `true` when it was the last one,
    /// in which case the caller owns finalization.
    pub(crate) fn drop_ref(&self) -> bool {
        let last = {
            let mut state = self.state.lock();
            state.refcount -= 1;
            state.refcount == 0
        };
        if last {
            self.drain_completed();
        }
        last
    }

    /// Settle the call: clamp a read to EOF, report the byte count, release
    /// the file lock, pick the winning error. Runs exactly once, on
    /// whichever side dropped the last reference.
    pub(crate) fn finalize(&self, gen_err: Option<DioError>) -> Result<u64> {
        let (page_error, io_error, mut transferred) = {
            let mut state = self.state.lock();
            debug_assert!(!state.finalized, "finalize ran twice");
            state.finalized = true;
            (state.page_error.take(), state.io_error.take(), state.transferred)
        };
        // A read may have consumed post-EOF blocks; the caller only gets
        // bytes that exist.
        if self.dir == Direction::Read && self.offset + transferred > self.file_size {
            transferred = self.file_size.saturating_sub(self.offset);
        }
        if transferred > 0 {
            if let Some(done) = &self.done {
                done.transfer_done(self.offset, transferred);
            }
        }
        if self.locking {
            self.file.unlock();
        }
        debug!(
            dir = ?self.dir,
            offset = self.offset,
            transferred,
            "direct I/O settled"
        );
        if let Some(err) = gen_err {
            Err(err)
        } else if let Some(err) = page_error {
            Err(err)
        } else if let Some(err) = io_error {
            Err(err)
        } else {
            Ok(transferred)
        }
    }
}

impl CompletionSink for Dio {
    fn request_done(&self, req: DevRequest, status: Result<()>) {
        let remaining = {
            let mut state = self.state.lock();
            state.completed.push_back(FinishedReq { req, status });
            state.refcount -= 1;
            if state.refcount == 1 && state.waiter {
                // Ours was the completion the translator is parked on.
                self.wake.notify_one();
            }
            state.refcount
        };
        trace!(remaining, "request completed");
        if remaining == 0 {
            // The translator already returned Queued and dropped its
            // reference; the completion side owns the finish. The outcome
            // has no consumer here beyond the done callback.
            self.drain_completed();
            let _ = self.finalize(None);
        }
    }
}
