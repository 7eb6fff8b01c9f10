#![forbid(unsafe_code)]
//! Device requests and the block-layer submission seam.
//!
//! A [`DevRequest`] is the unit of work handed to the block layer: a run of
//! contiguous device bytes plus the ordered page segments that provide or
//! receive them. The engine submits requests through the [`RequestQueue`]
//! trait and the queue reports each one exactly once through a
//! [`RequestCompletion`] token — the token is consumed by value, so a
//! double completion does not typecheck.
//!
//! Two queues ship with the crate:
//!
//! - [`MemQueue`]: a `Vec<u8>` disk, completing inline or on a spawned
//!   thread (the latter stands in for interrupt-context completion).
//! - [`FileQueue`]: positional `pread`/`pwrite` against a real file,
//!   optionally opened with `O_DIRECT` on Linux.

use dio_error::Result;
use dio_mem::PageRef;
use dio_types::{Direction, SECTOR_SHIFT};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

// ── Device request ─────────────────────────────────────────────────────────

/// One page run inside a device request.
#[derive(Debug, Clone)]
pub struct Segment {
    pub page: PageRef,
    /// Byte offset within the page.
    pub offset: u32,
    /// Byte length of the run.
    pub len: u32,
}

/// A unit of work submitted to the block layer: `segments` cover the
/// contiguous device byte range starting at `first_byte`.
#[derive(Debug)]
pub struct DevRequest {
    dir: Direction,
    first_byte: u64,
    segments: Vec<Segment>,
    max_segments: usize,
}

impl DevRequest {
    /// Create an empty request with room for `max_segments` page runs.
    #[must_use]
    pub fn new(dir: Direction, first_byte: u64, max_segments: usize) -> Self {
        Self {
            dir,
            first_byte,
            segments: Vec::with_capacity(max_segments),
            max_segments: max_segments.max(1),
        }
    }

    /// Append a page run. Returns `false` when the request is full; an
    /// append to an empty request always succeeds.
    pub fn try_append(&mut self, page: PageRef, offset: u32, len: u32) -> bool {
        if self.segments.len() >= self.max_segments {
            return false;
        }
        self.segments.push(Segment { page, offset, len });
        true
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.dir
    }

    #[must_use]
    pub fn first_byte(&self) -> u64 {
        self.first_byte
    }

    /// Total payload bytes across all segments.
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.len)).sum()
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

// ── Completion ─────────────────────────────────────────────────────────────

/// Receiver of request completions (implemented by the engine's control
/// block). May be invoked from any thread; must not block.
pub trait CompletionSink: Send + Sync {
    fn request_done(&self, req: DevRequest, status: Result<()>);
}

/// Exactly-once completion token for one submitted request.
///
/// The block layer calls [`RequestCompletion::finish`] when the request's
/// I/O is done, successful or not. `finish` takes `self` by value: each
/// request can be completed once and only once.
pub struct RequestCompletion {
    sink: Arc<dyn CompletionSink>,
}

impl RequestCompletion {
    #[must_use]
    pub fn new(sink: Arc<dyn CompletionSink>) -> Self {
        Self { sink }
    }

    pub fn finish(self, req: DevRequest, status: Result<()>) {
        self.sink.request_done(req, status);
    }
}

// ── Submission queue ───────────────────────────────────────────────────────

/// Per-queue counters.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub requests: u64,
    pub segments: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// A block-device submission queue.
///
/// `submit` takes ownership of the request; completion arrives through the
/// token, possibly before `submit` returns (inline completion) or
/// concurrently on another thread.
pub trait RequestQueue: Send + Sync {
    /// Base-2 log of the device's logical block size — the floor for the
    /// engine's alignment relaxation.
    fn logical_block_shift(&self) -> u32;

    /// Maximum page segments per request.
    fn max_segments(&self) -> usize;

    /// Submit a request. The queue must eventually call `completion.finish`.
    fn submit(&self, req: DevRequest, completion: RequestCompletion);

    /// Queue name for diagnostics.
    fn name(&self) -> &'static str;

    /// Current statistics.
    fn stats(&self) -> QueueStats;
}

fn execute_on_disk(disk: &mut [u8], req: &DevRequest) -> Result<()> {
    let start = usize::try_from(req.first_byte()).map_err(|_| {
        dio_error::DioError::Io(std::io::Error::other("request offset overflows usize"))
    })?;
    let len = usize::try_from(req.len_bytes()).unwrap_or(usize::MAX);
    let end = start.checked_add(len).unwrap_or(usize::MAX);
    if end > disk.len() {
        return Err(dio_error::DioError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "request past end of device",
        )));
    }

    let mut at = start;
    for seg in req.segments() {
        let seg_len = seg.len as usize;
        match req.direction() {
            Direction::Write => {
                let mut buf = vec![0_u8; seg_len];
                seg.page.copy_out(seg.offset as usize, &mut buf);
                disk[at..at + seg_len].copy_from_slice(&buf);
            }
            Direction::Read => {
                seg.page.copy_in(seg.offset as usize, &disk[at..at + seg_len]);
            }
        }
        at += seg_len;
    }
    Ok(())
}

/// How a [`MemQueue`] delivers completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Complete inside `submit`, on the submitting thread.
    Inline,
    /// Complete on a spawned thread, concurrently with the submitter.
    Threaded,
}

/// In-memory block device for tests and benchmarks.
pub struct MemQueue {
    disk: Arc<Mutex<Vec<u8>>>,
    logical_shift: u32,
    max_segments: usize,
    mode: CompletionMode,
    stats: Mutex<QueueStats>,
    fail_requests_from: Mutex<Option<u64>>,
}

impl std::fmt::Debug for MemQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemQueue")
            .field("size", &self.disk.lock().len())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl MemQueue {
    /// Create a zero-filled device of `size` bytes.
    #[must_use]
    pub fn new(size: usize, mode: CompletionMode) -> Self {
        Self {
            disk: Arc::new(Mutex::new(vec![0_u8; size])),
            logical_shift: SECTOR_SHIFT,
            max_segments: 128,
            mode,
            stats: Mutex::new(QueueStats::default()),
            fail_requests_from: Mutex::new(None),
        }
    }

    /// Override the logical block shift (default: 9, a 512-byte sector).
    #[must_use]
    pub fn with_logical_shift(mut self, shift: u32) -> Self {
        self.logical_shift = shift;
        self
    }

    /// Override the per-request segment capacity (default: 128).
    #[must_use]
    pub fn with_max_segments(mut self, max: usize) -> Self {
        self.max_segments = max.max(1);
        self
    }

    /// Fail every request from the `n`th submitted one onward (0-based).
    pub fn fail_requests_from(&self, n: u64) {
        *self.fail_requests_from.lock() = Some(n);
    }

    /// Snapshot of the device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.disk.lock().clone()
    }

    /// Read a byte range directly (test helper).
    #[must_use]
    pub fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        self.disk.lock()[offset..offset + len].to_vec()
    }

    /// Write a byte range directly (test helper).
    pub fn poke(&self, offset: usize, data: &[u8]) {
        self.disk.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    fn account(&self, req: &DevRequest) -> u64 {
        let mut stats = self.stats.lock();
        let index = stats.requests;
        stats.requests += 1;
        stats.segments += req.segments().len() as u64;
        match req.direction() {
            Direction::Read => stats.bytes_read += req.len_bytes(),
            Direction::Write => stats.bytes_written += req.len_bytes(),
        }
        index
    }
}

impl RequestQueue for MemQueue {
    fn logical_block_shift(&self) -> u32 {
        self.logical_shift
    }

    fn max_segments(&self) -> usize {
        self.max_segments
    }

    fn submit(&self, req: DevRequest, completion: RequestCompletion) {
        let index = self.account(&req);
        let inject = self
            .fail_requests_from
            .lock()
            .is_some_and(|from| index >= from);
        trace!(
            index,
            first_byte = req.first_byte(),
            segments = req.segments().len(),
            bytes = req.len_bytes(),
            "mem queue submit"
        );
        let disk = Arc::clone(&self.disk);
        let run = move || {
            let status = if inject {
                Err(dio_error::DioError::Io(std::io::Error::other(
                    "injected device failure",
                )))
            } else {
                execute_on_disk(&mut disk.lock(), &req)
            };
            completion.finish(req, status);
        };
        match self.mode {
            CompletionMode::Inline => run(),
            CompletionMode::Threaded => {
                std::thread::spawn(run);
            }
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn stats(&self) -> QueueStats {
        self.stats.lock().clone()
    }
}

// ── File-backed queue ──────────────────────────────────────────────────────

/// Positional-I/O queue over a real file, in the `pread`/`pwrite` style.
///
/// Requests execute inline on the submitting thread; each request gathers
/// its segments into one contiguous transfer so the device sees a single
/// positional read or write per request.
pub struct FileQueue {
    file: Arc<std::fs::File>,
    logical_shift: u32,
    max_segments: usize,
    stats: Mutex<QueueStats>,
}

impl std::fmt::Debug for FileQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileQueue")
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl FileQueue {
    /// Open `path` read-write. With `direct` set, the file is opened with
    /// `O_DIRECT` on Linux (no-op elsewhere) so transfers bypass the page
    /// cache for real.
    pub fn open(path: &Path, direct: bool) -> Result<Self> {
        let mut options = std::fs::OpenOptions::new();
        options.read(true).write(true);
        #[cfg(target_os = "linux")]
        if direct {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct;
        let file = options.open(path).map_err(dio_error::DioError::Io)?;
        Ok(Self {
            file: Arc::new(file),
            logical_shift: SECTOR_SHIFT,
            max_segments: 128,
            stats: Mutex::new(QueueStats::default()),
        })
    }

    fn execute(&self, req: &DevRequest) -> Result<()> {
        use std::os::unix::fs::FileExt;

        let len = usize::try_from(req.len_bytes()).unwrap_or(usize::MAX);
        let mut buf = vec![0_u8; len];
        match req.direction() {
            Direction::Write => {
                let mut at = 0;
                for seg in req.segments() {
                    seg.page
                        .copy_out(seg.offset as usize, &mut buf[at..at + seg.len as usize]);
                    at += seg.len as usize;
                }
                self.file.write_all_at(&buf, req.first_byte())?;
            }
            Direction::Read => {
                self.file.read_exact_at(&mut buf, req.first_byte())?;
                let mut at = 0;
                for seg in req.segments() {
                    seg.page
                        .copy_in(seg.offset as usize, &buf[at..at + seg.len as usize]);
                    at += seg.len as usize;
                }
            }
        }
        Ok(())
    }
}

impl RequestQueue for FileQueue {
    fn logical_block_shift(&self) -> u32 {
        self.logical_shift
    }

    fn max_segments(&self) -> usize {
        self.max_segments
    }

    fn submit(&self, req: DevRequest, completion: RequestCompletion) {
        {
            let mut stats = self.stats.lock();
            stats.requests += 1;
            stats.segments += req.segments().len() as u64;
            match req.direction() {
                Direction::Read => stats.bytes_read += req.len_bytes(),
                Direction::Write => stats.bytes_written += req.len_bytes(),
            }
        }
        debug!(
            first_byte = req.first_byte(),
            segments = req.segments().len(),
            "file queue submit"
        );
        let status = self.execute(&req);
        completion.finish(req, status);
    }

    fn name(&self) -> &'static str {
        "pread/pwrite"
    }

    fn stats(&self) -> QueueStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dio_mem::Page;
    use std::sync::mpsc;

    struct ChannelSink {
        tx: Mutex<mpsc::Sender<(DevRequest, Result<()>)>>,
    }

    impl CompletionSink for ChannelSink {
        fn request_done(&self, req: DevRequest, status: Result<()>) {
            let _ = self.tx.lock().send((req, status));
        }
    }

    fn sink() -> (Arc<ChannelSink>, mpsc::Receiver<(DevRequest, Result<()>)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelSink { tx: Mutex::new(tx) }), rx)
    }

    #[test]
    fn request_capacity_is_enforced() {
        let page = Page::new();
        let mut req = DevRequest::new(Direction::Write, 0, 2);
        assert!(req.try_append(PageRef::pin(&page), 0, 512));
        assert!(req.try_append(PageRef::pin(&page), 512, 512));
        assert!(!req.try_append(PageRef::pin(&page), 1024, 512));
        assert_eq!(req.len_bytes(), 1024);
    }

    #[test]
    fn mem_queue_write_then_read_roundtrip() {
        let queue = MemQueue::new(8192, CompletionMode::Inline);
        let (sink, rx) = sink();

        let page = Page::new();
        page.copy_in(0, &[0xAB; 1024]);
        let mut req = DevRequest::new(Direction::Write, 2048, 4);
        assert!(req.try_append(PageRef::pin(&page), 0, 1024));
        queue.submit(req, RequestCompletion::new(sink.clone()));
        let (_, status) = rx.recv().expect("completion");
        status.expect("write ok");
        assert_eq!(queue.peek(2048, 4), vec![0xAB; 4]);

        let back = Page::new();
        let mut req = DevRequest::new(Direction::Read, 2048, 4);
        assert!(req.try_append(PageRef::pin(&back), 100, 1024));
        queue.submit(req, RequestCompletion::new(sink));
        let (_, status) = rx.recv().expect("completion");
        status.expect("read ok");
        let mut got = [0_u8; 1024];
        back.copy_out(100, &mut got);
        assert_eq!(got, [0xAB; 1024]);
    }

    #[test]
    fn mem_queue_threaded_completion_arrives() {
        let queue = MemQueue::new(4096, CompletionMode::Threaded);
        let (sink, rx) = sink();
        let page = Page::new();
        let mut req = DevRequest::new(Direction::Write, 0, 4);
        assert!(req.try_append(PageRef::pin(&page), 0, 512));
        queue.submit(req, RequestCompletion::new(sink));
        let (req, status) = rx.recv().expect("completion");
        status.expect("ok");
        assert_eq!(req.len_bytes(), 512);
    }

    #[test]
    fn mem_queue_request_past_end_fails() {
        let queue = MemQueue::new(1024, CompletionMode::Inline);
        let (sink, rx) = sink();
        let page = Page::new();
        let mut req = DevRequest::new(Direction::Write, 512, 4);
        assert!(req.try_append(PageRef::pin(&page), 0, 1024));
        queue.submit(req, RequestCompletion::new(sink));
        let (_, status) = rx.recv().expect("completion");
        assert!(status.is_err());
    }

    #[test]
    fn mem_queue_injected_failure() {
        let queue = MemQueue::new(4096, CompletionMode::Inline);
        queue.fail_requests_from(1);
        let (sink, rx) = sink();
        for i in 0..2 {
            let page = Page::new();
            let mut req = DevRequest::new(Direction::Write, i * 512, 4);
            assert!(req.try_append(PageRef::pin(&page), 0, 512));
            queue.submit(req, RequestCompletion::new(sink.clone()));
        }
        assert!(rx.recv().expect("first").1.is_ok());
        assert!(rx.recv().expect("second").1.is_err());
    }

    #[test]
    fn mem_queue_stats_accumulate() {
        let queue = MemQueue::new(4096, CompletionMode::Inline);
        let (sink, rx) = sink();
        let page = Page::new();
        let mut req = DevRequest::new(Direction::Write, 0, 4);
        assert!(req.try_append(PageRef::pin(&page), 0, 512));
        assert!(req.try_append(PageRef::pin(&page), 512, 512));
        queue.submit(req, RequestCompletion::new(sink));
        let _ = rx.recv();
        let stats = queue.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.bytes_written, 1024);
    }

    #[test]
    fn file_queue_roundtrip_through_tempfile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0_u8; 8192]).expect("create");

        let queue = FileQueue::open(&path, false).expect("open");
        assert_eq!(queue.name(), "pread/pwrite");
        let (sink, rx) = sink();

        let page = Page::new();
        page.copy_in(0, &[0x42; 512]);
        let mut req = DevRequest::new(Direction::Write, 1024, 4);
        assert!(req.try_append(PageRef::pin(&page), 0, 512));
        queue.submit(req, RequestCompletion::new(sink.clone()));
        rx.recv().expect("completion").1.expect("write ok");

        let back = Page::new();
        let mut req = DevRequest::new(Direction::Read, 1024, 4);
        assert!(req.try_append(PageRef::pin(&back), 0, 512));
        queue.submit(req, RequestCompletion::new(sink));
        rx.recv().expect("completion").1.expect("read ok");
        let mut got = [0_u8; 512];
        back.copy_out(0, &mut got);
        assert_eq!(got, [0x42; 512]);
    }
}
