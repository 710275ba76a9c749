//! Cached stream API
//!
//! Couples a [`Source`] with a [`CacheStrategy`] and a dedicated fill thread,
//! and hands the consumer a plain `Read + Seek` stream.
//!
//! The fill thread is the only producer: it pulls chunks from the source into
//! the cache and is also the only place the source is repositioned and the
//! cache reset. The consumer reads from the cache and, when a seek misses the
//! cached window, posts the target to the fill thread and waits for it to be
//! applied.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::source::{source_len, Source};
use crate::strategy::CacheStrategy;

// Upper bound for any single park of the fill thread, so it notices stop and
// seek requests promptly.
const FILL_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Builder for [`CachedStream`].
/// Setters clamp their input to a usable range.
#[derive(Debug, Clone, Default)]
pub struct CachedStreamBuilder {
    config: CacheConfig,
}

impl CachedStreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    /// Start from an existing configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }
    /// Ring buffer size in bytes; 0 selects the temporary file cache.
    pub fn memory_size(mut self, bytes: usize) -> Self {
        self.config.memory_size = bytes;
        self
    }
    pub fn back_buffer_ratio(mut self, ratio: f32) -> Self {
        self.config.back_buffer_ratio = ratio.clamp(0.0, 0.9);
        self
    }
    pub fn double_cache(mut self, enabled: bool) -> Self {
        self.config.double_cache = enabled;
        self
    }
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.config.chunk_size = bytes.clamp(1, 16 * 1024 * 1024);
        self
    }
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout.max(Duration::from_millis(1));
        self
    }
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = Some(dir.into());
        self
    }

    /// Build a stream with the strategy described by the configuration.
    pub fn build<S: Source>(self, source: S) -> CacheResult<CachedStream> {
        let strategy = self.config.build_strategy()?;
        self.build_with_strategy(source, strategy)
    }

    /// Build a stream around a caller supplied, unopened strategy.
    pub fn build_with_strategy<S: Source>(
        self,
        mut source: S,
        strategy: Box<dyn CacheStrategy>,
    ) -> CacheResult<CachedStream> {
        self.config.validate()?;
        let len = source_len(&mut source)?;
        strategy.open()?;

        let shared = Arc::new(Shared {
            cache: strategy,
            control: Mutex::new(Control::default()),
            changed: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let worker = FillWorker {
            source,
            shared: Arc::clone(&shared),
            chunk_size: self.config.chunk_size,
            len,
            source_pos: 0,
        };
        let handle = thread::Builder::new()
            .name("cache-fill".to_string())
            .spawn(move || worker.run());
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                shared.cache.close();
                return Err(e.into());
            }
        };
        debug!(len, chunk_size = self.config.chunk_size, "Cached stream started");

        Ok(CachedStream {
            shared,
            worker: Some(handle),
            position: 0,
            len,
            read_timeout: self.config.read_timeout,
            desynced: false,
        })
    }
}

/// State handed between the consumer and the fill thread.
#[derive(Default)]
struct Control {
    seek_request: Option<u64>,
    seek_result: Option<io::Result<()>>,
    failure: Option<io::Error>,
    finished: bool,
}

struct Shared {
    cache: Box<dyn CacheStrategy>,
    control: Mutex<Control>,
    changed: Condvar,
    stop: AtomicBool,
}

impl Shared {
    fn interrupted(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.control.lock().seek_request.is_some()
    }
}

/// A `Read + Seek` stream over a slow source, read ahead into a cache by a
/// background thread.
pub struct CachedStream {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    position: u64,
    len: u64,
    read_timeout: Duration,
    // Set when a failed seek left the cache cursor away from `position`.
    desynced: bool,
}

impl CachedStream {
    /// Stream over `source` with the given configuration.
    pub fn new<S: Source>(source: S, config: CacheConfig) -> CacheResult<Self> {
        CachedStreamBuilder::new().config(config).build(source)
    }

    pub fn builder() -> CachedStreamBuilder {
        CachedStreamBuilder::new()
    }

    /// Current read position in the source stream.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total length of the source.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes already cached ahead of the read position.
    pub fn buffered(&self) -> u64 {
        self.shared
            .cache
            .cached_data_end_pos()
            .saturating_sub(self.position)
    }

    /// Stream range held by the active cache instance.
    pub fn cached_range(&self) -> (u64, u64) {
        let cache = &self.shared.cache;
        (cache.cached_data_start_pos(), cache.cached_data_end_pos())
    }

    fn failure(&self) -> Option<io::Error> {
        self.shared
            .control
            .lock()
            .failure
            .as_ref()
            .map(|e| io::Error::new(e.kind(), e.to_string()))
    }

    /// Hand `target` to the fill thread and wait until the source and cache
    /// have been repositioned.
    fn request_seek(&mut self, target: u64) -> io::Result<()> {
        let mut control = self.shared.control.lock();
        if control.finished {
            return Err(io::Error::other("cache fill thread is not running"));
        }
        control.seek_result = None;
        control.seek_request = Some(target);
        self.shared.changed.notify_all();

        loop {
            if let Some(result) = control.seek_result.take() {
                return result;
            }
            if control.finished {
                return Err(io::Error::other("cache fill thread stopped during seek"));
            }
            self.shared.changed.wait_for(&mut control, FILL_WAIT_SLICE);
        }
    }
}

impl Read for CachedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.desynced {
            return Err(io::Error::other(format!(
                "read position {} was lost by a failed seek",
                self.position
            )));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.shared.cache.read(buf) {
                Ok(0) => {
                    return match self.failure() {
                        Some(e) => Err(e),
                        None => Ok(0),
                    };
                }
                Ok(n) => {
                    self.position += n as u64;
                    return Ok(n);
                }
                Err(CacheError::WouldBlock) => {
                    match self.shared.cache.wait_for_data(1, self.read_timeout) {
                        Ok(_) => {}
                        Err(CacheError::Timeout) => {
                            warn!(
                                position = self.position,
                                timeout_ms = self.read_timeout.as_millis() as u64,
                                "Timed out waiting for cached data"
                            );
                            return Err(CacheError::Timeout.into());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Seek for CachedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => self.len.checked_add_signed(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
        };
        let target = match target {
            Some(target) if target <= self.len => target,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("seek to {:?} outside stream of length {}", pos, self.len),
                ))
            }
        };
        if target == self.position && !self.desynced {
            return Ok(target);
        }

        if self.shared.cache.seek(target).is_err() {
            trace!(target, "Seek missed the cache, repositioning source");
            if let Err(e) = self.request_seek(target) {
                // A near-forward cache seek may already have moved the
                // cursor; put it back or refuse further reads.
                if self.shared.cache.seek(self.position).is_err() {
                    error!(
                        position = self.position,
                        target,
                        "Cache cursor lost after failed seek"
                    );
                    self.desynced = true;
                }
                return Err(e);
            }
        }
        self.position = target;
        self.desynced = false;
        Ok(target)
    }
}

impl Drop for CachedStream {
    /// Stop and join the fill thread, then release the cache.
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.changed.notify_all();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Cache fill thread panicked");
            }
        }
        self.shared.cache.close();
    }
}

/// Producer side: owns the source and feeds the cache.
struct FillWorker<S> {
    source: S,
    shared: Arc<Shared>,
    chunk_size: usize,
    len: u64,
    source_pos: u64,
}

impl<S: Source> FillWorker<S> {
    fn run(mut self) {
        let mut buf = vec![0u8; self.chunk_size];
        while !self.shared.stop.load(Ordering::Acquire) {
            let request = self.shared.control.lock().seek_request;
            if let Some(target) = request {
                let result = self.reposition(target);
                let mut control = self.shared.control.lock();
                control.seek_request = None;
                control.seek_result = Some(result);
                self.shared.changed.notify_all();
                continue;
            }

            let cache = &self.shared.cache;
            if cache.is_end_of_input() {
                let mut control = self.shared.control.lock();
                if control.seek_request.is_none() {
                    self.shared.changed.wait_for(&mut control, FILL_WAIT_SLICE);
                }
                continue;
            }

            let want = cache.max_write_size(buf.len());
            if want == 0 {
                cache.wait_for_space(FILL_WAIT_SLICE);
                continue;
            }

            match self.source.read(&mut buf[..want]) {
                Ok(0) => {
                    debug!(position = self.source_pos, "Source exhausted");
                    cache.end_of_input();
                }
                Ok(n) => {
                    self.source_pos += n as u64;
                    self.store(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => self.fail(e),
            }
        }

        self.shared.control.lock().finished = true;
        self.shared.changed.notify_all();
        debug!("Cache fill thread stopped");
    }

    /// Write a whole chunk, parking while the cache is full. Gives up on the
    /// rest of the chunk when a seek or stop is pending.
    fn store(&self, chunk: &[u8]) {
        let cache = &self.shared.cache;
        let mut offset = 0;
        while offset < chunk.len() {
            match cache.write(&chunk[offset..]) {
                Ok(0) | Err(CacheError::WouldBlock) => {
                    if self.shared.interrupted() {
                        trace!(dropped = chunk.len() - offset, "Abandoning chunk");
                        return;
                    }
                    cache.wait_for_space(FILL_WAIT_SLICE);
                }
                Ok(n) => offset += n,
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }
        }
    }

    fn fail(&self, e: io::Error) {
        error!(position = self.source_pos, error = %e, "Source read failed");
        self.shared.control.lock().failure = Some(e);
        self.shared.cache.end_of_input();
    }

    /// Move the source to wherever the cache will need data from after a
    /// reset at `target`, then reset the cache.
    fn reposition(&mut self, target: u64) -> io::Result<()> {
        let cache = &self.shared.cache;
        let resume = cache.cached_data_end_pos_if_seek_to(target);

        if resume < self.len && resume != self.source_pos {
            self.source.seek(SeekFrom::Start(resume))?;
        }
        self.source_pos = resume.min(self.len);

        let full = cache.reset(target)?;
        if resume < self.len {
            cache.clear_end_of_input();
        } else {
            cache.end_of_input();
        }
        self.shared.control.lock().failure = None;

        debug!(target, resume, full_reset = full, "Repositioned cache fill");
        Ok(())
    }
}
