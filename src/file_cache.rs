// Simple file cache module
// Disk-backed cache strategy. Every byte the producer writes is appended to a
// temporary file, so the window only ever grows until the next full reset.
// Used when there is not enough memory for a circular cache.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

use crate::error::{CacheError, CacheResult};
use crate::event::Event;
use crate::strategy::CacheStrategy;

/// Default largest chunk accepted by a single `write`.
pub const DEFAULT_MAX_WRITE_SIZE: usize = 128 * 1024;
/// Default distance past the written data at which seeks are refused.
pub const DEFAULT_SEEK_MARGIN: u64 = 500_000;
/// Default time a seek inside the margin waits for the producer.
pub const DEFAULT_SEEK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Temporary backing file with independent write and read handles.
struct Backing {
    file: NamedTempFile,
    writer: File,
    reader: File,
}

impl Backing {
    fn create(dir: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("filecache").suffix(".cache");
        let file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let writer = file.reopen()?;
        let reader = file.reopen()?;
        Ok(Self { file, writer, reader })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }
}

struct FileState {
    backing: Option<Backing>,
    // Stream position stored at file offset 0.
    start_position: u64,
    // File offsets of the write and read cursors.
    write_position: u64,
    read_position: u64,
    end_of_input: bool,
}

impl FileState {
    fn available(&self) -> u64 {
        self.write_position.saturating_sub(self.read_position)
    }

    fn contains(&self, position: u64) -> bool {
        position >= self.start_position && position <= self.start_position + self.write_position
    }
}

/// Cache strategy backed by a temporary file.
pub struct SimpleFileCache {
    temp_dir: Option<PathBuf>,
    max_write_size: usize,
    seek_margin: u64,
    seek_wait_timeout: Duration,
    state: Mutex<FileState>,
    data_available: Event,
}

impl SimpleFileCache {
    /// Create an unopened file cache whose backing file lives in the
    /// platform temp directory.
    pub fn new() -> Self {
        Self {
            temp_dir: None,
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            seek_margin: DEFAULT_SEEK_MARGIN,
            seek_wait_timeout: DEFAULT_SEEK_WAIT_TIMEOUT,
            state: Mutex::new(FileState {
                backing: None,
                start_position: 0,
                write_position: 0,
                read_position: 0,
                end_of_input: false,
            }),
            data_available: Event::new(),
        }
    }

    /// Place the backing file in `dir` instead of the platform temp directory.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn with_max_write_size(mut self, size: usize) -> Self {
        self.max_write_size = size.max(1);
        self
    }

    /// Seeks further than `margin` past the written data fail immediately;
    /// closer ones wait up to `timeout` for the producer.
    pub fn with_seek_margin(mut self, margin: u64, timeout: Duration) -> Self {
        self.seek_margin = margin;
        self.seek_wait_timeout = timeout;
        self
    }

    /// Path of the backing file while the cache is open.
    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().backing.as_ref().map(|b| b.path().to_path_buf())
    }

    fn configured_copy(&self) -> Self {
        let copy = SimpleFileCache::new()
            .with_max_write_size(self.max_write_size)
            .with_seek_margin(self.seek_margin, self.seek_wait_timeout);
        match &self.temp_dir {
            Some(dir) => copy.in_dir(dir.clone()),
            None => copy,
        }
    }
}

impl Default for SimpleFileCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Write as much of `data` as the writer takes. Returns the count written
/// and the error that stopped it early, if any.
fn append<W: Write>(writer: &mut W, data: &[u8]) -> (usize, Option<std::io::Error>) {
    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]) {
            Ok(0) => return (written, Some(std::io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return (written, Some(e)),
        }
    }
    (written, None)
}

impl CacheStrategy for SimpleFileCache {
    fn open(&self) -> CacheResult<()> {
        let backing = Backing::create(self.temp_dir.as_deref()).map_err(|e| {
            error!(dir = ?self.temp_dir, error = %e, "Failed to create cache file");
            CacheError::Io(e)
        })?;
        debug!(path = %backing.path().display(), "Created cache file");

        let mut state = self.state.lock();
        // Reopening drops (and deletes) a previous backing file.
        state.backing = Some(backing);
        state.start_position = 0;
        state.write_position = 0;
        state.read_position = 0;
        state.end_of_input = false;
        drop(state);

        self.data_available.reset();
        Ok(())
    }

    fn close(&self) {
        let backing = self.state.lock().backing.take();
        if let Some(Backing { file, writer, reader }) = backing {
            drop(writer);
            drop(reader);
            let path = file.path().to_path_buf();
            match file.close() {
                Ok(()) => debug!(path = %path.display(), "Deleted cache file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete cache file"),
            }
        }
        // Wake a reader still parked in wait_for_data.
        self.data_available.set();
    }

    fn max_write_size(&self, requested: usize) -> usize {
        requested.min(self.max_write_size)
    }

    fn write(&self, data: &[u8]) -> CacheResult<usize> {
        let mut state = self.state.lock();
        let backing = state.backing.as_mut().ok_or(CacheError::NotOpen)?;

        let (written, failure) = append(&mut backing.writer, data);
        if let Some(e) = &failure {
            error!(
                path = %backing.path().display(),
                requested = data.len(),
                written,
                error = %e,
                "Error writing to cache file"
            );
        }
        state.write_position += written as u64;
        drop(state);

        if written > 0 {
            self.data_available.set();
        }
        // Bytes that landed are reported; the failure resurfaces on the next
        // write if it persists.
        match failure {
            Some(e) if written == 0 => Err(CacheError::Io(e)),
            _ => Ok(written),
        }
    }

    fn read(&self, buf: &mut [u8]) -> CacheResult<usize> {
        let mut state = self.state.lock();
        if state.backing.is_none() {
            return Err(CacheError::NotOpen);
        }
        let available = state.available();
        if available == 0 {
            return if state.end_of_input {
                Ok(0)
            } else {
                Err(CacheError::WouldBlock)
            };
        }

        let to_read = (buf.len() as u64).min(available) as usize;
        if to_read == 0 {
            return Ok(0);
        }
        let backing = state.backing.as_mut().ok_or(CacheError::NotOpen)?;
        let read = match backing.reader.read(&mut buf[..to_read]) {
            Ok(0) => {
                error!(
                    path = %backing.path().display(),
                    requested = to_read,
                    "Cache file ended before the written position"
                );
                return Err(CacheError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            Ok(n) => n,
            Err(e) => {
                error!(
                    path = %backing.path().display(),
                    requested = to_read,
                    error = %e,
                    "Error reading from cache file"
                );
                return Err(CacheError::Io(e));
            }
        };
        state.read_position += read as u64;
        Ok(read)
    }

    fn wait_for_data(&self, minimum: u64, timeout: Duration) -> CacheResult<u64> {
        {
            let state = self.state.lock();
            if timeout.is_zero() || state.end_of_input {
                return Ok(state.available());
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let (available, end_of_input) = {
                let state = self.state.lock();
                (state.available(), state.end_of_input)
            };
            if end_of_input || available >= minimum {
                return Ok(available);
            }
            let now = Instant::now();
            if now >= deadline || !self.data_available.wait(deadline - now) {
                return Err(CacheError::Timeout);
            }
        }
    }

    fn wait_for_space(&self, _timeout: Duration) -> bool {
        // The backing file grows without bound.
        true
    }

    fn seek(&self, position: u64) -> CacheResult<u64> {
        let (target, read_position) = {
            let state = self.state.lock();
            let out_of_range = || CacheError::OutOfRange {
                position,
                start: state.start_position,
                end: state.start_position + state.write_position,
            };
            if state.backing.is_none() {
                return Err(CacheError::NotOpen);
            }
            if position < state.start_position {
                return Err(out_of_range());
            }
            let target = position - state.start_position;
            if target > state.write_position.saturating_add(self.seek_margin) {
                debug!(
                    position,
                    cached_end = state.start_position + state.write_position,
                    "Seek position is beyond cached data"
                );
                return Err(out_of_range());
            }
            (target, state.read_position)
        };

        let write_position = self.state.lock().write_position;
        if target > write_position {
            let needed = target - read_position.min(target);
            match self.wait_for_data(needed, self.seek_wait_timeout) {
                Ok(_) => {}
                Err(CacheError::Timeout) => {
                    debug!(position, "Wait for seek position timed out");
                    let state = self.state.lock();
                    return Err(CacheError::OutOfRange {
                        position,
                        start: state.start_position,
                        end: state.start_position + state.write_position,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let mut state = self.state.lock();
        if target > state.write_position {
            // End of input arrived before the target was written.
            return Err(CacheError::OutOfRange {
                position,
                start: state.start_position,
                end: state.start_position + state.write_position,
            });
        }
        let backing = state.backing.as_mut().ok_or(CacheError::NotOpen)?;
        let landed = backing.reader.seek(SeekFrom::Start(target))?;
        state.read_position = landed;
        Ok(position)
    }

    fn reset_with(&self, position: u64, force_clear: bool) -> CacheResult<bool> {
        let mut state = self.state.lock();
        if !force_clear && state.contains(position) {
            let target = position - state.start_position;
            let backing = state.backing.as_mut().ok_or(CacheError::NotOpen)?;
            let landed = backing.reader.seek(SeekFrom::Start(target))?;
            state.read_position = landed;
            return Ok(false);
        }

        let backing = state.backing.as_mut().ok_or(CacheError::NotOpen)?;
        backing.writer.set_len(0)?;
        backing.writer.seek(SeekFrom::Start(0))?;
        backing.reader.seek(SeekFrom::Start(0))?;
        state.start_position = position;
        state.write_position = 0;
        state.read_position = 0;
        Ok(true)
    }

    fn end_of_input(&self) {
        self.state.lock().end_of_input = true;
        self.data_available.set();
    }

    fn is_end_of_input(&self) -> bool {
        self.state.lock().end_of_input
    }

    fn clear_end_of_input(&self) {
        self.state.lock().end_of_input = false;
    }

    fn cached_data_start_pos(&self) -> u64 {
        self.state.lock().start_position
    }

    fn cached_data_end_pos(&self) -> u64 {
        let state = self.state.lock();
        state.start_position + state.write_position
    }

    fn is_cached_position(&self, position: u64) -> bool {
        self.state.lock().contains(position)
    }

    fn cached_data_end_pos_if_seek_to(&self, position: u64) -> u64 {
        let state = self.state.lock();
        if state.contains(position) {
            state.start_position + state.write_position
        } else {
            position
        }
    }

    fn create_new(&self) -> Box<dyn CacheStrategy> {
        Box::new(self.configured_copy())
    }
}

impl Drop for SimpleFileCache {
    fn drop(&mut self) {
        self.close();
    }
}
