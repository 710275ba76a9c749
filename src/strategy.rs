//! Cache strategy abstraction
//!
//! A cache strategy sits between one producer (fetching bytes from a slow
//! source in stream order) and one consumer (reading forward, seeking now and
//! then). Every position handled here is an absolute offset into the source
//! stream. Implementations carry their own lock, so all methods take `&self`
//! and a strategy can be shared between the producer and consumer threads.

use std::time::Duration;

use crate::error::CacheResult;

/// Contract implemented by every concrete cache.
pub trait CacheStrategy: Send + Sync {
    /// Allocate resources. Must be called before anything else.
    fn open(&self) -> CacheResult<()>;

    /// Release resources. Safe to call more than once.
    fn close(&self);

    /// Largest length `<= requested` that `write` would accept right now.
    fn max_write_size(&self, requested: usize) -> usize;

    /// Append up to `data.len()` bytes at the end of the cached window.
    /// May store fewer bytes than offered; the producer loops on the rest.
    fn write(&self, data: &[u8]) -> CacheResult<usize>;

    /// Copy bytes at the read cursor into `buf` and advance the cursor.
    ///
    /// `Ok(0)` means end-of-input was reached. When nothing is buffered and
    /// the producer has not finished, returns `CacheError::WouldBlock`.
    fn read(&self, buf: &mut [u8]) -> CacheResult<usize>;

    /// Block until `minimum` bytes are available ahead of the read cursor,
    /// end-of-input is signaled, or `timeout` elapses (`CacheError::Timeout`).
    ///
    /// A zero timeout or an already finished input returns the current
    /// availability immediately.
    fn wait_for_data(&self, minimum: u64, timeout: Duration) -> CacheResult<u64>;

    /// Block until `max_write_size` may return a non-zero length or `timeout`
    /// elapses. Returns true if space became available.
    fn wait_for_space(&self, timeout: Duration) -> bool;

    /// Move the read cursor to `position`. Fails if `position` is not cached,
    /// in which case the caller is expected to `reset`.
    fn seek(&self, position: u64) -> CacheResult<u64>;

    /// Restart the window at `position`, keeping cached data when possible.
    /// Returns true when a full reset (data discard) was performed.
    fn reset(&self, position: u64) -> CacheResult<bool> {
        self.reset_with(position, false)
    }

    /// Like `reset`, but `force_clear` discards the window even when
    /// `position` is cached.
    fn reset_with(&self, position: u64, force_clear: bool) -> CacheResult<bool>;

    /// Mark that the producer will not write anything more.
    fn end_of_input(&self);

    fn is_end_of_input(&self) -> bool;

    fn clear_end_of_input(&self);

    /// First stream position held by the cache.
    fn cached_data_start_pos(&self) -> u64;

    /// One past the last stream position held by the cache.
    fn cached_data_end_pos(&self) -> u64;

    fn is_cached_position(&self, position: u64) -> bool;

    /// End of the contiguous cached data if the reader were moved to
    /// `position`; `position` itself when it is not cached.
    fn cached_data_end_pos_if_seek_to(&self, position: u64) -> u64;

    /// A fresh, unopened instance with the same configuration and no data.
    fn create_new(&self) -> Box<dyn CacheStrategy>;
}
