//! # Double Cache
//!
//! Keeps two cache strategies alive: the `current` one serving all reads and
//! writes, and an `old` one holding the previously visited region of the
//! stream. A reset that lands inside the old region swaps the two instead of
//! discarding data, so a consumer hopping between two places (live edge and a
//! bookmark, say) pays for one swap per direction change rather than a refetch.
//!
//! ## Threading
//!
//! Reads, writes and waits are forwarded to whichever instance is current
//! when the call starts. `reset` performs the swap and is expected to run on
//! the producer side (or while the producer is parked), the same way the
//! cached stream's fill thread drives it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::strategy::CacheStrategy;

struct Slots {
    current: Arc<dyn CacheStrategy>,
    old: Option<Arc<dyn CacheStrategy>>,
}

/// Decorator over two cache strategies of the same configuration.
pub struct DoubleCache {
    slots: RwLock<Slots>,
}

impl DoubleCache {
    /// Wrap `cache`. The second instance is created lazily, from
    /// `cache.create_new()`, on the first reset that needs it.
    pub fn new(cache: Box<dyn CacheStrategy>) -> Self {
        Self {
            slots: RwLock::new(Slots {
                current: Arc::from(cache),
                old: None,
            }),
        }
    }

    fn current(&self) -> Arc<dyn CacheStrategy> {
        Arc::clone(&self.slots.read().current)
    }

    /// Whether the secondary instance has been created yet.
    pub fn has_old(&self) -> bool {
        self.slots.read().old.is_some()
    }

    /// Cached window of the secondary instance, if any.
    pub fn old_range(&self) -> Option<(u64, u64)> {
        self.slots
            .read()
            .old
            .as_ref()
            .map(|old| (old.cached_data_start_pos(), old.cached_data_end_pos()))
    }
}

impl CacheStrategy for DoubleCache {
    fn open(&self) -> CacheResult<()> {
        self.current().open()
    }

    fn close(&self) {
        let mut slots = self.slots.write();
        slots.current.close();
        if let Some(old) = slots.old.take() {
            old.close();
        }
    }

    fn max_write_size(&self, requested: usize) -> usize {
        self.current().max_write_size(requested)
    }

    fn write(&self, data: &[u8]) -> CacheResult<usize> {
        self.current().write(data)
    }

    fn read(&self, buf: &mut [u8]) -> CacheResult<usize> {
        self.current().read(buf)
    }

    fn wait_for_data(&self, minimum: u64, timeout: Duration) -> CacheResult<u64> {
        self.current().wait_for_data(minimum, timeout)
    }

    fn wait_for_space(&self, timeout: Duration) -> bool {
        self.current().wait_for_space(timeout)
    }

    fn seek(&self, position: u64) -> CacheResult<u64> {
        let (current, old) = {
            let slots = self.slots.read();
            (Arc::clone(&slots.current), slots.old.clone())
        };

        // Not here but in the old instance: fail so the caller resets, which
        // swaps. Seeking the current instance first could only fail.
        if !current.is_cached_position(position)
            && old.as_ref().is_some_and(|old| old.is_cached_position(position))
        {
            return Err(CacheError::OutOfRange {
                position,
                start: current.cached_data_start_pos(),
                end: current.cached_data_end_pos(),
            });
        }

        current.seek(position)
    }

    fn reset_with(&self, position: u64, force_clear: bool) -> CacheResult<bool> {
        let mut slots = self.slots.write();

        // Stay put if the current instance has the position, unless the old
        // one also has it with more data ahead. A forced clear always swaps
        // so the newest region survives as the old instance.
        let keep_current = !force_clear
            && slots.current.is_cached_position(position)
            && slots.old.as_ref().map_or(true, |old| {
                !old.is_cached_position(position)
                    || slots.current.cached_data_end_pos() >= old.cached_data_end_pos()
            });
        if keep_current {
            return slots.current.reset_with(position, force_clear);
        }

        let next = match slots.old.take() {
            Some(old) => old,
            None => {
                let fresh = slots.current.create_new();
                if let Err(e) = fresh.open() {
                    warn!(error = %e, "Failed to open secondary cache, resetting current instead");
                    return slots.current.reset_with(position, force_clear);
                }
                Arc::from(fresh)
            }
        };
        let previous = std::mem::replace(&mut slots.current, next);
        slots.old = Some(previous);

        if !slots.current.is_cached_position(position) {
            if let Some(old) = slots.old.as_ref() {
                debug!(
                    position,
                    new_start = slots.current.cached_data_start_pos(),
                    new_end = slots.current.cached_data_end_pos(),
                    old_start = old.cached_data_start_pos(),
                    old_end = old.cached_data_end_pos(),
                    "Double cache miss after swap"
                );
            }
        }

        slots.current.reset_with(position, force_clear)
    }

    fn end_of_input(&self) {
        self.current().end_of_input()
    }

    fn is_end_of_input(&self) -> bool {
        self.current().is_end_of_input()
    }

    fn clear_end_of_input(&self) {
        self.current().clear_end_of_input()
    }

    fn cached_data_start_pos(&self) -> u64 {
        self.current().cached_data_start_pos()
    }

    fn cached_data_end_pos(&self) -> u64 {
        self.current().cached_data_end_pos()
    }

    fn is_cached_position(&self, position: u64) -> bool {
        let slots = self.slots.read();
        slots.current.is_cached_position(position)
            || slots.old.as_ref().is_some_and(|old| old.is_cached_position(position))
    }

    fn cached_data_end_pos_if_seek_to(&self, position: u64) -> u64 {
        let slots = self.slots.read();
        let ret = slots.current.cached_data_end_pos_if_seek_to(position);
        match slots.old.as_ref() {
            Some(old) => ret.max(old.cached_data_end_pos_if_seek_to(position)),
            None => ret,
        }
    }

    fn create_new(&self) -> Box<dyn CacheStrategy> {
        Box::new(DoubleCache::new(self.current().create_new()))
    }
}
