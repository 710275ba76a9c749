//! # Circular Cache
//!
//! In-memory ring buffer holding a fixed-size window of the source stream.
//!
//! ## Layout
//!
//! ```text
//!   beg            cur                  end
//!    |--- back -----|------ front --------|
//!    (history kept   (read-ahead not yet
//!     for seeking)    consumed)
//! ```
//!
//! `beg`, `cur` and `end` are absolute stream positions. They are only turned
//! into buffer indices at the point of copying, through [`RingState::slot`].
//! At least `back_size` bytes of history behind `cur` are protected from the
//! producer; history beyond that is overwritten as the front buffer grows.
//!
//! ## Invariants
//!
//! - `beg <= cur <= end`
//! - `end - beg <= capacity` where `capacity = front_size + back_size`

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::{CacheError, CacheResult};
use crate::strategy::CacheStrategy;

/// Longest single sleep inside `wait_for_data`.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Default distance past `end` for which a seek waits for the producer.
pub const DEFAULT_SEEK_WAIT_THRESHOLD: u64 = 100_000;
/// Default time a near-forward seek waits for the producer.
pub const DEFAULT_SEEK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

struct RingState {
    buf: Option<Vec<u8>>,
    capacity: usize,
    beg: u64,
    cur: u64,
    end: u64,
    end_of_input: bool,
}

impl RingState {
    /// Physical index of an absolute stream position.
    fn slot(&self, position: u64) -> usize {
        (position % self.capacity as u64) as usize
    }

    fn back(&self) -> usize {
        (self.cur - self.beg) as usize
    }

    fn front(&self) -> usize {
        (self.end - self.cur) as usize
    }

    fn contains(&self, position: u64) -> bool {
        position >= self.beg && position <= self.end
    }
}

/// Ring buffer cache split into a front (read-ahead) and back (history) region.
pub struct CircularCache {
    front_size: usize,
    back_size: usize,
    seek_wait_threshold: u64,
    seek_wait_timeout: Duration,
    state: Mutex<RingState>,
    written: Condvar,
    space: Condvar,
}

impl CircularCache {
    /// Create an unopened cache with `front_size` bytes of read-ahead and
    /// `back_size` bytes of guaranteed history.
    pub fn new(front_size: usize, back_size: usize) -> Self {
        Self {
            front_size,
            back_size,
            seek_wait_threshold: DEFAULT_SEEK_WAIT_THRESHOLD,
            seek_wait_timeout: DEFAULT_SEEK_WAIT_TIMEOUT,
            state: Mutex::new(RingState {
                buf: None,
                capacity: front_size + back_size,
                beg: 0,
                cur: 0,
                end: 0,
                end_of_input: false,
            }),
            written: Condvar::new(),
            space: Condvar::new(),
        }
    }

    /// Configure how far past the cached end a seek may land and still be
    /// served by waiting for the producer instead of failing. A threshold of
    /// zero disables the wait.
    pub fn with_seek_wait(mut self, threshold: u64, timeout: Duration) -> Self {
        self.seek_wait_threshold = threshold;
        self.seek_wait_timeout = timeout;
        self
    }

    pub fn capacity(&self) -> usize {
        self.front_size + self.back_size
    }

    pub fn front_size(&self) -> usize {
        self.front_size
    }

    pub fn back_size(&self) -> usize {
        self.back_size
    }

    /// Current read cursor.
    pub fn position(&self) -> u64 {
        self.state.lock().cur
    }

    /// Bytes that may be appended without eating into the protected history.
    fn write_limit(&self, state: &RingState) -> usize {
        state.capacity - state.back().min(self.back_size) - state.front()
    }
}

impl CacheStrategy for CircularCache {
    fn open(&self) -> CacheResult<()> {
        let capacity = self.capacity();
        if capacity == 0 {
            return Err(CacheError::InvalidConfig("circular cache capacity must be > 0".to_string()));
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| CacheError::Allocation(capacity))?;
        buf.resize(capacity, 0);

        let mut state = self.state.lock();
        state.buf = Some(buf);
        state.beg = 0;
        state.cur = 0;
        state.end = 0;
        state.end_of_input = false;
        debug!(front = self.front_size, back = self.back_size, "Circular cache opened");
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.buf.take().is_some() {
            debug!("Circular cache closed");
        }
        drop(state);
        self.written.notify_all();
        self.space.notify_all();
    }

    fn max_write_size(&self, requested: usize) -> usize {
        let state = self.state.lock();
        requested.min(self.write_limit(&state))
    }

    fn write(&self, data: &[u8]) -> CacheResult<usize> {
        let mut state = self.state.lock();
        if state.buf.is_none() {
            return Err(CacheError::NotOpen);
        }

        let pos = state.slot(state.end);
        let limit = self.write_limit(&state);
        // Never copy across the physical wrap point; the producer loops.
        let wrap = state.capacity - pos;
        let len = data.len().min(limit).min(wrap);
        if len == 0 {
            return Ok(0);
        }

        if let Some(buf) = state.buf.as_mut() {
            buf[pos..pos + len].copy_from_slice(&data[..len]);
        }
        state.end += len as u64;

        // Drop history that was just overwritten.
        let capacity = state.capacity as u64;
        if state.end - state.beg > capacity {
            state.beg = state.end - capacity;
        }
        trace!(len, beg = state.beg, end = state.end, "Wrote to circular cache");

        drop(state);
        self.written.notify_all();
        Ok(len)
    }

    fn read(&self, out: &mut [u8]) -> CacheResult<usize> {
        let mut state = self.state.lock();
        if state.buf.is_none() {
            return Err(CacheError::NotOpen);
        }
        let pos = state.slot(state.cur);
        let avail = (state.capacity - pos).min(state.front());
        if avail == 0 {
            return if state.end_of_input {
                Ok(0)
            } else {
                Err(CacheError::WouldBlock)
            };
        }

        let len = out.len().min(avail);
        if len == 0 {
            return Ok(0);
        }
        if let Some(buf) = state.buf.as_ref() {
            out[..len].copy_from_slice(&buf[pos..pos + len]);
        }
        state.cur += len as u64;

        drop(state);
        self.space.notify_all();
        Ok(len)
    }

    fn wait_for_data(&self, minimum: u64, timeout: Duration) -> CacheResult<u64> {
        let mut state = self.state.lock();
        let mut avail = state.end - state.cur;
        if timeout.is_zero() || state.end_of_input {
            return Ok(avail);
        }

        // The front region can never hold more than this.
        let minimum = minimum.min((state.capacity - self.back_size) as u64);
        let deadline = Instant::now() + timeout;
        while !state.end_of_input && avail < minimum {
            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::Timeout);
            }
            // Releases the lock while sleeping.
            self.written.wait_for(&mut state, (deadline - now).min(WAIT_SLICE));
            avail = state.end - state.cur;
        }
        Ok(avail)
    }

    fn wait_for_space(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if self.write_limit(&state) > 0 {
            return true;
        }
        self.space.wait_for(&mut state, timeout);
        self.write_limit(&state) > 0
    }

    fn seek(&self, position: u64) -> CacheResult<u64> {
        let mut state = self.state.lock();

        // Slightly past the end: wait for the producer to catch up instead of
        // forcing a seek on the source.
        if position >= state.end && position < state.end.saturating_add(self.seek_wait_threshold) {
            // Turn the whole window into history so the front has room.
            state.cur = state.end;
            let gap = position - state.cur;
            drop(state);
            self.space.notify_all();

            // Timeout here only means the data did not arrive; checked below.
            let _ = self.wait_for_data(gap, self.seek_wait_timeout);

            state = self.state.lock();
            if !state.contains(position) {
                debug!(
                    position,
                    end = state.end,
                    "Wait for seek position failed"
                );
            }
        }

        if state.contains(position) {
            state.cur = position;
            drop(state);
            self.space.notify_all();
            return Ok(position);
        }

        Err(CacheError::OutOfRange {
            position,
            start: state.beg,
            end: state.end,
        })
    }

    fn reset_with(&self, position: u64, force_clear: bool) -> CacheResult<bool> {
        let mut state = self.state.lock();
        let full = if !force_clear && state.contains(position) {
            state.cur = position;
            false
        } else {
            state.beg = position;
            state.cur = position;
            state.end = position;
            true
        };
        drop(state);
        self.space.notify_all();
        Ok(full)
    }

    fn end_of_input(&self) {
        self.state.lock().end_of_input = true;
        self.written.notify_all();
    }

    fn is_end_of_input(&self) -> bool {
        self.state.lock().end_of_input
    }

    fn clear_end_of_input(&self) {
        self.state.lock().end_of_input = false;
    }

    fn cached_data_start_pos(&self) -> u64 {
        self.state.lock().beg
    }

    fn cached_data_end_pos(&self) -> u64 {
        self.state.lock().end
    }

    fn is_cached_position(&self, position: u64) -> bool {
        self.state.lock().contains(position)
    }

    fn cached_data_end_pos_if_seek_to(&self, position: u64) -> u64 {
        let state = self.state.lock();
        if state.contains(position) {
            state.end
        } else {
            position
        }
    }

    fn create_new(&self) -> Box<dyn CacheStrategy> {
        Box::new(
            CircularCache::new(self.front_size, self.back_size)
                .with_seek_wait(self.seek_wait_threshold, self.seek_wait_timeout),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testlib::pattern;
    use std::sync::Arc;
    use std::thread;

    fn opened(front: usize, back: usize) -> CircularCache {
        let cache = CircularCache::new(front, back);
        cache.open().unwrap();
        cache
    }

    /// Write everything in `data`, looping over short writes.
    fn write_all(cache: &CircularCache, mut data: &[u8]) {
        while !data.is_empty() {
            let n = cache.write(data).unwrap();
            assert!(n > 0, "cache refused to take more data");
            data = &data[n..];
        }
    }

    fn read_exact(cache: &CircularCache, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            filled += cache.read(&mut out[filled..]).unwrap();
        }
        out
    }

    fn window(cache: &CircularCache) -> (u64, u64, u64) {
        (cache.cached_data_start_pos(), cache.position(), cache.cached_data_end_pos())
    }

    #[test]
    fn test_write_read_roundtrip() {
        let cache = opened(80, 20);
        let data = pattern(0..60);
        write_all(&cache, &data);
        assert_eq!(read_exact(&cache, 60), data);
        assert_eq!(window(&cache), (0, 60, 60));
    }

    #[test]
    fn test_write_stops_at_wrap_point() {
        let cache = opened(80, 20);
        write_all(&cache, &pattern(0..90));
        read_exact(&cache, 90);
        // pos = 90, only 10 bytes remain before the physical end.
        assert_eq!(cache.write(&pattern(90..140)).unwrap(), 10);
        assert_eq!(cache.write(&pattern(100..140)).unwrap(), 40);
        assert_eq!(cache.cached_data_end_pos(), 140);
    }

    #[test]
    fn test_back_buffer_is_protected() {
        // Capacity 100, back 20. 60 written, 10 read: back = 10, front = 50.
        let cache = opened(80, 20);
        write_all(&cache, &pattern(0..60));
        read_exact(&cache, 10);
        assert_eq!(cache.max_write_size(usize::MAX), 40);
        assert_eq!(cache.write(&pattern(60..110)).unwrap(), 40);
        // Window is full: 10 history + 90 front.
        assert_eq!(cache.write(&pattern(100..110)).unwrap(), 0);
        assert_eq!(window(&cache), (0, 10, 100));
    }

    #[test]
    fn test_history_is_evicted_from_beg() {
        // Once the consumer has 30 bytes of history, 10 of them may be
        // overwritten because only 20 are guaranteed.
        let cache = opened(80, 20);
        write_all(&cache, &pattern(0..60));
        read_exact(&cache, 30);
        write_all(&cache, &pattern(60..110));
        assert_eq!(window(&cache), (10, 30, 110));
        assert_eq!(read_exact(&cache, 80), pattern(30..110));
    }

    #[test]
    fn test_read_would_block_then_eof() {
        let cache = opened(16, 16);
        let mut buf = [0u8; 4];
        assert!(cache.read(&mut buf).unwrap_err().is_would_block());
        cache.end_of_input();
        assert_eq!(cache.read(&mut buf).unwrap(), 0);
        cache.clear_end_of_input();
        assert!(!cache.is_end_of_input());
        assert!(cache.read(&mut buf).unwrap_err().is_would_block());
    }

    #[test]
    fn test_reopen_starts_clean() {
        let cache = opened(16, 16);
        write_all(&cache, &pattern(0..8));
        cache.end_of_input();
        cache.close();
        cache.open().unwrap();

        assert!(!cache.is_end_of_input());
        assert_eq!(window(&cache), (0, 0, 0));
        let mut buf = [0u8; 4];
        assert!(cache.read(&mut buf).unwrap_err().is_would_block());
    }

    #[test]
    fn test_write_before_open_fails() {
        let cache = CircularCache::new(16, 16);
        assert!(matches!(cache.write(b"abc"), Err(CacheError::NotOpen)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let cache = CircularCache::new(0, 0);
        assert!(matches!(cache.open(), Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_close_twice() {
        let cache = opened(16, 16);
        cache.close();
        cache.close();
        assert!(matches!(cache.write(b"abc"), Err(CacheError::NotOpen)));
    }

    #[test]
    fn test_seek_inside_window() {
        let cache = opened(80, 20).with_seek_wait(0, Duration::ZERO);
        write_all(&cache, &pattern(0..50));
        read_exact(&cache, 40);
        assert_eq!(cache.seek(5).unwrap(), 5);
        assert_eq!(read_exact(&cache, 10), pattern(5..15));
        assert_eq!(cache.seek(50).unwrap(), 50);
    }

    #[test]
    fn test_seek_to_cursor_is_noop() {
        let cache = opened(80, 20);
        write_all(&cache, &pattern(0..50));
        read_exact(&cache, 25);
        let before = window(&cache);
        assert_eq!(cache.seek(25).unwrap(), 25);
        assert_eq!(window(&cache), before);
    }

    #[test]
    fn test_seek_out_of_range() {
        let cache = opened(80, 20).with_seek_wait(0, Duration::ZERO);
        write_all(&cache, &pattern(0..50));
        match cache.seek(500) {
            Err(CacheError::OutOfRange { position, start, end }) => {
                assert_eq!((position, start, end), (500, 0, 50));
            }
            other => panic!("expected OutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn test_seek_slightly_ahead_waits_for_producer() {
        let cache = Arc::new(opened(80, 20).with_seek_wait(100, Duration::from_secs(5)));
        write_all(&cache, &pattern(0..20));

        let producer = Arc::clone(&cache);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            write_all(&producer, &pattern(20..60));
        });

        assert_eq!(cache.seek(50).unwrap(), 50);
        handle.join().unwrap();
        // The data before the target became history.
        assert_eq!(cache.cached_data_start_pos(), 0);
        assert_eq!(read_exact(&cache, 10), pattern(50..60));
    }

    #[test]
    fn test_seek_ahead_gives_up_after_timeout() {
        let cache = opened(80, 20).with_seek_wait(100, Duration::from_millis(30));
        write_all(&cache, &pattern(0..20));
        assert!(cache.seek(60).is_err());
        // The cursor was moved to the end while waiting.
        assert_eq!(cache.position(), 20);
    }

    #[test]
    fn test_reset_keeps_cached_window() {
        let cache = opened(80, 20);
        write_all(&cache, &pattern(0..50));
        assert!(!cache.reset(30).unwrap());
        assert_eq!(window(&cache), (0, 30, 50));
        assert!(cache.reset(1000).unwrap());
        assert_eq!(window(&cache), (1000, 1000, 1000));
        write_all(&cache, &pattern(1000..1010));
        assert_eq!(read_exact(&cache, 10), pattern(1000..1010));
    }

    #[test]
    fn test_forced_reset_discards() {
        let cache = opened(80, 20);
        write_all(&cache, &pattern(0..50));
        assert!(cache.reset_with(30, true).unwrap());
        assert_eq!(window(&cache), (30, 30, 30));
    }

    #[test]
    fn test_wait_for_data_zero_timeout_returns_immediately() {
        let cache = opened(80, 20);
        assert_eq!(cache.wait_for_data(0, Duration::ZERO).unwrap(), 0);
        assert_eq!(cache.wait_for_data(50, Duration::ZERO).unwrap(), 0);
        write_all(&cache, &pattern(0..7));
        assert_eq!(cache.wait_for_data(0, Duration::ZERO).unwrap(), 7);
    }

    #[test]
    fn test_wait_for_data_times_out() {
        let cache = opened(80, 20);
        let start = Instant::now();
        let res = cache.wait_for_data(50, Duration::from_millis(100));
        let elapsed = start.elapsed();
        assert!(res.unwrap_err().is_timeout());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_wait_for_data_clamps_minimum() {
        // Asking for more than the front region can hold must not hang.
        let cache = Arc::new(opened(30, 20));
        let producer = Arc::clone(&cache);
        let handle = thread::spawn(move || write_all(&producer, &pattern(0..30)));
        assert_eq!(cache.wait_for_data(1_000, Duration::from_secs(5)).unwrap(), 30);
        handle.join().unwrap();
    }

    #[test]
    fn test_end_of_input_wakes_waiter() {
        let cache = Arc::new(opened(80, 20));
        let producer = Arc::clone(&cache);
        let handle = thread::spawn(move || {
            write_all(&producer, &pattern(0..5));
            thread::sleep(Duration::from_millis(20));
            producer.end_of_input();
        });
        assert_eq!(cache.wait_for_data(50, Duration::from_secs(5)).unwrap(), 5);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_space_after_read() {
        let cache = Arc::new(opened(10, 0));
        write_all(&cache, &pattern(0..10));
        assert_eq!(cache.max_write_size(4), 0);
        assert!(!cache.wait_for_space(Duration::from_millis(5)));

        let consumer = Arc::clone(&cache);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            read_exact(&consumer, 4)
        });
        assert!(cache.wait_for_space(Duration::from_secs(5)));
        assert_eq!(handle.join().unwrap(), pattern(0..4));
        assert_eq!(cache.max_write_size(10), 4);
    }

    #[test]
    fn test_cached_position_queries() {
        let cache = opened(80, 20);
        write_all(&cache, &pattern(0..40));
        assert!(cache.is_cached_position(0));
        assert!(cache.is_cached_position(40));
        assert!(!cache.is_cached_position(41));
        assert_eq!(cache.cached_data_end_pos_if_seek_to(10), 40);
        assert_eq!(cache.cached_data_end_pos_if_seek_to(90), 90);
    }

    #[test]
    fn test_create_new_copies_configuration_only() {
        let cache = opened(80, 20);
        write_all(&cache, &pattern(0..40));
        let fresh = cache.create_new();
        assert!(matches!(fresh.write(b"x"), Err(CacheError::NotOpen)));
        fresh.open().unwrap();
        assert_eq!(fresh.cached_data_end_pos(), 0);
        assert_eq!(fresh.max_write_size(usize::MAX), 100);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn fuzz_window_never_exceeds_capacity(
            front in 1usize..64,
            back in 0usize..32,
            ops in proptest::collection::vec((1usize..80, 0usize..80), 1..40),
        ) {
            let cache = opened(front, back);
            let capacity = (front + back) as u64;
            let mut next = 0u64;
            let mut expected = 0u64;
            for (write_len, read_len) in ops {
                let data = pattern(next..next + write_len as u64);
                let n = cache.write(&data).unwrap();
                next += n as u64;

                let (beg, cur, end) = window(&cache);
                prop_assert!(end - beg <= capacity);
                prop_assert!(beg <= cur && cur <= end);

                let mut out = vec![0u8; read_len];
                match cache.read(&mut out) {
                    Ok(n) => {
                        prop_assert_eq!(&out[..n], &pattern(expected..expected + n as u64)[..]);
                        expected += n as u64;
                    }
                    Err(e) => prop_assert!(e.is_would_block()),
                }
            }
        }
    }
}
