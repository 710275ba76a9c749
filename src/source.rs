// Source abstraction module
// The cached stream pulls bytes from anything readable and seekable. This
// module names that contract and provides a throttling wrapper that turns a
// fast local source into a slow, high-latency one for demos and tests.

use std::io::{self, Read, Seek, SeekFrom};
use std::thread;
use std::time::{Duration, Instant};

/// A byte source the fill thread can read from and reposition.
pub trait Source: Read + Seek + Send + 'static {}

impl<T> Source for T where T: Read + Seek + Send + 'static {}

/// Total length of `source`, leaving its cursor at the start.
pub fn source_len<S: Seek>(source: &mut S) -> io::Result<u64> {
    let len = source.seek(SeekFrom::End(0))?;
    source.seek(SeekFrom::Start(0))?;
    Ok(len)
}

/// Wraps a source and limits its throughput, with an optional fixed latency
/// on every read and seek.
pub struct ThrottledSource<S> {
    inner: S,
    bytes_per_sec: Option<u64>,
    latency: Duration,
    max_read: usize,
    started: Instant,
    delivered: u64,
}

impl<S> ThrottledSource<S> {
    /// Unthrottled wrapper; configure with the builder methods.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            bytes_per_sec: None,
            latency: Duration::ZERO,
            max_read: usize::MAX,
            started: Instant::now(),
            delivered: 0,
        }
    }

    pub fn bytes_per_sec(mut self, rate: u64) -> Self {
        self.bytes_per_sec = (rate > 0).then_some(rate);
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Cap the size of a single read, like a network packet.
    pub fn max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read.max(1);
        self
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn pace(&self) {
        if let Some(rate) = self.bytes_per_sec {
            let due = Duration::from_secs_f64(self.delivered as f64 / rate as f64);
            let elapsed = self.started.elapsed();
            if due > elapsed {
                thread::sleep(due - elapsed);
            }
        }
    }
}

impl<S: Read> Read for ThrottledSource<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let len = buf.len().min(self.max_read);
        let n = self.inner.read(&mut buf[..len])?;
        self.delivered += n as u64;
        self.pace();
        Ok(n)
    }
}

impl<S: Seek> Seek for ThrottledSource<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        self.inner.seek(pos)
    }
}
