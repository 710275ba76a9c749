//! readahead-cache: read-ahead caching between a slow byte source and its reader
//!
//! A producer fetches bytes from a slow or high-latency source in stream
//! order while a consumer reads forward and occasionally seeks. The cache
//! strategies in this crate buffer the difference:
//!
//! - [`CircularCache`]: bounded ring buffer with read-ahead and history.
//! - [`SimpleFileCache`]: unbounded cache backed by a temporary file.
//! - [`DoubleCache`]: keeps two strategies alive so hopping between two
//!   stream regions does not refetch either.
//!
//! [`CachedStream`] wires a strategy to a source with a background fill
//! thread and exposes the result as `Read + Seek`.

pub mod api;
pub mod circular;
pub mod config;
pub mod double;
pub mod error;
pub mod file_cache;
pub mod source;
pub mod strategy;

mod event;

#[cfg(test)]
mod testlib;

pub use api::{CachedStream, CachedStreamBuilder};
pub use circular::CircularCache;
pub use config::{CacheConfig, StrategyKind};
pub use double::DoubleCache;
pub use error::{CacheError, CacheResult};
pub use file_cache::SimpleFileCache;
pub use source::{Source, ThrottledSource};
pub use strategy::CacheStrategy;

static CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    CRATE_VERSION
}
