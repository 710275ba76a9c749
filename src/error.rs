//! Error types shared by every cache strategy.
//!
//! The cache layer reports four kinds of outcome: success, a hard error for the
//! current call, "would block" (no data yet, but more may come) and "timeout"
//! (a bounded wait elapsed). The last two are not failures of the cache; they
//! tell the caller to retry or wait.

use std::io;
use thiserror::Error;

/// Integer code for a successful call.
pub const CACHE_RC_OK: i32 = 0;
/// Integer code for an unrecoverable error on this call.
pub const CACHE_RC_ERROR: i32 = -1;
/// Integer code for "no data available yet".
pub const CACHE_RC_WOULD_BLOCK: i32 = -2;
/// Integer code for an elapsed wait.
pub const CACHE_RC_TIMEOUT: i32 = -3;

/// Errors returned by cache strategies and the cached stream.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache is not open")]
    NotOpen,
    #[error("no data available yet")]
    WouldBlock,
    #[error("timed out waiting for data")]
    Timeout,
    #[error("position {position} is outside the cached window {start}..={end}")]
    OutOfRange { position: u64, start: u64, end: u64 },
    #[error("failed to allocate a {0} byte cache buffer")]
    Allocation(usize),
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Maps the error onto the integer status taxonomy.
    pub fn code(&self) -> i32 {
        match self {
            CacheError::WouldBlock => CACHE_RC_WOULD_BLOCK,
            CacheError::Timeout => CACHE_RC_TIMEOUT,
            _ => CACHE_RC_ERROR,
        }
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, CacheError::WouldBlock)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CacheError::Timeout)
    }
}

impl From<CacheError> for io::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Io(e) => e,
            CacheError::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, err),
            CacheError::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            CacheError::OutOfRange { .. } | CacheError::InvalidConfig(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CacheError::WouldBlock.code(), CACHE_RC_WOULD_BLOCK);
        assert_eq!(CacheError::Timeout.code(), CACHE_RC_TIMEOUT);
        assert_eq!(CacheError::NotOpen.code(), CACHE_RC_ERROR);
        assert_eq!(CacheError::Allocation(16).code(), CACHE_RC_ERROR);
        assert_ne!(CACHE_RC_OK, CACHE_RC_ERROR);
    }

    #[test]
    fn test_io_conversion_keeps_kind() {
        let e: io::Error = CacheError::Timeout.into();
        assert_eq!(e.kind(), io::ErrorKind::TimedOut);

        let e: io::Error = CacheError::WouldBlock.into();
        assert_eq!(e.kind(), io::ErrorKind::WouldBlock);

        let e: io::Error = CacheError::OutOfRange { position: 9, start: 0, end: 4 }.into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidInput);

        let inner = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let e: io::Error = CacheError::from(inner).into();
        assert_eq!(e.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_display_out_of_range() {
        let e = CacheError::OutOfRange { position: 500, start: 10, end: 110 };
        assert_eq!(e.to_string(), "position 500 is outside the cached window 10..=110");
    }
}
