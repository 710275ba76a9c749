//! Test utilities for readahead-cache
// Provides deterministic stream contents and temporary source files.

use std::io::Write;
use std::ops::Range;
use tempfile::NamedTempFile;

/// Bytes of the synthetic test stream at the given absolute positions.
///
/// The value of each byte depends only on its position, so any slice of the
/// stream can be checked without keeping the original around.
pub fn pattern(range: Range<u64>) -> Vec<u8> {
    range.map(|i| (i % 251) as u8).collect()
}

/// Create a temporary file holding the first `len` bytes of the test stream.
pub fn create_test_source(len: u64) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    // Write in slices to keep memory flat for large sources.
    let mut pos = 0;
    while pos < len {
        let end = (pos + 64 * 1024).min(len);
        file.write_all(&pattern(pos..end)).unwrap();
        pos = end;
    }
    file.flush().unwrap();
    file
}
