//! Byte-surface abstractions: the async [`ReadAt`] contract, the HTTP Range
//! transport implementing it, and the blocking [`SectionReader`] view handed
//! to synchronous decompression libraries.

mod http;
mod section;

pub use self::http::{HttpRangeReader, RangeClient};
pub use self::section::SectionReader;

use async_trait::async_trait;

use crate::error::Result;

/// Trait for random access reading from a fixed-size data source.
///
/// Implementations must be safe for concurrent `read_at` calls; there is no
/// shared cursor. Reads starting at or past `size()` return `Ok(0)`
/// (end-of-input, never an error), and a read overlapping the end returns
/// exactly the bytes that exist.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer, returning the
    /// number of bytes read.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size of the data source in bytes.
    fn size(&self) -> u64;
}
