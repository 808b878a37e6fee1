//! Blocking bounded view over the async random-access surface.
//!
//! The container decoders (`zip`, `sevenz-rust`, `tar` and the compression
//! wrappers) are synchronous and expect `std::io::Read`/`Seek` over the whole
//! archive. [`SectionReader`] provides that: it covers `[offset, offset+len)`
//! of a [`ReadAt`] source and drives the async reads with
//! [`Handle::block_on`]. It must therefore only be used from blocking
//! threads (`tokio::task::spawn_blocking`), which is where the facade runs
//! every format handler.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tokio::runtime::Handle;

use super::ReadAt;

/// Bounded `Read + Seek` section of a [`ReadAt`] source.
///
/// Cloning yields an independent cursor over the same window.
#[derive(Clone)]
pub struct SectionReader {
    source: Arc<dyn ReadAt>,
    handle: Handle,
    offset: u64,
    len: u64,
    pos: u64,
}

impl SectionReader {
    /// A view over `[offset, offset + len)` of `source`.
    pub fn new(source: Arc<dyn ReadAt>, handle: Handle, offset: u64, len: u64) -> Self {
        Self {
            source,
            handle,
            offset,
            len,
            pos: 0,
        }
    }

    /// Size of the section in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Positioned read relative to the start of the section. Does not move
    /// the sequential cursor.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        if pos >= self.len {
            return Ok(0);
        }
        let window = (buf.len() as u64).min(self.len - pos) as usize;
        let absolute = self.offset + pos;
        let source = Arc::clone(&self.source);
        let n = self
            .handle
            .block_on(async move { source.read_at(absolute, &mut buf[..window]).await })
            .map_err(io::Error::from)?;
        Ok(n)
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SectionReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => self.len as i128 + delta as i128,
        };

        if target < 0 || target > self.len as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek out of section bounds",
            ));
        }

        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;

    struct MemReader(Vec<u8>);

    #[async_trait]
    impl ReadAt for MemReader {
        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            if offset >= self.0.len() as u64 {
                return Ok(0);
            }
            let start = offset as usize;
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }

        fn size(&self) -> u64 {
            self.0.len() as u64
        }
    }

    fn section(data: &[u8], offset: u64, len: u64) -> SectionReader {
        SectionReader::new(
            Arc::new(MemReader(data.to_vec())),
            Handle::current(),
            offset,
            len,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sequential_read_stays_in_window() {
        let mut reader = section(b"0123456789", 2, 5);
        let out = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        })
        .await
        .unwrap();
        assert_eq!(out, b"23456");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_past_end_is_eof() {
        let reader = section(b"abcdef", 0, 6);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4];
            assert_eq!(reader.read_at(&mut buf, 6).unwrap(), 0);
            // A read overlapping the end returns exactly the bytes that exist.
            assert_eq!(reader.read_at(&mut buf, 4).unwrap(), 2);
            assert_eq!(&buf[..2], b"ef");
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn seek_is_bounded() {
        let mut reader = section(b"0123456789", 0, 10);
        tokio::task::spawn_blocking(move || {
            assert_eq!(reader.seek(SeekFrom::End(-3)).unwrap(), 7);
            let mut buf = [0u8; 3];
            reader.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"789");

            assert_eq!(reader.seek(SeekFrom::Start(10)).unwrap(), 10);
            assert!(reader.seek(SeekFrom::Current(1)).is_err());
            assert!(reader.seek(SeekFrom::End(-11)).is_err());
        })
        .await
        .unwrap();
    }
}
