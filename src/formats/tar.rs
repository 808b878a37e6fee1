//! TAR family handler: plain tar plus gzip, bzip2 and xz wrapped streams.
//!
//! The outer wrapper is sniffed from the first bytes of the surface and the
//! matching decompressor layered over a section covering the whole archive.
//! The resulting tar stream is strictly forward-only, so `extract` re-opens
//! the pipeline from the start: one pass resolves the entry and its size,
//! a second pass streams the bytes.

use std::io::{self, Read, Write};

use chrono::{DateTime, TimeZone, Utc};

use super::{
    ArchiveInfo, ArchiveSource, Extraction, FileEntry, FormatHandler, FormatKind, InfoOutcome,
    ListFilter,
};
use crate::error::{ArchiveError, Result};
use crate::path::normalize;

pub struct TarHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wrapper {
    Gzip,
    Bzip2,
    Xz,
    None,
}

fn sniff_wrapper(magic: &[u8]) -> Wrapper {
    if magic.len() >= 2 && magic[0] == 0x1f && magic[1] == 0x8b {
        Wrapper::Gzip
    } else if magic.len() >= 2 && magic[0] == b'B' && magic[1] == b'Z' {
        Wrapper::Bzip2
    } else if magic.len() >= 6 && magic[..6] == [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00] {
        Wrapper::Xz
    } else {
        Wrapper::None
    }
}

fn tar_mod_time(secs: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Passwords are meaningless for tar; any non-empty one is an error.
fn reject_password(password: Option<&str>) -> Result<()> {
    match password {
        Some(p) if !p.is_empty() => Err(ArchiveError::Format(
            "TAR format does not support encryption".into(),
        )),
        _ => Ok(()),
    }
}

impl TarHandler {
    /// Build the decompression pipeline over a fresh section.
    fn open_stream(&self, source: &ArchiveSource) -> Result<Box<dyn Read + Send>> {
        let mut magic = [0u8; 6];
        let section = source.section();
        let n = section.read_at(&mut magic, 0)?;

        let stream: Box<dyn Read + Send> = match sniff_wrapper(&magic[..n]) {
            Wrapper::Gzip => Box::new(flate2::read::GzDecoder::new(section)),
            Wrapper::Bzip2 => Box::new(bzip2::read::BzDecoder::new(section)),
            Wrapper::Xz => Box::new(xz2::read::XzDecoder::new(section)),
            Wrapper::None => Box::new(section),
        };
        Ok(stream)
    }
}

fn entry_to_file<R: Read>(entry: &tar::Entry<'_, R>) -> Result<FileEntry> {
    let header = entry.header();
    let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    let is_dir = header.entry_type().is_dir();
    let size = header
        .size()
        .map_err(|e| ArchiveError::format("failed to read TAR header", e))?;
    let mtime = header
        .mtime()
        .map_err(|e| ArchiveError::format("failed to read TAR header", e))?;

    Ok(FileEntry {
        path,
        size: if is_dir { 0 } else { size },
        compressed_size: 0,
        modified: tar_mod_time(mtime),
        is_dir,
    })
}

impl FormatHandler for TarHandler {
    fn kind(&self) -> FormatKind {
        FormatKind::Tar
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["tar", "gz", "tgz", "bz2", "tbz2", "xz", "txz"]
    }

    fn matches(&self, magic: &[u8]) -> bool {
        if sniff_wrapper(magic) != Wrapper::None {
            return true;
        }
        // Plain tar: "ustar" at offset 257.
        magic.len() >= 262 && &magic[257..262] == b"ustar"
    }

    fn info(&self, source: &ArchiveSource, password: Option<&str>) -> Result<InfoOutcome> {
        reject_password(password)?;

        let mut archive = tar::Archive::new(self.open_stream(source)?);
        let mut info = ArchiveInfo::default();

        for entry in archive
            .entries()
            .map_err(|e| ArchiveError::format("failed to read TAR archive", e))?
        {
            let entry = entry.map_err(|e| ArchiveError::format("failed to read TAR header", e))?;
            info.push(entry_to_file(&entry)?);
        }

        Ok(InfoOutcome::ok(info))
    }

    fn list(
        &self,
        source: &ArchiveSource,
        inner_path: &str,
        password: Option<&str>,
    ) -> Result<Vec<FileEntry>> {
        reject_password(password)?;

        let filter = ListFilter::new(inner_path);
        let mut archive = tar::Archive::new(self.open_stream(source)?);
        let mut files = Vec::new();

        for entry in archive
            .entries()
            .map_err(|e| ArchiveError::format("failed to read TAR archive", e))?
        {
            let entry = entry.map_err(|e| ArchiveError::format("failed to read TAR header", e))?;
            let file = entry_to_file(&entry)?;
            if filter.matches(&normalize(&file.path)) {
                files.push(file);
            }
        }

        Ok(files)
    }

    fn extract(
        &self,
        source: &ArchiveSource,
        path: &str,
        password: Option<&str>,
    ) -> Result<Extraction> {
        reject_password(password)?;

        let target = normalize(path);

        // First pass resolves the entry and its size.
        let mut size = None;
        let mut archive = tar::Archive::new(self.open_stream(source)?);
        for entry in archive
            .entries()
            .map_err(|e| ArchiveError::format("failed to read TAR archive", e))?
        {
            let entry = entry.map_err(|e| ArchiveError::format("failed to read TAR header", e))?;
            let file = entry_to_file(&entry)?;
            if normalize(&file.path) == target {
                size = Some(file.size);
                break;
            }
        }

        let Some(size) = size else {
            return Err(ArchiveError::FileNotFound);
        };

        // Second pass re-opens the forward-only pipeline and streams the
        // matching entry.
        let stream = self.open_stream(source)?;
        let pump = Box::new(move |writer: &mut dyn Write| {
            let mut archive = tar::Archive::new(stream);
            for entry in archive
                .entries()
                .map_err(|e| ArchiveError::format("failed to read TAR archive", e))?
            {
                let mut entry =
                    entry.map_err(|e| ArchiveError::format("failed to read TAR header", e))?;
                let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
                if normalize(&name) == target {
                    io::copy(&mut entry, writer).map_err(ArchiveError::from_io)?;
                    return Ok(());
                }
            }
            Err(ArchiveError::FileNotFound)
        });

        Ok(Extraction { size, pump })
    }
}
