//! RAR format handler (v4 and v5).
//!
//! The decoder is a path-based FFI wrapper around the unrar library, so each
//! operation first spools the remote surface into a named temp file; the
//! session's size cap bounds the spool. The decoder is strictly forward-only:
//! enumeration walks headers sequentially, and `extract` re-opens the
//! archive and advances entries until the target matches.
//!
//! The library does not expose a structured encryption flag. Encrypted
//! archives surface as password-flavored errors during open or iteration,
//! which are mapped onto the shared taxonomy in one place
//! ([`map_rar_error`]). Per-entry packed sizes are likewise not surfaced;
//! `compressed_size` is reported as 0.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use unrar::error::{Code, UnrarError};
use unrar::Archive;

use super::{
    ArchiveInfo, ArchiveSource, Extraction, FileEntry, FormatHandler, FormatKind, InfoOutcome,
    ListFilter,
};
use crate::error::{ArchiveError, Result};
use crate::path::normalize;

pub struct RarHandler;

fn map_rar_error(err: &UnrarError, has_password: bool) -> ArchiveError {
    let message = err.to_string().to_lowercase();
    let password_related = matches!(err.code, Code::MissingPassword | Code::BadPassword)
        || message.contains("password")
        || message.contains("encrypt");

    if password_related {
        if has_password {
            ArchiveError::PasswordIncorrect
        } else {
            ArchiveError::PasswordRequired
        }
    } else {
        ArchiveError::format("failed to read RAR archive", err)
    }
}

/// MS-DOS timestamp as stored in RAR headers.
fn dos_mod_time(stamp: u32) -> DateTime<Utc> {
    if stamp == 0 {
        return DateTime::<Utc>::UNIX_EPOCH;
    }
    let year = ((stamp >> 25) & 0x7f) + 1980;
    let month = (stamp >> 21) & 0x0f;
    let day = (stamp >> 16) & 0x1f;
    let hour = (stamp >> 11) & 0x1f;
    let minute = (stamp >> 5) & 0x3f;
    let second = (stamp & 0x1f) * 2;

    NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn header_to_file(header: &unrar::FileHeader) -> FileEntry {
    let path = header.filename.to_string_lossy().into_owned();
    let is_dir = header.is_directory();
    FileEntry {
        path,
        size: if is_dir { 0 } else { header.unpacked_size },
        compressed_size: 0,
        modified: dos_mod_time(header.file_time),
        is_dir,
    }
}

/// Walk every header of the spooled archive.
fn scan(spool: &Path, password: Option<&str>) -> Result<Vec<FileEntry>> {
    let listing = match password {
        Some(password) => Archive::with_password(spool, password).open_for_listing(),
        None => Archive::new(spool).open_for_listing(),
    }
    .map_err(|e| map_rar_error(&e, password.is_some()))?;

    let mut files = Vec::new();
    for header in listing {
        let header = header.map_err(|e| map_rar_error(&e, password.is_some()))?;
        files.push(header_to_file(&header));
    }
    Ok(files)
}

impl FormatHandler for RarHandler {
    fn kind(&self) -> FormatKind {
        FormatKind::Rar
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rar"]
    }

    fn matches(&self, magic: &[u8]) -> bool {
        // RAR 4.x: Rar!\x1a\x07\x00, RAR 5.x: Rar!\x1a\x07\x01\x00.
        (magic.len() >= 7 && magic[..7] == *b"Rar!\x1a\x07\x00")
            || (magic.len() >= 8 && magic[..8] == *b"Rar!\x1a\x07\x01\x00")
    }

    fn info(&self, source: &ArchiveSource, password: Option<&str>) -> Result<InfoOutcome> {
        let spool = source.spool_to_temp()?;

        match scan(spool.path(), password) {
            Ok(files) => {
                let mut info = ArchiveInfo::default();
                for file in files {
                    info.push(file);
                }
                Ok(InfoOutcome::ok(info))
            }
            Err(err @ (ArchiveError::PasswordRequired | ArchiveError::PasswordIncorrect)) => {
                let info = ArchiveInfo {
                    is_encrypted: true,
                    requires_password: true,
                    ..ArchiveInfo::default()
                };
                Ok(InfoOutcome::partial(info, err))
            }
            Err(other) => Err(other),
        }
    }

    fn list(
        &self,
        source: &ArchiveSource,
        inner_path: &str,
        password: Option<&str>,
    ) -> Result<Vec<FileEntry>> {
        let spool = source.spool_to_temp()?;
        let filter = ListFilter::new(inner_path);

        let files = scan(spool.path(), password)?
            .into_iter()
            .filter(|file| filter.matches(&normalize(&file.path)))
            .collect();
        Ok(files)
    }

    fn extract(
        &self,
        source: &ArchiveSource,
        path: &str,
        password: Option<&str>,
    ) -> Result<Extraction> {
        let spool = source.spool_to_temp()?;
        let target = normalize(path);

        let size = scan(spool.path(), password)?
            .into_iter()
            .find(|file| normalize(&file.path) == target)
            .map(|file| file.size)
            .ok_or(ArchiveError::FileNotFound)?;

        let password = password.map(str::to_owned);
        let pump = Box::new(move |writer: &mut dyn Write| {
            let has_password = password.is_some();
            let mut archive = match password.as_deref() {
                Some(password) => {
                    Archive::with_password(spool.path(), password).open_for_processing()
                }
                None => Archive::new(spool.path()).open_for_processing(),
            }
            .map_err(|e| map_rar_error(&e, has_password))?;

            loop {
                match archive
                    .read_header()
                    .map_err(|e| map_rar_error(&e, has_password))?
                {
                    Some(cursor) => {
                        let entry_path = cursor.entry().filename.clone();
                        if normalize(&entry_path.to_string_lossy()) == target {
                            // The decoder only extracts to the filesystem;
                            // unpack into a scratch dir and stream from there.
                            let scratch = tempfile::tempdir()?;
                            cursor
                                .extract_with_base(scratch.path())
                                .map_err(|e| map_rar_error(&e, has_password))?;

                            let mut file = File::open(scratch.path().join(&entry_path))?;
                            io::copy(&mut file, writer).map_err(ArchiveError::from_io)?;
                            return Ok(());
                        }
                        archive = cursor.skip().map_err(|e| map_rar_error(&e, has_password))?;
                    }
                    None => break,
                }
            }

            Err(ArchiveError::FileNotFound)
        });

        Ok(Extraction { size, pump })
    }
}
