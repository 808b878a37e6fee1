//! 7Z format handler.
//!
//! The decoder takes the seekable section plus the archive size and an
//! optional password at construction. Encryption shows up in two places:
//! at open time when the archive header itself is encrypted, and at entry
//! open time when only the content is. The library signals both through
//! password-flavored error messages, which are mapped onto the shared
//! taxonomy here.
//!
//! 7Z compresses groups of entries as solid blocks, so per-entry compressed
//! sizes do not exist; `compressed_size` is reported as 0.

use std::io::{self, Write};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sevenz_rust::{Password, SevenZReader};

use super::{
    ArchiveInfo, ArchiveSource, Extraction, FileEntry, FormatHandler, FormatKind, InfoOutcome,
    ListFilter, probe_read,
};
use crate::error::{ArchiveError, Result};
use crate::io::SectionReader;
use crate::path::normalize;

pub struct SevenZHandler;

fn is_password_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("password") || lower.contains("decrypt") || lower.contains("encrypt")
}

fn password_failure(has_password: bool) -> ArchiveError {
    if has_password {
        ArchiveError::PasswordIncorrect
    } else {
        ArchiveError::PasswordRequired
    }
}

fn map_open_error(err: sevenz_rust::Error, has_password: bool) -> ArchiveError {
    if is_password_message(&err.to_string()) {
        password_failure(has_password)
    } else {
        ArchiveError::format("failed to open 7z archive", err)
    }
}

fn open_reader(
    source: &ArchiveSource,
    password: Option<&str>,
) -> Result<SevenZReader<SectionReader>, sevenz_rust::Error> {
    let password = match password {
        Some(p) => Password::from(p),
        None => Password::empty(),
    };
    SevenZReader::new(source.section(), source.size(), password)
}

fn entry_to_file(entry: &sevenz_rust::SevenZArchiveEntry) -> FileEntry {
    let modified: SystemTime = entry.last_modified_date().into();
    FileEntry {
        path: entry.name().to_string(),
        size: if entry.is_directory() { 0 } else { entry.size() },
        compressed_size: 0,
        modified: DateTime::<Utc>::from(modified),
        is_dir: entry.is_directory(),
    }
}

/// Open one byte of the first file entry to discover content encryption.
///
/// Returns the password-mapped error when the decoder refuses, `Ok` when the
/// entry decodes (or the archive has no file entries).
fn probe_first_entry(source: &ArchiveSource, password: Option<&str>) -> Result<()> {
    let mut reader = open_reader(source, password).map_err(|e| map_open_error(e, password.is_some()))?;

    let result = reader.for_each_entries(|entry, content| {
        if entry.is_directory() {
            return Ok(true);
        }
        probe_read(content).map_err(|e| sevenz_rust::Error::other(e.to_string()))?;
        Ok(false)
    });

    result.map_err(|e| {
        if is_password_message(&e.to_string()) {
            password_failure(password.is_some())
        } else {
            ArchiveError::format("failed to read 7z entry", e)
        }
    })
}

impl FormatHandler for SevenZHandler {
    fn kind(&self) -> FormatKind {
        FormatKind::SevenZ
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["7z"]
    }

    fn matches(&self, magic: &[u8]) -> bool {
        magic.len() >= 6 && magic[..6] == [0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c]
    }

    fn info(&self, source: &ArchiveSource, password: Option<&str>) -> Result<InfoOutcome> {
        let reader = match open_reader(source, password) {
            Ok(reader) => reader,
            Err(err) => {
                let mapped = map_open_error(err, password.is_some());
                return match mapped {
                    ArchiveError::PasswordRequired | ArchiveError::PasswordIncorrect => {
                        // Header encryption: nothing can be enumerated.
                        let info = ArchiveInfo {
                            is_encrypted: true,
                            requires_password: true,
                            ..ArchiveInfo::default()
                        };
                        Ok(InfoOutcome::partial(info, mapped))
                    }
                    other => Err(other),
                };
            }
        };

        let mut info = ArchiveInfo::default();
        let mut has_files = false;
        for entry in &reader.archive().files {
            has_files |= !entry.is_directory();
            info.push(entry_to_file(entry));
        }
        drop(reader);

        if !has_files {
            return Ok(InfoOutcome::ok(info));
        }

        // Content encryption is invisible in the header; probing without a
        // password tells the two cases apart.
        match probe_first_entry(source, None) {
            Ok(()) => Ok(InfoOutcome::ok(info)),
            Err(ArchiveError::PasswordRequired) | Err(ArchiveError::PasswordIncorrect) => {
                info.is_encrypted = true;
                match password {
                    None => {
                        info.requires_password = true;
                        Ok(InfoOutcome::partial(info, ArchiveError::PasswordRequired))
                    }
                    Some(password) => match probe_first_entry(source, Some(password)) {
                        Ok(()) => Ok(InfoOutcome::ok(info)),
                        Err(
                            ArchiveError::PasswordRequired | ArchiveError::PasswordIncorrect,
                        ) => {
                            info.requires_password = true;
                            Ok(InfoOutcome::partial(info, ArchiveError::PasswordIncorrect))
                        }
                        Err(other) => Err(other),
                    },
                }
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
        let reader =
            open_reader(source, password).map_err(|e| map_open_error(e, password.is_some()))?;

        let filter = ListFilter::new(inner_path);
        let files = reader
            .archive()
            .files
            .iter()
            .filter(|entry| filter.matches(&normalize(entry.name())))
            .map(entry_to_file)
            .collect();

        Ok(files)
    }

    fn extract(
        &self,
        source: &ArchiveSource,
        path: &str,
        password: Option<&str>,
    ) -> Result<Extraction> {
        let mut reader =
            open_reader(source, password).map_err(|e| map_open_error(e, password.is_some()))?;

        let target = normalize(path);
        let size = reader
            .archive()
            .files
            .iter()
            .find(|entry| normalize(entry.name()) == target)
            .map(|entry| if entry.is_directory() { 0 } else { entry.size() })
            .ok_or(ArchiveError::FileNotFound)?;

        let has_password = password.is_some();
        let pump = Box::new(move |writer: &mut dyn Write| {
            let mut copy_error: Option<io::Error> = None;

            let result = reader.for_each_entries(|entry, content| {
                if normalize(entry.name()) != target {
                    return Ok(true);
                }
                if let Err(err) = io::copy(content, &mut *writer) {
                    copy_error = Some(err);
                    return Err(sevenz_rust::Error::other("copy aborted"));
                }
                Ok(false)
            });

            if let Some(err) = copy_error {
                return Err(ArchiveError::from_io(err));
            }
            result.map_err(|e| {
                if is_password_message(&e.to_string()) {
                    password_failure(has_password)
                } else {
                    ArchiveError::format("failed to extract 7z entry", e)
                }
            })
        });

        Ok(Extraction { size, pump })
    }
}
