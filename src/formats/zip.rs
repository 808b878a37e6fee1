//! ZIP format handler.
//!
//! The `zip` crate locates the end-of-central-directory record through the
//! seekable [`SectionReader`](crate::io::SectionReader), so listing an
//! archive only fetches its tail. Entry metadata is read from raw entries
//! (no decompression); passwords are verified once by opening a single
//! encrypted entry and pulling a probe byte through the decoder.
//!
//! ZIP does not mandate UTF-8 filenames. Raw name bytes go through a charset
//! detector and are decoded only when the guess falls inside a closed set of
//! encodings; anything else surfaces the raw bytes. The detector is a
//! heuristic and never fails the listing.

use std::io::{self, Write};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use encoding_rs::Encoding;
use zip::read::ZipArchive;
use zip::result::ZipError;

use super::{
    ArchiveInfo, ArchiveSource, Extraction, FileEntry, FormatHandler, FormatKind, InfoOutcome,
    ListFilter, probe_read,
};
use crate::error::{ArchiveError, Result};
use crate::io::SectionReader;
use crate::path::normalize;

pub struct ZipHandler;

/// The closed set of encodings a detected charset may select.
static DECODERS: &[&Encoding] = &[
    encoding_rs::UTF_8,
    encoding_rs::UTF_16BE,
    encoding_rs::UTF_16LE,
    // ISO-8859-1 maps to windows-1252 in the WHATWG encoding registry.
    encoding_rs::WINDOWS_1252,
    encoding_rs::ISO_8859_2,
    encoding_rs::WINDOWS_1251,
    encoding_rs::SHIFT_JIS,
    encoding_rs::GB18030,
    encoding_rs::GBK,
    encoding_rs::EUC_KR,
    encoding_rs::BIG5,
];

/// Decode a raw ZIP filename to displayable text.
fn decode_name(raw: &[u8]) -> String {
    if raw.is_ascii() {
        return String::from_utf8_lossy(raw).into_owned();
    }

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(raw, true);
    let guess = detector.guess(None, true);

    if DECODERS.contains(&guess) {
        let (decoded, _, had_errors) = guess.decode(raw);
        if !had_errors {
            return decoded.into_owned();
        }
    }

    String::from_utf8_lossy(raw).into_owned()
}

fn zip_mod_time(dt: Option<zip::DateTime>) -> DateTime<Utc> {
    dt.and_then(|dt| {
        NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?
            .and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)
    })
    .map(|naive| Utc.from_utc_datetime(&naive))
    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn open_archive(source: &ArchiveSource) -> Result<ZipArchive<SectionReader>> {
    ZipArchive::new(source.section())
        .map_err(|e| ArchiveError::format("failed to open ZIP archive", e))
}

/// Open one encrypted entry with the supplied password and pull a probe byte
/// through the decoder. Library password rejections map to
/// [`ArchiveError::PasswordIncorrect`].
fn verify_password(
    archive: &mut ZipArchive<SectionReader>,
    index: usize,
    password: &str,
) -> Result<()> {
    let mut file = archive
        .by_index_decrypt(index, password.as_bytes())
        .map_err(|e| match e {
            ZipError::InvalidPassword => ArchiveError::PasswordIncorrect,
            other => ArchiveError::format("failed to open encrypted file", other),
        })?;
    probe_read(&mut file).map_err(|_| ArchiveError::PasswordIncorrect)?;
    Ok(())
}

struct RawEntry {
    entry: FileEntry,
    normalized: String,
    encrypted: bool,
}

fn read_entry(archive: &mut ZipArchive<SectionReader>, index: usize) -> Result<RawEntry> {
    let file = archive
        .by_index_raw(index)
        .map_err(|e| ArchiveError::format("failed to read ZIP entry", e))?;

    let name = decode_name(file.name_raw());
    let is_dir = name.ends_with('/') || file.is_dir();

    Ok(RawEntry {
        normalized: normalize(&name),
        encrypted: file.encrypted(),
        entry: FileEntry {
            path: name,
            size: if is_dir { 0 } else { file.size() },
            compressed_size: file.compressed_size(),
            modified: zip_mod_time(file.last_modified()),
            is_dir,
        },
    })
}

impl FormatHandler for ZipHandler {
    fn kind(&self) -> FormatKind {
        FormatKind::Zip
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["zip"]
    }

    fn matches(&self, magic: &[u8]) -> bool {
        // PK\x03\x04, PK\x05\x06 (empty) or PK\x07\x08 (spanned).
        magic.len() >= 4
            && magic[0] == b'P'
            && magic[1] == b'K'
            && matches!((magic[2], magic[3]), (0x03, 0x04) | (0x05, 0x06) | (0x07, 0x08))
    }

    fn info(&self, source: &ArchiveSource, password: Option<&str>) -> Result<InfoOutcome> {
        let mut archive = open_archive(source)?;

        let mut info = ArchiveInfo::default();
        let comment = archive.comment().to_vec();
        if !comment.is_empty() {
            info.comment = Some(String::from_utf8_lossy(&comment).into_owned());
        }

        let mut first_encrypted = None;
        for index in 0..archive.len() {
            let raw = read_entry(&mut archive, index)?;
            if raw.encrypted {
                info.is_encrypted = true;
                first_encrypted.get_or_insert(index);
            }
            info.push(raw.entry);
        }

        let Some(index) = first_encrypted else {
            return Ok(InfoOutcome::ok(info));
        };

        match password {
            None => {
                info.requires_password = true;
                Ok(InfoOutcome::partial(info, ArchiveError::PasswordRequired))
            }
            Some(password) => match verify_password(&mut archive, index, password) {
                Ok(()) => Ok(InfoOutcome::ok(info)),
                Err(ArchiveError::PasswordIncorrect) => {
                    info.requires_password = true;
                    Ok(InfoOutcome::partial(info, ArchiveError::PasswordIncorrect))
                }
                Err(other) => Err(other),
            },
        }
    }

    fn list(
        &self,
        source: &ArchiveSource,
        inner_path: &str,
        password: Option<&str>,
    ) -> Result<Vec<FileEntry>> {
        let mut archive = open_archive(source)?;
        let filter = ListFilter::new(inner_path);

        let mut files = Vec::new();
        let mut first_encrypted = None;

        for index in 0..archive.len() {
            let raw = read_entry(&mut archive, index)?;
            if !filter.matches(&raw.normalized) {
                continue;
            }
            if raw.encrypted {
                first_encrypted.get_or_insert(index);
            }
            files.push(raw.entry);
        }

        if let Some(index) = first_encrypted {
            match password {
                None => return Err(ArchiveError::PasswordRequired),
                Some(password) => verify_password(&mut archive, index, password)?,
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
        let mut archive = open_archive(source)?;
        let target = normalize(path);

        let mut found = None;
        for index in 0..archive.len() {
            let raw = read_entry(&mut archive, index)?;
            if raw.normalized == target {
                found = Some((index, raw.entry.size, raw.encrypted));
                break;
            }
        }

        let Some((index, size, encrypted)) = found else {
            return Err(ArchiveError::FileNotFound);
        };

        if encrypted && password.is_none() {
            return Err(ArchiveError::PasswordRequired);
        }
        let password = password.map(str::to_owned);

        let pump = Box::new(move |writer: &mut dyn Write| {
            let mut file = match &password {
                Some(password) => archive
                    .by_index_decrypt(index, password.as_bytes())
                    .map_err(|e| match e {
                        ZipError::InvalidPassword => ArchiveError::PasswordIncorrect,
                        other => ArchiveError::format("failed to open file", other),
                    })?,
                None => archive
                    .by_index(index)
                    .map_err(|e| ArchiveError::format("failed to open file", e))?,
            };
            io::copy(&mut file, writer).map_err(ArchiveError::from_io)?;
            Ok(())
        });

        Ok(Extraction { size, pump })
    }
}
