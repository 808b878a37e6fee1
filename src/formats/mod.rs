//! Format handlers: the data model, the polymorphic handler contract, magic
//! detection and the registry.
//!
//! Each container format implements [`FormatHandler`] as a plain value; the
//! registry maps names to handlers and performs detection. Handlers are
//! synchronous (the decoder crates are) and run under
//! `tokio::task::spawn_blocking`, reading the remote surface through the
//! blocking [`SectionReader`] bridge carried by [`ArchiveSource`].

mod rar;
mod sevenz;
mod tar;
mod zip;

pub use self::rar::RarHandler;
pub use self::sevenz::SevenZHandler;
pub use self::tar::TarHandler;
pub use self::zip::ZipHandler;

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;

use crate::error::{ArchiveError, Result};
use crate::io::{ReadAt, SectionReader};
use crate::path::normalize;

/// One archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Decoded display path. Never interpreted against the host filesystem.
    pub path: String,
    /// Uncompressed size in bytes. Always 0 for directories.
    pub size: u64,
    /// Compressed size in bytes; 0 when the container does not record it per
    /// entry (7Z solid blocks, TAR, RAR).
    pub compressed_size: u64,
    /// Modification timestamp.
    pub modified: DateTime<Utc>,
    /// Whether this entry is a directory.
    pub is_dir: bool,
}

/// Summary metadata over the whole archive.
#[derive(Debug, Clone, Default)]
pub struct ArchiveInfo {
    /// Any entry is encrypted.
    pub is_encrypted: bool,
    /// Encryption is present and no verified password is in hand.
    pub requires_password: bool,
    /// Count of non-directory entries.
    pub total_files: u64,
    /// Sum of non-directory uncompressed sizes.
    pub total_size: u64,
    /// Every entry, in container order.
    pub entries: Vec<FileEntry>,
    /// Archive-level comment, if the container has one.
    pub comment: Option<String>,
}

impl ArchiveInfo {
    /// Append an entry, maintaining the file count and size totals.
    pub(crate) fn push(&mut self, entry: FileEntry) {
        if !entry.is_dir {
            self.total_files += 1;
            self.total_size += entry.size;
        }
        self.entries.push(entry);
    }
}

/// Outcome of an info query.
///
/// Encryption may be discovered while enumerating, in which case the
/// populated metadata is returned together with the password error instead of
/// being discarded: callers must accept the dual signal.
#[derive(Debug)]
pub struct InfoOutcome {
    pub info: ArchiveInfo,
    pub error: Option<ArchiveError>,
}

impl InfoOutcome {
    pub(crate) fn ok(info: ArchiveInfo) -> Self {
        Self { info, error: None }
    }

    pub(crate) fn partial(info: ArchiveInfo, error: ArchiveError) -> Self {
        Self {
            info,
            error: Some(error),
        }
    }
}

/// Container format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    Zip,
    Rar,
    SevenZ,
    /// Plain tar and its gzip/bzip2/xz wrapped variants.
    Tar,
}

impl FormatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatKind::Zip => "zip",
            FormatKind::Rar => "rar",
            FormatKind::SevenZ => "7z",
            FormatKind::Tar => "tar",
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The byte surface and helpers a handler operates on.
#[derive(Clone)]
pub struct ArchiveSource {
    reader: Arc<dyn ReadAt>,
    size: u64,
    handle: Handle,
}

impl ArchiveSource {
    pub fn new(reader: Arc<dyn ReadAt>, size: u64, handle: Handle) -> Self {
        Self {
            reader,
            size,
            handle,
        }
    }

    /// Total archive size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Blocking section covering the whole archive.
    pub fn section(&self) -> SectionReader {
        self.section_at(0, self.size)
    }

    /// Blocking section covering `[offset, offset + len)`.
    pub fn section_at(&self, offset: u64, len: u64) -> SectionReader {
        SectionReader::new(Arc::clone(&self.reader), self.handle.clone(), offset, len)
    }

    /// Stream the whole archive into a named temp file.
    ///
    /// Needed by decoders that only accept filesystem paths. The session's
    /// size cap has already bounded `size` at creation.
    pub fn spool_to_temp(&self) -> Result<tempfile::NamedTempFile> {
        let mut spool = tempfile::NamedTempFile::new()?;
        let mut section = self.section();
        io::copy(&mut section, spool.as_file_mut()).map_err(ArchiveError::from_io)?;
        Ok(spool)
    }
}

/// A ready-to-run extraction: the entry's uncompressed size plus a one-shot
/// pump that writes exactly that many bytes.
pub struct Extraction {
    pub size: u64,
    pub pump: Box<dyn FnOnce(&mut dyn Write) -> Result<()> + Send>,
}

/// Contract every container format implements.
///
/// Handlers are stateless values; all state lives in the [`ArchiveSource`]
/// they are handed per call. The `matches` predicate is a pure magic-number
/// probe over a prefix of the surface and is advisory only: a positive match
/// may still fail to open.
pub trait FormatHandler: Send + Sync {
    fn kind(&self) -> FormatKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Lower-cased extensions used as a detection hint.
    fn extensions(&self) -> &'static [&'static str];

    /// Magic-number probe against the first bytes of the surface.
    fn matches(&self, magic: &[u8]) -> bool;

    fn info(&self, source: &ArchiveSource, password: Option<&str>) -> Result<InfoOutcome>;

    fn list(
        &self,
        source: &ArchiveSource,
        inner_path: &str,
        password: Option<&str>,
    ) -> Result<Vec<FileEntry>>;

    fn extract(
        &self,
        source: &ArchiveSource,
        path: &str,
        password: Option<&str>,
    ) -> Result<Extraction>;
}

/// How many leading bytes detection reads. Covers every magic number
/// including the `ustar` marker at offset 257.
const MAGIC_PROBE_LEN: usize = 512;

/// Registry of format handlers, populated once at process start.
pub struct Registry {
    handlers: Vec<Arc<dyn FormatHandler>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            handlers: vec![
                Arc::new(ZipHandler),
                Arc::new(RarHandler),
                Arc::new(SevenZHandler),
                Arc::new(TarHandler),
            ],
        }
    }
}

impl Registry {
    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        static REGISTRY: std::sync::OnceLock<Registry> = std::sync::OnceLock::new();
        REGISTRY.get_or_init(Registry::default)
    }

    /// Look up a handler by format name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn FormatHandler>> {
        self.handlers.iter().find(|h| h.name() == name).cloned()
    }

    /// Detect the archive format from magic bytes, using the lower-cased
    /// file extension as a tie-break hint.
    ///
    /// Handlers whose extension set contains the hint are probed first; if
    /// none match, every handler is probed. Detection failure is
    /// [`ArchiveError::UnsupportedFormat`].
    pub async fn detect(
        &self,
        reader: &dyn ReadAt,
        extension: &str,
    ) -> Result<Arc<dyn FormatHandler>> {
        let probe_len = MAGIC_PROBE_LEN.min(reader.size() as usize);
        let mut magic = vec![0u8; probe_len];
        let n = reader.read_at(0, &mut magic).await?;
        magic.truncate(n);

        for handler in &self.handlers {
            if handler.extensions().contains(&extension) && handler.matches(&magic) {
                return Ok(Arc::clone(handler));
            }
        }

        for handler in &self.handlers {
            if handler.matches(&magic) {
                return Ok(Arc::clone(handler));
            }
        }

        Err(ArchiveError::UnsupportedFormat)
    }
}

/// Scope of a `list` operation, parsed from the caller's `inner_path`.
///
/// The empty string lists every entry; `"/"` lists the top level; any other
/// value lists the direct children of that directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListFilter {
    All,
    TopLevel,
    /// Normalized directory prefix including the trailing slash.
    Dir(String),
}

impl ListFilter {
    pub fn new(inner_path: &str) -> Self {
        if inner_path.is_empty() {
            return ListFilter::All;
        }
        if inner_path == "/" {
            return ListFilter::TopLevel;
        }
        let normalized = normalize(inner_path);
        if normalized.is_empty() {
            ListFilter::All
        } else {
            ListFilter::Dir(format!("{normalized}/"))
        }
    }

    /// Whether a normalized entry name falls inside the scope.
    pub fn matches(&self, normalized: &str) -> bool {
        match self {
            ListFilter::All => true,
            ListFilter::TopLevel => !normalized.contains('/'),
            ListFilter::Dir(prefix) => match normalized.strip_prefix(prefix.as_str()) {
                Some(rest) => !rest.is_empty() && !rest.contains('/'),
                None => false,
            },
        }
    }
}

/// Pull exactly one probe byte out of a decoder stream.
///
/// Used to verify passwords: an encrypted entry that opens cleanly may still
/// fail on the first read.
pub(crate) fn probe_read(reader: &mut dyn Read) -> io::Result<usize> {
    let mut probe = [0u8; 1];
    reader.read(&mut probe)
}
