//! Error taxonomy shared by the transport, the format handlers and the
//! session facade.
//!
//! Password, not-found and traversal failures are first-class variants so
//! callers can match on them instead of sniffing message strings. Lower-level
//! causes (reqwest, io) are wrapped but kept reachable through
//! [`std::error::Error::source`].

use std::io;

use thiserror::Error;

/// Errors produced by the archive library.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The URL could not be parsed or uses an unsupported scheme.
    #[error("invalid or unsupported URL: {0}")]
    InvalidUrl(String),

    /// The origin could not be reached or answered with an unexpected status.
    #[error("failed to access URL: {0}")]
    UrlAccess(String),

    /// No registered format handler recognized the archive.
    #[error("unsupported archive format")]
    UnsupportedFormat,

    /// The archive contains encrypted entries and no password was supplied.
    #[error("password required for encrypted archive")]
    PasswordRequired,

    /// The supplied password was rejected by the decoder.
    #[error("incorrect password for encrypted archive")]
    PasswordIncorrect,

    /// The requested entry does not exist in the archive.
    #[error("file not found in archive")]
    FileNotFound,

    /// The requested path escapes the archive root.
    #[error("path traversal detected")]
    PathTraversal,

    /// The archive exceeds the configured size cap.
    #[error("archive size {size} exceeds maximum allowed size {limit}")]
    TooLarge { size: u64, limit: u64 },

    /// The session was closed or its deadline expired.
    #[error("operation canceled")]
    Canceled,

    /// A container-level parse or decode failure.
    #[error("{0}")]
    Format(String),

    /// An unclassified internal failure (worker panic, channel breakage).
    #[error("internal error: {0}")]
    Internal(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    /// Wrap a decode failure with a short contextual prefix, preserving the
    /// cause in the message. Used where the underlying library only offers a
    /// display string.
    pub(crate) fn format(context: &str, cause: impl std::fmt::Display) -> Self {
        ArchiveError::Format(format!("{context}: {cause}"))
    }

    /// Recover an `ArchiveError` that was tunneled through `std::io::Error`,
    /// e.g. across a decoder that only speaks io errors.
    pub(crate) fn from_io(err: io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<ArchiveError>())
        {
            match err.into_inner().unwrap().downcast::<ArchiveError>() {
                Ok(inner) => *inner,
                Err(_) => ArchiveError::Internal("error downcast failed".into()),
            }
        } else {
            ArchiveError::Io(err)
        }
    }
}

impl From<ArchiveError> for io::Error {
    fn from(err: ArchiveError) -> io::Error {
        match err {
            ArchiveError::Io(inner) => inner,
            other => io::Error::other(other),
        }
    }
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;
