//! # runarc
//!
//! On-demand inspection and extraction of remote archives, ZIP, RAR, 7Z and
//! TAR (plain, gzip, bzip2, xz), without downloading the archive in full.
//!
//! Given a URL on an origin that supports byte-range requests, runarc builds
//! a random-access byte surface over HTTP Range GETs and feeds it to
//! format-specific readers. Three operations are exposed: summary metadata,
//! entry listing (optionally scoped to one directory level) and streaming a
//! single entry's decompressed bytes. Origins that ignore the `Range` header
//! are handled transparently by discarding and capping.
//!
//! ## Example
//!
//! ```no_run
//! use runarc::{quick_list, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let files = quick_list("https://example.com/archive.zip", "/", None, &config).await?;
//!     for file in &files {
//!         println!("{} ({} bytes)", file.path, file.size);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Long-lived use goes through [`Archive`], which binds the URL once and
//! answers any number of queries before [`Archive::close`].

pub mod archive;
pub mod cli;
pub mod config;
pub mod error;
pub mod formats;
pub mod io;
pub mod path;
pub mod server;

pub use archive::{quick_extract, quick_info, quick_list, Archive, EntryStream};
pub use config::{Config, Timeout};
pub use error::ArchiveError;
pub use formats::{ArchiveInfo, FileEntry, FormatKind, InfoOutcome};
