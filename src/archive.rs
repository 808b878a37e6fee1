//! Archive session facade.
//!
//! [`Archive::new`] binds a URL and a [`Config`] into a live session: it
//! validates the URL, probes the origin, enforces the size cap, builds the
//! range reader and detects the container format. The session then answers
//! [`info`](Archive::info), [`list`](Archive::list) and
//! [`extract`](Archive::extract) queries by running the detected handler on
//! a blocking worker.
//!
//! The [`quick_info`], [`quick_list`] and [`quick_extract`] helpers create a
//! session, perform one call and guarantee disposal. The stream returned by
//! [`quick_extract`] keeps its session alive until the stream itself is
//! dropped.

use std::io::{self, Write};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::error::{ArchiveError, Result};
use crate::formats::{
    ArchiveSource, FileEntry, FormatHandler, FormatKind, InfoOutcome, Registry,
};
use crate::io::{HttpRangeReader, RangeClient, ReadAt};
use crate::path::is_safe;

/// A live session over one remote archive.
///
/// Operations may run concurrently; each issues its own range fetches.
/// Closing the session trips its cancellation token, which aborts in-flight
/// fetches without waiting for extraction streams to finish. Dropping the
/// session closes it.
pub struct Archive {
    url: String,
    size: u64,
    reader: Arc<HttpRangeReader>,
    handler: Arc<dyn FormatHandler>,
    token: CancellationToken,
    deadline: Option<JoinHandle<()>>,
    handle: Handle,
    closed: AtomicBool,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("url", &self.url)
            .field("size", &self.size)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Archive {
    /// Create a session for the archive at `url`.
    pub async fn new(url: &str, config: &Config) -> Result<Self> {
        let parsed =
            Url::parse(url).map_err(|_| ArchiveError::InvalidUrl(url.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ArchiveError::InvalidUrl(
                "only HTTP/HTTPS URLs are supported".into(),
            ));
        }

        let client = Arc::new(RangeClient::new(config)?);

        let token = CancellationToken::new();
        let deadline = config.timeout.deadline().map(|duration| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                token.cancel();
            })
        });

        let fail = |err: ArchiveError| {
            token.cancel();
            if let Some(task) = &deadline {
                task.abort();
            }
            err
        };

        let (size, supports_range) = match client.head(url).await {
            Ok(probe) => probe,
            Err(ArchiveError::UrlAccess(msg)) => {
                return Err(fail(ArchiveError::UrlAccess(msg)))
            }
            Err(ArchiveError::Http(e)) => {
                return Err(fail(ArchiveError::UrlAccess(format!(
                    "failed to get file information: {e}"
                ))))
            }
            Err(other) => return Err(fail(other)),
        };

        if !supports_range && config.debug {
            tracing::warn!(
                url,
                "origin does not support Range requests, performance may be degraded"
            );
        }

        if config.max_file_size > 0 && size > config.max_file_size {
            return Err(fail(ArchiveError::TooLarge {
                size,
                limit: config.max_file_size,
            }));
        }

        let reader = Arc::new(HttpRangeReader::new(
            Arc::clone(&client),
            url,
            size,
            &token,
        ));

        let extension = Path::new(parsed.path())
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        let handler = match Registry::global().detect(reader.as_ref(), &extension).await {
            Ok(handler) => handler,
            Err(err) => return Err(fail(err)),
        };

        Ok(Self {
            url: url.to_string(),
            size,
            reader,
            handler,
            token,
            deadline,
            handle: Handle::current(),
            closed: AtomicBool::new(false),
        })
    }

    /// The archive URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The archive size in bytes, fixed at creation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The detected container format.
    pub fn format(&self) -> FormatKind {
        self.handler.kind()
    }

    /// Cumulative bytes fetched from the origin.
    pub fn transferred_bytes(&self) -> u64 {
        self.reader.transferred_bytes()
    }

    fn source(&self) -> ArchiveSource {
        ArchiveSource::new(
            Arc::clone(&self.reader) as Arc<dyn ReadAt>,
            self.size,
            self.handle.clone(),
        )
    }

    async fn run_blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return Err(ArchiveError::Canceled);
        }
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| ArchiveError::Internal(format!("worker task failed: {e}")))?
    }

    /// Summary metadata.
    ///
    /// May return a populated [`InfoOutcome`] whose `error` field carries a
    /// password failure when encryption was discovered during enumeration.
    pub async fn info(&self, password: Option<&str>) -> Result<InfoOutcome> {
        let handler = Arc::clone(&self.handler);
        let source = self.source();
        let password = password.map(str::to_owned);
        self.run_blocking(move || handler.info(&source, password.as_deref()))
            .await
    }

    /// List entries, optionally scoped: `""` for everything, `"/"` for the
    /// top level, a directory path for its direct children.
    pub async fn list(&self, inner_path: &str, password: Option<&str>) -> Result<Vec<FileEntry>> {
        let handler = Arc::clone(&self.handler);
        let source = self.source();
        let inner_path = inner_path.to_owned();
        let password = password.map(str::to_owned);
        self.run_blocking(move || handler.list(&source, &inner_path, password.as_deref()))
            .await
    }

    /// Stream one entry's decompressed bytes.
    ///
    /// The traversal guard runs before any handler work. The returned stream
    /// yields exactly the returned size and then end-of-input; the caller
    /// owns and drops the stream.
    pub async fn extract(
        &self,
        path: &str,
        password: Option<&str>,
    ) -> Result<(EntryStream, u64)> {
        if !is_safe(path) {
            return Err(ArchiveError::PathTraversal);
        }

        let handler = Arc::clone(&self.handler);
        let source = self.source();
        let path = path.to_owned();
        let password = password.map(str::to_owned);

        let extraction = self
            .run_blocking(move || handler.extract(&source, &path, password.as_deref()))
            .await?;

        let size = extraction.size;
        let pump = extraction.pump;
        let (tx, rx) = mpsc::channel::<io::Result<Vec<u8>>>(8);

        tokio::task::spawn_blocking(move || {
            let mut writer = ChannelWriter { tx: tx.clone() };
            if let Err(err) = pump(&mut writer) {
                // The receiver may already be gone; nothing to do then.
                let _ = tx.blocking_send(Err(err.into()));
            }
        });

        Ok((EntryStream::new(rx), size))
    }

    /// Close the session and cancel in-flight requests. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.token.cancel();
            self.reader.close();
            if let Some(task) = &self.deadline {
                task.abort();
            }
        }
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create a session, fetch [`Archive::info`] and dispose of the session.
pub async fn quick_info(
    url: &str,
    password: Option<&str>,
    config: &Config,
) -> Result<InfoOutcome> {
    let archive = Archive::new(url, config).await?;
    let result = archive.info(password).await;
    archive.close();
    result
}

/// Create a session, run [`Archive::list`] and dispose of the session.
pub async fn quick_list(
    url: &str,
    inner_path: &str,
    password: Option<&str>,
    config: &Config,
) -> Result<Vec<FileEntry>> {
    let archive = Archive::new(url, config).await?;
    let result = archive.list(inner_path, password).await;
    archive.close();
    result
}

/// Create a session and extract one entry.
///
/// The returned stream owns the session: the session stays alive while the
/// stream is read and is closed when the stream is dropped, stream first,
/// session second. The traversal guard runs before any network I/O.
pub async fn quick_extract(
    url: &str,
    path: &str,
    password: Option<&str>,
    config: &Config,
) -> Result<(EntryStream, u64)> {
    if !is_safe(path) {
        return Err(ArchiveError::PathTraversal);
    }

    let archive = Archive::new(url, config).await?;
    match archive.extract(path, password).await {
        Ok((mut stream, size)) => {
            stream.attach_session(archive);
            Ok((stream, size))
        }
        Err(err) => {
            archive.close();
            Err(err)
        }
    }
}

/// Bridges the blocking pump into the async stream.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "extraction stream dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decompressed bytes of one extracted entry.
///
/// Yields exactly the size returned alongside it, then end-of-input. When
/// created through [`quick_extract`] the stream owns its session and closes
/// it on drop.
pub struct EntryStream {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    current: Vec<u8>,
    pos: usize,
    session: Option<Archive>,
}

impl EntryStream {
    fn new(rx: mpsc::Receiver<io::Result<Vec<u8>>>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            pos: 0,
            session: None,
        }
    }

    pub(crate) fn attach_session(&mut self, session: Archive) {
        self.session = Some(session);
    }
}

impl AsyncRead for EntryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pos < this.current.len() {
                let n = buf.remaining().min(this.current.len() - this.pos);
                buf.put_slice(&this.current[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.current = chunk;
                    this.pos = 0;
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for EntryStream {
    fn drop(&mut self) {
        // Stream first, then the owned session.
        self.rx.close();
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}
