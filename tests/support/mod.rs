//! Shared test support: an in-process origin that serves a byte blob with
//! real `Range` handling (or in a degraded mode that ignores the header and
//! answers `200 OK`), plus archive fixture builders.

#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::Router;

struct OriginState {
    data: Vec<u8>,
    honor_ranges: bool,
    requests: AtomicUsize,
    range_requests: AtomicUsize,
}

/// Handle to a running test origin.
pub struct Origin {
    pub url: String,
    state: Arc<OriginState>,
}

impl Origin {
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn range_requests(&self) -> usize {
        self.state.range_requests.load(Ordering::SeqCst)
    }
}

/// Serve `data` at `http://127.0.0.1:<port>/<name>`.
pub async fn serve(name: &str, data: Vec<u8>, honor_ranges: bool) -> Origin {
    let state = Arc::new(OriginState {
        data,
        honor_ranges,
        requests: AtomicUsize::new(0),
        range_requests: AtomicUsize::new(0),
    });

    let app = Router::new()
        .fallback(origin_handler)
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test origin");
    let addr = listener.local_addr().expect("origin addr");

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Origin {
        url: format!("http://{addr}/{name}"),
        state,
    }
}

fn parse_range(spec: &str, len: usize) -> Option<(usize, usize)> {
    let spec = spec.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    if start >= len {
        return None;
    }
    let end = if end.is_empty() {
        len - 1
    } else {
        end.parse::<usize>().ok()?.min(len - 1)
    };
    (start <= end).then_some((start, end))
}

async fn origin_handler(
    State(state): State<Arc<OriginState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let len = state.data.len();

    if method == Method::HEAD {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, len)
            .header(
                header::ACCEPT_RANGES,
                if state.honor_ranges { "bytes" } else { "none" },
            )
            .body(Body::empty())
            .unwrap();
    }

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if range.is_some() {
        state.range_requests.fetch_add(1, Ordering::SeqCst);
    }

    if state.honor_ranges {
        if let Some((start, end)) = range.as_deref().and_then(|r| parse_range(r, len)) {
            let window = state.data[start..=end].to_vec();
            return Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, window.len())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{len}"),
                )
                .body(Body::from(window))
                .unwrap();
        }
    }

    // Degraded origin (or no Range header): the whole resource, 200 OK.
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, len)
        .body(Body::from(state.data.clone()))
        .unwrap()
}

pub const README_CONTENT: &[u8] = b"hello world\n";
pub const PDF_CONTENT_LEN: usize = 4096;

/// A plain ZIP with `readme.txt`, a `docs/` directory and `docs/g.pdf`,
/// carrying an archive comment.
pub fn zip_fixture() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();

    writer.set_comment("fixture archive");
    writer.add_directory("docs", options).unwrap();
    writer.start_file("readme.txt", options).unwrap();
    writer.write_all(README_CONTENT).unwrap();
    writer.start_file("docs/g.pdf", options).unwrap();
    writer.write_all(&vec![0x25u8; PDF_CONTENT_LEN]).unwrap();

    writer.finish().unwrap().into_inner()
}

/// A ZIP whose single entry is AES-256 encrypted with `password`.
pub fn encrypted_zip_fixture(password: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .with_aes_encryption(zip::AesMode::Aes256, password);

    writer.start_file("secret.txt", options).unwrap();
    writer.write_all(b"top secret\n").unwrap();

    writer.finish().unwrap().into_inner()
}

pub const TAR_LAST_CONTENT: &[u8] = b"the very last entry\n";

/// A gzip-wrapped tar with a top-level file, a directory and a nested file
/// as the final entry.
pub fn tar_gz_fixture() -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_tar_file(&mut builder, "a.txt", b"first entry\n");
    append_tar_dir(&mut builder, "dir/");
    append_tar_file(&mut builder, "dir/last.bin", TAR_LAST_CONTENT);

    builder.into_inner().unwrap().finish().unwrap()
}

fn append_tar_file<W: Write>(builder: &mut tar::Builder<W>, name: &str, content: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1_700_000_000);
    builder.append_data(&mut header, name, content).unwrap();
}

fn append_tar_dir<W: Write>(builder: &mut tar::Builder<W>, name: &str) {
    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(1_700_000_000);
    header.set_entry_type(tar::EntryType::dir());
    builder
        .append_data(&mut header, name, std::io::empty())
        .unwrap();
}

pub const SEVENZ_CONTENT: &[u8] = b"seven zip says hi\n";

/// A 7z archive with a top-level file and a nested one.
pub fn sevenz_fixture() -> Vec<u8> {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("top.txt"), SEVENZ_CONTENT).unwrap();
    std::fs::create_dir(source.path().join("notes")).unwrap();
    std::fs::write(source.path().join("notes/hello.txt"), b"nested\n").unwrap();

    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("fixture.7z");
    sevenz_rust::compress_to_path(source.path(), &dest).unwrap();
    std::fs::read(&dest).unwrap()
}
