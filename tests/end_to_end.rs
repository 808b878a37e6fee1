//! End-to-end tests against an in-process origin with real Range handling.

mod support;

use std::sync::Arc;

use tokio::io::AsyncReadExt;

use runarc::error::ArchiveError;
use runarc::io::{HttpRangeReader, RangeClient, ReadAt};
use runarc::{quick_extract, quick_info, quick_list, Archive, Config, FormatKind};
use tokio_util::sync::CancellationToken;

async fn read_all(mut stream: runarc::EntryStream) -> Vec<u8> {
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.expect("read stream");
    data
}

#[tokio::test(flavor = "multi_thread")]
async fn zip_info_list_extract() {
    let origin = support::serve("a.zip", support::zip_fixture(), true).await;
    let config = Config::default();

    let archive = Archive::new(&origin.url, &config).await.unwrap();
    assert_eq!(archive.format(), FormatKind::Zip);

    let outcome = archive.info(None).await.unwrap();
    assert!(outcome.error.is_none());
    let info = &outcome.info;
    assert!(!info.is_encrypted);
    assert!(!info.requires_password);
    assert_eq!(info.total_files, 2);
    assert_eq!(
        info.total_size,
        (support::README_CONTENT.len() + support::PDF_CONTENT_LEN) as u64
    );
    assert_eq!(info.comment.as_deref(), Some("fixture archive"));

    // total_size equals the sum over non-directory entries.
    let sum: u64 = info
        .entries
        .iter()
        .filter(|e| !e.is_dir)
        .map(|e| e.size)
        .sum();
    assert_eq!(info.total_size, sum);

    // list("") returns every entry, same multiset as info.entries.
    let all = archive.list("", None).await.unwrap();
    assert_eq!(all.len(), info.entries.len());
    for entry in &all {
        assert!(info.entries.iter().any(|e| e == entry));
    }

    // Two sequential info calls agree.
    let again = archive.info(None).await.unwrap();
    assert_eq!(again.info.total_files, info.total_files);
    assert_eq!(again.info.total_size, info.total_size);
    assert_eq!(again.info.entries.len(), info.entries.len());

    // "/" lists only the top level.
    let top = archive.list("/", None).await.unwrap();
    let mut names: Vec<&str> = top.iter().map(|e| e.path.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["docs/", "readme.txt"]);

    // Direct children of docs.
    let docs = archive.list("docs", None).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].path, "docs/g.pdf");
    assert!(!docs[0].is_dir);

    let (stream, size) = archive.extract("readme.txt", None).await.unwrap();
    assert_eq!(size, support::README_CONTENT.len() as u64);
    assert_eq!(read_all(stream).await, support::README_CONTENT);

    // Only part of the archive was fetched for metadata plus one entry.
    assert!(origin.range_requests() > 0);

    archive.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn zip_quick_helpers() {
    let origin = support::serve("a.zip", support::zip_fixture(), true).await;
    let config = Config::default();

    let outcome = quick_info(&origin.url, None, &config).await.unwrap();
    assert_eq!(outcome.info.total_files, 2);

    let files = quick_list(&origin.url, "/", None, &config).await.unwrap();
    assert_eq!(files.len(), 2);

    let (stream, size) = quick_extract(&origin.url, "readme.txt", None, &config)
        .await
        .unwrap();
    let data = read_all(stream).await;
    assert_eq!(data.len() as u64, size);
    assert_eq!(data, support::README_CONTENT);
}

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_zip_dual_signal() {
    let origin = support::serve("locked.zip", support::encrypted_zip_fixture("secret"), true).await;
    let config = Config::default();

    // No password: populated info alongside the password error.
    let outcome = quick_info(&origin.url, None, &config).await.unwrap();
    assert!(matches!(outcome.error, Some(ArchiveError::PasswordRequired)));
    assert!(outcome.info.is_encrypted);
    assert!(outcome.info.requires_password);
    assert_eq!(outcome.info.total_files, 1);

    // Wrong password.
    let outcome = quick_info(&origin.url, Some("nope"), &config).await.unwrap();
    assert!(matches!(
        outcome.error,
        Some(ArchiveError::PasswordIncorrect)
    ));

    // Correct password.
    let outcome = quick_info(&origin.url, Some("secret"), &config).await.unwrap();
    assert!(outcome.error.is_none());
    assert!(outcome.info.is_encrypted);
    assert!(!outcome.info.requires_password);

    // Listing and extraction follow the same rules.
    assert!(matches!(
        quick_list(&origin.url, "", None, &config).await,
        Err(ArchiveError::PasswordRequired)
    ));

    let (stream, size) = quick_extract(&origin.url, "secret.txt", Some("secret"), &config)
        .await
        .unwrap();
    let data = read_all(stream).await;
    assert_eq!(data.len() as u64, size);
    assert_eq!(data, b"top secret\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn tar_gz_forward_only_pipeline() {
    let origin = support::serve("a.tar.gz", support::tar_gz_fixture(), true).await;
    let config = Config::default();

    let archive = Archive::new(&origin.url, &config).await.unwrap();
    assert_eq!(archive.format(), FormatKind::Tar);

    let outcome = archive.info(None).await.unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.info.total_files, 2);
    assert!(outcome.info.entries.iter().all(|e| e.compressed_size == 0));

    // Extraction of the last entry works even though tar is forward-only.
    let (stream, size) = archive.extract("dir/last.bin", None).await.unwrap();
    assert_eq!(size, support::TAR_LAST_CONTENT.len() as u64);
    assert_eq!(read_all(stream).await, support::TAR_LAST_CONTENT);

    // Any password is rejected.
    match archive.info(Some("secret")).await {
        Err(ArchiveError::Format(message)) => {
            assert!(message.contains("does not support encryption"))
        }
        other => panic!("expected a format error, got {other:?}"),
    }

    assert!(matches!(
        archive.extract("missing.txt", None).await,
        Err(ArchiveError::FileNotFound)
    ));

    archive.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn sevenz_round_trip() {
    let origin = support::serve("a.7z", support::sevenz_fixture(), true).await;
    let config = Config::default();

    let archive = Archive::new(&origin.url, &config).await.unwrap();
    assert_eq!(archive.format(), FormatKind::SevenZ);

    let outcome = archive.info(None).await.unwrap();
    assert!(outcome.error.is_none());
    assert!(!outcome.info.is_encrypted);
    assert!(outcome.info.entries.iter().all(|e| e.compressed_size == 0));

    let top = archive
        .list("", None)
        .await
        .unwrap()
        .into_iter()
        .find(|e| !e.is_dir && e.path.ends_with("top.txt"))
        .expect("top.txt present");
    assert_eq!(top.size, support::SEVENZ_CONTENT.len() as u64);

    let (stream, size) = archive.extract(&top.path, None).await.unwrap();
    assert_eq!(size, top.size);
    assert_eq!(read_all(stream).await, support::SEVENZ_CONTENT);

    archive.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn degraded_origin_without_range_support() {
    // The origin ignores Range headers and always answers 200 with the whole
    // resource; the transport discards the leading bytes transparently.
    let origin = support::serve("a.zip", support::zip_fixture(), false).await;
    let config = Config::default();

    let outcome = quick_info(&origin.url, None, &config).await.unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.info.total_files, 2);

    let (stream, size) = quick_extract(&origin.url, "readme.txt", None, &config)
        .await
        .unwrap();
    let data = read_all(stream).await;
    assert_eq!(data.len() as u64, size);
    assert_eq!(data, support::README_CONTENT);
}

#[tokio::test(flavor = "multi_thread")]
async fn size_cap_refuses_large_archives() {
    let origin = support::serve("a.zip", support::zip_fixture(), true).await;
    let config = Config::default().with_max_file_size(16);

    match Archive::new(&origin.url, &config).await {
        Err(ArchiveError::TooLarge { size, limit }) => {
            assert!(size > limit);
            assert_eq!(limit, 16);
        }
        other => panic!("expected TooLarge, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn traversal_rejected_before_any_network_io() {
    let origin = support::serve("a.zip", support::zip_fixture(), true).await;
    let config = Config::default();

    let result = quick_extract(&origin.url, "../../etc/passwd", None, &config).await;
    assert!(matches!(result, Err(ArchiveError::PathTraversal)));
    assert_eq!(origin.requests(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_format_is_detected() {
    let origin = support::serve("junk.bin", vec![0u8; 1024], true).await;
    let config = Config::default();

    assert!(matches!(
        Archive::new(&origin.url, &config).await,
        Err(ArchiveError::UnsupportedFormat)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn read_at_boundary_behavior() {
    let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let origin = support::serve("blob.bin", data.clone(), true).await;
    let config = Config::default();

    let client = Arc::new(RangeClient::new(&config).unwrap());
    let (size, supports_range) = client.head(&origin.url).await.unwrap();
    assert_eq!(size, data.len() as u64);
    assert!(supports_range);

    let token = CancellationToken::new();
    let reader = HttpRangeReader::new(client, &origin.url, size, &token);

    // Reading the whole resource through ReadAt round-trips the bytes.
    let mut whole = vec![0u8; data.len()];
    assert_eq!(reader.read_at(0, &mut whole).await.unwrap(), data.len());
    assert_eq!(whole, data);

    // At the end: end-of-input, not an error.
    let mut buf = [0u8; 64];
    assert_eq!(reader.read_at(size, &mut buf).await.unwrap(), 0);
    assert_eq!(reader.read_at(size + 10, &mut buf).await.unwrap(), 0);

    // Overlapping the end: exactly the bytes that exist.
    let n = reader.read_at(size - 5, &mut buf).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], &data[data.len() - 5..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn degraded_origin_delivers_correct_window() {
    // 200 OK with start > 0: the bytes exposed to the caller begin at start.
    let data: Vec<u8> = (0..200u8).collect();
    let origin = support::serve("blob.bin", data.clone(), false).await;
    let config = Config::default();

    let client = Arc::new(RangeClient::new(&config).unwrap());
    let (size, supports_range) = client.head(&origin.url).await.unwrap();
    assert!(!supports_range);

    let token = CancellationToken::new();
    let reader = HttpRangeReader::new(client, &origin.url, size, &token);

    let mut buf = [0u8; 10];
    assert_eq!(reader.read_at(50, &mut buf).await.unwrap(), 10);
    assert_eq!(&buf, &data[50..60]);
}
