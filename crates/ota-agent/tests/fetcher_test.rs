//! HTTP fetcher tests against a local package server

use axum::{http::header, routing::get, Router};
use ota_agent::{HttpFetcher, PackageFetcher, SignMethod};
use ota_common::{Error, UpgradeParameters};
use sha2::{Digest, Sha256};
use std::time::Duration;

const FIRMWARE: &[u8] = b"firmware image v2.0.0";

/// Serve packages on an ephemeral port, returning the base URL
async fn start_package_server() -> String {
    let app = Router::new()
        .route("/ota/pkg.bin", get(|| async { FIRMWARE }))
        .route("/ota/empty.bin", get(|| async { "" }))
        .route(
            "/ota/download",
            get(|| async {
                (
                    [(header::CONTENT_DISPOSITION, "attachment; filename=\"mcu-v2.bin\"")],
                    FIRMWARE,
                )
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

fn package(url: String) -> UpgradeParameters {
    UpgradeParameters {
        url,
        sign: String::new(),
        sign_method: None,
        module: "mcu".to_string(),
        version: "v2.0.0".to_string(),
        file_name: None,
        file_size: None,
    }
}

fn firmware_digest() -> String {
    hex::encode(Sha256::digest(FIRMWARE))
}

#[tokio::test]
async fn test_download_and_verify() {
    let base = start_package_server().await;
    let dir = tempfile::tempdir().unwrap();
    let fetcher = HttpFetcher::new();

    let path = fetcher
        .download(
            &package(format!("{}/ota/pkg.bin", base)),
            dir.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(path, dir.path().join("pkg.bin"));
    assert_eq!(std::fs::read(&path).unwrap(), FIRMWARE);
    assert!(!dir.path().join("pkg.bin.part").exists());

    fetcher
        .verify_signature(&firmware_digest(), SignMethod::Sha256, &path)
        .await
        .unwrap();

    // Platform digests may come upper-case
    fetcher
        .verify_signature(&firmware_digest().to_uppercase(), SignMethod::Sha256, &path)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_file_name_from_content_disposition() {
    let base = start_package_server().await;
    let dir = tempfile::tempdir().unwrap();

    let path = HttpFetcher::new()
        .download(
            &package(format!("{}/ota/download", base)),
            dir.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(path, dir.path().join("mcu-v2.bin"));
}

#[tokio::test]
async fn test_tampered_package_fails_verification() {
    let base = start_package_server().await;
    let dir = tempfile::tempdir().unwrap();
    let fetcher = HttpFetcher::new();

    let path = fetcher
        .download(
            &package(format!("{}/ota/pkg.bin", base)),
            dir.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    std::fs::write(&path, b"tampered").unwrap();

    let result = fetcher
        .verify_signature(&firmware_digest(), SignMethod::Sha256, &path)
        .await;
    assert!(matches!(result, Err(Error::VerificationFailed(_))));
}

#[tokio::test]
async fn test_missing_package_is_download_failure() {
    let base = start_package_server().await;
    let dir = tempfile::tempdir().unwrap();

    let result = HttpFetcher::new()
        .download(
            &package(format!("{}/ota/missing.bin", base)),
            dir.path(),
            Duration::from_secs(5),
        )
        .await;

    assert!(matches!(result, Err(Error::DownloadFailed(_))));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_empty_body_is_download_failure() {
    let base = start_package_server().await;
    let dir = tempfile::tempdir().unwrap();

    let result = HttpFetcher::new()
        .download(
            &package(format!("{}/ota/empty.bin", base)),
            dir.path(),
            Duration::from_secs(5),
        )
        .await;

    assert!(matches!(result, Err(Error::DownloadFailed(_))));
    assert!(!dir.path().join("empty.bin").exists());
    assert!(!dir.path().join("empty.bin.part").exists());
}

#[tokio::test]
async fn test_unreachable_host_is_download_failure() {
    let dir = tempfile::tempdir().unwrap();

    let result = HttpFetcher::new()
        .download(
            &package("http://127.0.0.1:1/pkg.bin".to_string()),
            dir.path(),
            Duration::from_millis(500),
        )
        .await;

    assert!(matches!(result, Err(Error::DownloadFailed(_))));
}

#[tokio::test]
async fn test_offered_file_name_wins() {
    let base = start_package_server().await;
    let dir = tempfile::tempdir().unwrap();
    let mut offered = package(format!("{}/ota/download", base));
    offered.file_name = Some("../firmware/mcu-v2.0.0.img".to_string());

    let path = HttpFetcher::new()
        .download(&offered, dir.path(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(path, dir.path().join("mcu-v2.0.0.img"));
}

#[tokio::test]
async fn test_size_mismatch_is_download_failure() {
    let base = start_package_server().await;
    let dir = tempfile::tempdir().unwrap();
    let fetcher = HttpFetcher::new();

    let mut offered = package(format!("{}/ota/pkg.bin", base));
    offered.file_size = Some(FIRMWARE.len() as u64 + 1);
    let result = fetcher
        .download(&offered, dir.path(), Duration::from_secs(5))
        .await;
    assert!(matches!(result, Err(Error::DownloadFailed(_))));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    offered.file_size = Some(FIRMWARE.len() as u64);
    let path = fetcher
        .download(&offered, dir.path(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), FIRMWARE);
}
