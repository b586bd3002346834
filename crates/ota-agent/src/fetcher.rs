//! Package download and verification

use async_trait::async_trait;
use ota_common::{Error, Result, UpgradeParameters};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Digest scheme named by `UpgradeParameters::sign_method`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMethod {
    Sha256,
}

impl SignMethod {
    /// Parse a platform sign method
    ///
    /// Absent or empty means no verification. A method this agent cannot
    /// check is an error, so an unverifiable package is never promoted.
    pub fn parse(method: Option<&str>) -> Result<Option<Self>> {
        match method.map(str::trim) {
            None | Some("") => Ok(None),
            Some(m) if m.eq_ignore_ascii_case("SHA256") || m.eq_ignore_ascii_case("SHA-256") => {
                Ok(Some(SignMethod::Sha256))
            }
            Some(other) => Err(Error::VerificationFailed(format!(
                "unsupported sign method: {}",
                other
            ))),
        }
    }
}

#[async_trait]
pub trait PackageFetcher: Send + Sync + 'static {
    /// Download the offered package into `dest_dir`, returning the stored path
    async fn download(
        &self,
        package: &UpgradeParameters,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<PathBuf>;

    /// Check the file at `path` against the platform-supplied `sign`
    async fn verify_signature(&self, sign: &str, method: SignMethod, path: &Path) -> Result<()>;
}

/// HTTP(S) package fetcher
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageFetcher for HttpFetcher {
    async fn download(
        &self,
        package: &UpgradeParameters,
        dest_dir: &Path,
        timeout: Duration,
    ) -> Result<PathBuf> {
        let url = package.url.as_str();
        debug!("Downloading package from {}", url);

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::DownloadFailed(format!("request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::DownloadFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let file_name = package
            .file_name
            .as_deref()
            .and_then(sanitize_file_name)
            .or_else(|| file_name_from_disposition(&response))
            .or_else(|| file_name_from_url(url))
            .ok_or_else(|| Error::DownloadFailed(format!("no file name for {}", url)))?;

        let target = dest_dir.join(&file_name);
        let partial = dest_dir.join(format!("{}.part", file_name));

        let written = match write_body(response, &partial).await {
            Ok(0) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(Error::DownloadFailed(format!("{} returned an empty body", url)));
            }
            Ok(n) if package.file_size.is_some_and(|size| size != n) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(Error::DownloadFailed(format!(
                    "{} returned {} bytes, expected {}",
                    url,
                    n,
                    package.file_size.unwrap_or_default()
                )));
            }
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&partial, &target).await.map_err(|e| {
            Error::DownloadFailed(format!("failed to store {}: {}", target.display(), e))
        })?;

        info!("Downloaded {} bytes to {}", written, target.display());
        Ok(target)
    }

    async fn verify_signature(&self, sign: &str, method: SignMethod, path: &Path) -> Result<()> {
        match method {
            SignMethod::Sha256 => {
                let digest = sha256_file(path).await?;
                if digest.eq_ignore_ascii_case(sign.trim()) {
                    debug!("SHA256 verified for {}", path.display());
                    Ok(())
                } else {
                    Err(Error::VerificationFailed(format!(
                        "SHA256 mismatch for {}: expected {}, computed {}",
                        path.display(),
                        sign,
                        digest
                    )))
                }
            }
        }
    }
}

/// Stream a response body to `path`, returning the number of bytes written
async fn write_body(mut response: reqwest::Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::DownloadFailed(format!("transfer interrupted: {}", e)))?
    {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    Ok(written)
}

fn file_name_from_disposition(response: &reqwest::Response) -> Option<String> {
    let header = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;

    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"'))
        .and_then(sanitize_file_name)
}

fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    sanitize_file_name(last)
}

/// Reduce a platform-supplied name to a bare file name inside the download dir
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = Path::new(name).file_name()?.to_str()?;
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

/// Hex-encoded SHA-256 of a file, computed off the async runtime
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Other(anyhow::anyhow!("hashing task failed: {}", e)))?
}
