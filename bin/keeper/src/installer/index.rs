use std::{path::Path, time::Duration};

use anyhow::{Context, anyhow};
use futures_util::StreamExt;
use keeper_client::entities::PackageIndex;
use tokio::io::AsyncWriteExt;

use crate::config::{arch_tag, os_tag};

use super::InstallError;

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_millis(500);

/// Remote side of the installer: the per-component package index
/// and artifact downloads.
pub struct PackageClient {
  base: String,
  token: Option<String>,
  http: reqwest::Client,
}

impl PackageClient {
  pub fn new(
    base: impl Into<String>,
    token: Option<String>,
    download_timeout: Duration,
  ) -> anyhow::Result<PackageClient> {
    let http = reqwest::Client::builder()
      .timeout(download_timeout)
      .build()
      .context("Failed to build package http client")?;
    Ok(PackageClient {
      base: base.into(),
      token,
      http,
    })
  }

  pub fn index_url(&self, name: &str) -> String {
    format!(
      "{}/{name}/packages-{}-{}.json",
      self.base.trim_end_matches('/'),
      os_tag(),
      arch_tag()
    )
  }

  /// Fetch the package index. 404 maps to [NoSuchComponent];
  /// anything else is transient and retried with backoff.
  pub async fn fetch_index(
    &self,
    name: &str,
  ) -> Result<PackageIndex, InstallError> {
    let url = self.index_url(name);
    let mut last_err = None;
    for attempt in 0..FETCH_ATTEMPTS {
      if attempt > 0 {
        tokio::time::sleep(FETCH_BACKOFF * (1 << attempt)).await;
      }
      match self.fetch_index_once(name, &url).await {
        Ok(index) => return Ok(index),
        Err(InstallError::NoSuchComponent(name)) => {
          return Err(InstallError::NoSuchComponent(name));
        }
        Err(e) => {
          debug!(
            "Package index fetch for {name} failed \
             (attempt {attempt}) | {e:#}"
          );
          last_err = Some(e);
        }
      }
    }
    Err(last_err.unwrap_or_else(|| {
      InstallError::Transient(anyhow!(
        "package index fetch for {name} failed"
      ))
    }))
  }

  async fn fetch_index_once(
    &self,
    name: &str,
    url: &str,
  ) -> Result<PackageIndex, InstallError> {
    let res = self
      .get(url)
      .send()
      .await
      .with_context(|| format!("GET {url} failed"))
      .map_err(InstallError::Transient)?;
    if res.status() == reqwest::StatusCode::NOT_FOUND {
      return Err(InstallError::NoSuchComponent(name.to_string()));
    }
    let res = res
      .error_for_status()
      .with_context(|| format!("GET {url} failed"))
      .map_err(InstallError::Transient)?;
    res
      .json::<PackageIndex>()
      .await
      .with_context(|| format!("Invalid package index at {url}"))
      .map_err(InstallError::Transient)
  }

  /// Stream an artifact to `dest`, failing on size mismatch.
  /// `dest` should sit beside the final target so the later
  /// rename stays on one filesystem.
  pub async fn download(
    &self,
    name: &str,
    url: &str,
    dest: &Path,
    expected_size: u64,
  ) -> Result<(), InstallError> {
    let res = self
      .get(url)
      .send()
      .await
      .and_then(|res| res.error_for_status())
      .with_context(|| format!("GET {url} failed"))
      .map_err(InstallError::Transient)?;

    let mut file = tokio::fs::File::create(dest)
      .await
      .with_context(|| {
        format!("Failed to create {}", dest.display())
      })
      .map_err(InstallError::Transient)?;

    let mut written: u64 = 0;
    let mut stream = res.bytes_stream();
    while let Some(chunk) = stream.next().await {
      let chunk = chunk
        .with_context(|| format!("Download from {url} broke"))
        .map_err(InstallError::Transient)?;
      written += chunk.len() as u64;
      file
        .write_all(&chunk)
        .await
        .with_context(|| {
          format!("Failed writing {}", dest.display())
        })
        .map_err(InstallError::Transient)?;
    }
    file
      .flush()
      .await
      .context("Failed to flush download")
      .map_err(InstallError::Transient)?;

    if written != expected_size {
      let _ = tokio::fs::remove_file(dest).await;
      return Err(InstallError::CorruptArtifact {
        name: name.to_string(),
        expected: expected_size,
        actual: written,
      });
    }
    Ok(())
  }

  fn get(&self, url: &str) -> reqwest::RequestBuilder {
    let mut req = self.http.get(url);
    if let Some(token) = &self.token {
      req = req.bearer_auth(token);
    }
    req
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::{Router, routing::get};

  async fn serve_registry() -> String {
    let index = r#"{
      "newest": "1.0.3",
      "versions": [
        { "version": "1.0.3",
          "url": "/svc-a/svc-a-1.0.3",
          "size": 5 }
      ]
    }"#
    .to_string();
    let app = Router::new()
      .route(
        &format!(
          "/svc-a/packages-{}-{}.json",
          os_tag(),
          arch_tag()
        ),
        get(move || {
          let index = index.clone();
          async move { index }
        }),
      )
      .route(
        "/svc-a/svc-a-1.0.3",
        get(|| async { "hello" }),
      );
    let listener =
      tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
  }

  #[tokio::test]
  async fn fetch_and_download_round_trip() {
    let base = serve_registry().await;
    let client = PackageClient::new(
      base.clone(),
      None,
      Duration::from_secs(5),
    )
    .unwrap();
    let index = client.fetch_index("svc-a").await.unwrap();
    assert_eq!(index.newest, "1.0.3");

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("svc-a");
    client
      .download(
        "svc-a",
        &format!("{base}/svc-a/svc-a-1.0.3"),
        &dest,
        5,
      )
      .await
      .unwrap();
    assert_eq!(
      tokio::fs::read_to_string(&dest).await.unwrap(),
      "hello"
    );
  }

  #[tokio::test]
  async fn missing_component_maps_to_no_such_component() {
    let base = serve_registry().await;
    let client =
      PackageClient::new(base, None, Duration::from_secs(5))
        .unwrap();
    let err =
      client.fetch_index("svc-b").await.unwrap_err();
    assert!(matches!(
      err,
      InstallError::NoSuchComponent(name) if name == "svc-b"
    ));
  }

  #[tokio::test]
  async fn size_mismatch_is_corrupt_and_removed() {
    let base = serve_registry().await;
    let client =
      PackageClient::new(base.clone(), None, Duration::from_secs(5))
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("svc-a");
    let err = client
      .download(
        "svc-a",
        &format!("{base}/svc-a/svc-a-1.0.3"),
        &dest,
        999,
      )
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      InstallError::CorruptArtifact {
        expected: 999,
        actual: 5,
        ..
      }
    ));
    assert!(!dest.exists());
  }
}
