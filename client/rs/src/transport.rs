use std::{path::PathBuf, time::Duration};

use anyhow::{Context, anyhow};
use hyper::Method;
use serde_json::Value;

/// How long a unix socket gets to accept before the client falls
/// back to loopback TCP.
pub const UDS_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Resolved control plane transport. Unix socket when the server
/// side socket accepts, loopback TCP otherwise.
#[derive(Debug, Clone)]
pub enum Transport {
  #[cfg(unix)]
  Unix(PathBuf),
  Tcp {
    port: u16,
  },
}

impl Transport {
  /// Issue one request and return `(status, body)`. Connection per
  /// call; the CLI is single shot and the server is local.
  pub async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
    timeout: Duration,
  ) -> anyhow::Result<(u16, Vec<u8>)> {
    match self {
      #[cfg(unix)]
      Transport::Unix(socket) => {
        unix::request(socket, method, path, body, timeout).await
      }
      Transport::Tcp { port } => {
        tcp_request(*port, method, path, body, timeout).await
      }
    }
  }
}

async fn tcp_request(
  port: u16,
  method: Method,
  path: &str,
  body: Option<&Value>,
  timeout: Duration,
) -> anyhow::Result<(u16, Vec<u8>)> {
  let client = reqwest::Client::builder()
    .timeout(timeout)
    .build()
    .context("Failed to build http client")?;
  let url = format!("http://127.0.0.1:{port}{path}");
  let mut req = client.request(method, &url);
  if let Some(body) = body {
    req = req.json(body);
  }
  let res = req
    .send()
    .await
    .with_context(|| format!("Request to {url} failed"))?;
  let status = res.status().as_u16();
  let bytes = res
    .bytes()
    .await
    .context("Failed to read response body")?;
  Ok((status, bytes.to_vec()))
}

#[cfg(unix)]
mod unix {
  use std::path::Path;

  use http_body_util::{BodyExt, Full};
  use hyper::body::Bytes;
  use hyper_util::rt::TokioIo;
  use tokio::net::UnixStream;

  use super::*;

  /// Probe whether the socket file accepts connections within
  /// [UDS_CONNECT_TIMEOUT].
  pub async fn probe(socket: &Path) -> bool {
    if !socket.exists() {
      return false;
    }
    matches!(
      tokio::time::timeout(
        UDS_CONNECT_TIMEOUT,
        UnixStream::connect(socket)
      )
      .await,
      Ok(Ok(_))
    )
  }

  pub async fn request(
    socket: &Path,
    method: Method,
    path: &str,
    body: Option<&Value>,
    timeout: Duration,
  ) -> anyhow::Result<(u16, Vec<u8>)> {
    let res = tokio::time::timeout(
      timeout,
      request_inner(socket, method, path, body),
    )
    .await
    .map_err(|_| {
      anyhow!("Request to {} timed out", socket.display())
    })??;
    Ok(res)
  }

  async fn request_inner(
    socket: &Path,
    method: Method,
    path: &str,
    body: Option<&Value>,
  ) -> anyhow::Result<(u16, Vec<u8>)> {
    let stream =
      UnixStream::connect(socket).await.with_context(|| {
        format!("Failed to connect to {}", socket.display())
      })?;
    let (mut sender, conn) =
      hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("Http handshake over unix socket failed")?;
    tokio::spawn(async move {
      if let Err(e) = conn.await {
        tracing::debug!("Unix socket connection closed | {e:#}");
      }
    });
    let payload = match body {
      Some(body) => Bytes::from(serde_json::to_vec(body)?),
      None => Bytes::new(),
    };
    let req = hyper::Request::builder()
      .method(method)
      .uri(path)
      .header(hyper::header::HOST, "keeper")
      .header(hyper::header::CONTENT_TYPE, "application/json")
      .body(Full::new(payload))
      .context("Failed to build request")?;
    let res = sender
      .send_request(req)
      .await
      .context("Request over unix socket failed")?;
    let status = res.status().as_u16();
    let bytes = res
      .into_body()
      .collect()
      .await
      .context("Failed to read response body")?
      .to_bytes();
    Ok((status, bytes.to_vec()))
  }
}

#[cfg(unix)]
pub use unix::probe as probe_unix_socket;
