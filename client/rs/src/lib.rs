//! Client for the costrict keeper control plane, plus every type
//! crossing it. The CLI and the IDE extension both talk to the
//! keeper through [KeeperClient].

use std::{path::Path, time::Duration};

use anyhow::Context;
use hyper::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub mod entities;
pub mod transport;

use entities::{
  CheckResponse, ComponentDetail, ErrorEnvelope, HealthzResponse,
  ServiceInstance, StatusResponse, TunnelInstance, WellKnown,
};
use transport::Transport;

/// Compiled-in default for the loopback control plane.
pub const DEFAULT_PORT: u16 = 16130;

/// Relative socket path under the keeper root.
pub const SOCKET_PATH: &str = "run/keeper.sock";

/// Relative well-known path under the keeper root.
pub const WELL_KNOWN_PATH: &str = "share/.well-known.json";

pub const API_BASE: &str = "/costrict/api/v1";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
  /// The keeper answered with a non-2xx envelope.
  #[error("{0}")]
  Api(ErrorEnvelope),
  #[error(transparent)]
  Transport(#[from] anyhow::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

pub struct KeeperClient {
  transport: Transport,
  timeout: Duration,
}

impl KeeperClient {
  /// Resolve the control plane transport for the keeper rooted at
  /// `root`: the unix socket if it accepts within 200ms, otherwise
  /// loopback TCP on the port from the well-known file, otherwise
  /// the compiled-in default port.
  pub async fn connect(root: &Path) -> KeeperClient {
    #[cfg(unix)]
    {
      let socket = root.join(SOCKET_PATH);
      if transport::probe_unix_socket(&socket).await {
        return KeeperClient {
          transport: Transport::Unix(socket),
          timeout: DEFAULT_TIMEOUT,
        };
      }
    }
    let port = well_known_port(root).await.unwrap_or(DEFAULT_PORT);
    KeeperClient {
      transport: Transport::Tcp { port },
      timeout: DEFAULT_TIMEOUT,
    }
  }

  /// Directly target a TCP port, skipping resolution.
  pub fn tcp(port: u16) -> KeeperClient {
    KeeperClient {
      transport: Transport::Tcp { port },
      timeout: DEFAULT_TIMEOUT,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> KeeperClient {
    self.timeout = timeout;
    self
  }

  pub async fn healthz(&self) -> ClientResult<HealthzResponse> {
    self.request(Method::GET, "/healthz", None).await
  }

  pub async fn reload(&self) -> ClientResult<StatusResponse> {
    self.api(Method::POST, "/reload", None).await
  }

  pub async fn check(&self) -> ClientResult<CheckResponse> {
    self.api(Method::POST, "/check", None).await
  }

  pub async fn list_services(
    &self,
  ) -> ClientResult<Vec<ServiceInstance>> {
    self.api(Method::GET, "/services", None).await
  }

  pub async fn get_service(
    &self,
    name: &str,
  ) -> ClientResult<ServiceInstance> {
    self
      .api(Method::GET, &format!("/services/{name}"), None)
      .await
  }

  /// `action` is one of start / stop / restart.
  pub async fn service_action(
    &self,
    name: &str,
    action: &str,
  ) -> ClientResult<StatusResponse> {
    self
      .api(
        Method::POST,
        &format!("/services/{name}/{action}"),
        None,
      )
      .await
  }

  /// `action` is one of open / close / reopen.
  pub async fn tunnel_action(
    &self,
    name: &str,
    action: &str,
  ) -> ClientResult<TunnelInstance> {
    self
      .api(
        Method::POST,
        &format!("/services/{name}/{action}"),
        None,
      )
      .await
  }

  pub async fn list_components(
    &self,
  ) -> ClientResult<Vec<ComponentDetail>> {
    self.api(Method::GET, "/components", None).await
  }

  pub async fn upgrade_component(
    &self,
    name: &str,
  ) -> ClientResult<StatusResponse> {
    self
      .api(
        Method::POST,
        &format!("/components/{name}/upgrade"),
        None,
      )
      .await
  }

  pub async fn remove_component(
    &self,
    name: &str,
  ) -> ClientResult<StatusResponse> {
    self
      .api(Method::DELETE, &format!("/components/{name}"), None)
      .await
  }

  pub async fn known(&self) -> ClientResult<WellKnown> {
    self.api(Method::GET, "/known", None).await
  }

  pub async fn clean(&self) -> ClientResult<StatusResponse> {
    self.api(Method::POST, "/clean", None).await
  }

  pub async fn upload_logs(&self) -> ClientResult<StatusResponse> {
    self.api(Method::POST, "/logs/upload", None).await
  }

  async fn api<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
  ) -> ClientResult<T> {
    self
      .request(method, &format!("{API_BASE}{path}"), body)
      .await
  }

  async fn request<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
  ) -> ClientResult<T> {
    let (status, bytes) = self
      .transport
      .request(method, path, body.as_ref(), self.timeout)
      .await?;
    if (200..300).contains(&status) {
      let parsed = serde_json::from_slice(&bytes)
        .with_context(|| {
          format!("Failed to parse 2xx response from {path}")
        })
        .map_err(ClientError::Transport)?;
      return Ok(parsed);
    }
    let envelope = serde_json::from_slice::<ErrorEnvelope>(&bytes)
      .unwrap_or_else(|_| ErrorEnvelope {
        code: format!("http.{status}"),
        error: String::from_utf8_lossy(&bytes).into_owned(),
      });
    Err(ClientError::Api(envelope))
  }
}

async fn well_known_port(root: &Path) -> Option<u16> {
  let raw = tokio::fs::read_to_string(
    root.join(WELL_KNOWN_PATH),
  )
  .await
  .ok()?;
  let well_known = serde_json::from_str::<WellKnown>(&raw)
    .inspect_err(|e| {
      tracing::debug!("Unreadable well-known file | {e:#}")
    })
    .ok()?;
  well_known.endpoint.map(|e| e.port)
}
