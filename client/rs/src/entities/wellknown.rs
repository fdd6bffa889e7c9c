use serde::{Deserialize, Serialize};

use super::service::{Accessibility, RunStatus, StartupMode};

/// The JSON summary written atomically to
/// `<root>/share/.well-known.json` for the IDE to read without an
/// HTTP round trip. Also served at `GET /known`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellKnown {
  pub logs: WellKnownLogs,
  #[serde(default)]
  pub services: Vec<WellKnownService>,
  /// Control plane TCP fallback for clients which cannot reach
  /// the unix socket.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub endpoint: Option<WellKnownEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellKnownEndpoint {
  pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellKnownLogs {
  pub dir: String,
  pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WellKnownService {
  pub name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub version: String,
  pub installed: bool,
  pub startup: StartupMode,
  pub status: RunStatus,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub protocol: String,
  pub port: u16,
  pub accessible: Accessibility,
}
