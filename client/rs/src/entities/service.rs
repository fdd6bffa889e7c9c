use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::component::ComponentRecord;

/// A long-running process the keeper launches and supervises,
/// always built from a declared component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDecl {
  pub name: String,
  /// The component providing the executable.
  /// Defaults to the service name.
  #[serde(default)]
  pub component: String,
  #[serde(default)]
  pub startup: StartupMode,
  /// Command template. `{port}` is substituted with the assigned
  /// port; if absent, `--port <n>` is appended instead.
  pub command: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub protocol: String,
  /// Suggested local port. 0 lets the allocator pick.
  #[serde(default)]
  pub port: u16,
  #[serde(default)]
  pub metrics_path: String,
  /// Health probe path, eg "/healthz". Empty skips HTTP probing
  /// and liveness falls back to pid presence.
  #[serde(default)]
  pub health_path: String,
  #[serde(default)]
  pub accessible: Accessibility,
}

impl ServiceDecl {
  /// The component name backing this service.
  pub fn component_name(&self) -> &str {
    if self.component.is_empty() {
      &self.name
    } else {
      &self.component
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StartupMode {
  /// Start on boot and auto-restart on exit.
  #[default]
  Always,
  /// Start on boot, do not restart after clean exit.
  Once,
  /// Only start on explicit request.
  None,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Accessibility {
  #[default]
  Local,
  /// Exposed through a reverse tunnel to the remote gateway.
  Remote,
}

/// Shared run state for services and tunnels.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunStatus {
  Running,
  Exited,
  Error,
  Stopped,
  #[default]
  Disabled,
}

impl RunStatus {
  /// Whether a tunnel should exist for a remote-accessible
  /// service in this state.
  pub fn wants_tunnel(self) -> bool {
    matches!(
      self,
      RunStatus::Running | RunStatus::Exited | RunStatus::Error
    )
  }
}

/// Snapshot of one supervised service, the runtime twin of its
/// declaration. This is the shape returned by `GET /services`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
  pub name: String,
  /// Assigned local port, 0 when unassigned.
  #[serde(default)]
  pub port: u16,
  /// Child pid, 0 when not running.
  #[serde(default)]
  pub pid: u32,
  #[serde(default)]
  pub status: RunStatus,
  #[serde(default)]
  pub healthy: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_time: Option<DateTime<Utc>>,
  #[serde(default)]
  pub restart_count: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_exit_time: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub last_exit_reason: String,
  /// Install record of the backing component, if installed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub component: Option<ComponentRecord>,
  /// Present only for remote-accessible services which have
  /// reached a state that requires a tunnel.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tunnel: Option<TunnelInstance>,
}

/// One reverse tunnel, owned by a remote-accessible service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInstance {
  /// Owning service name. A lookup key, never a back pointer.
  pub service: String,
  /// Port pairs carried by this tunnel. Today always one pair,
  /// kept as a list for protocol evolution.
  #[serde(default)]
  pub pairs: Vec<PortPair>,
  #[serde(default)]
  pub status: RunStatus,
  #[serde(default)]
  pub pid: u32,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub healthy: bool,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct PortPair {
  pub local_port: u16,
  /// Port granted by the remote gateway.
  pub mapping_port: u16,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn run_status_wire_format_is_lowercase() {
    assert_eq!(
      serde_json::to_string(&RunStatus::Running).unwrap(),
      "\"running\""
    );
    assert_eq!(RunStatus::Error.to_string(), "error");
  }

  #[test]
  fn tunnel_exists_only_for_active_states() {
    assert!(RunStatus::Running.wants_tunnel());
    assert!(RunStatus::Exited.wants_tunnel());
    assert!(RunStatus::Error.wants_tunnel());
    assert!(!RunStatus::Stopped.wants_tunnel());
    assert!(!RunStatus::Disabled.wants_tunnel());
  }

  #[test]
  fn instance_serializes_camel_case() {
    let instance = ServiceInstance {
      name: String::from("svc-a"),
      restart_count: 2,
      ..Default::default()
    };
    let json = serde_json::to_value(&instance).unwrap();
    assert_eq!(json["restartCount"], 2);
    assert_eq!(json["status"], "disabled");
  }

  #[test]
  fn component_defaults_to_service_name() {
    let decl: ServiceDecl = serde_json::from_value(
      serde_json::json!({ "name": "svc-a", "command": "svc-a" }),
    )
    .unwrap();
    assert_eq!(decl.component_name(), "svc-a");
  }
}
