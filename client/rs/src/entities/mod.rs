use serde::{Deserialize, Serialize};

mod check;
mod component;
mod logger;
mod service;
mod spec;
mod wellknown;

pub use check::*;
pub use component::*;
pub use logger::*;
pub use service::*;
pub use spec::*;
pub use wellknown::*;

/// Body of simple mutation responses, eg `POST /reload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
  pub status: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub message: String,
}

impl StatusResponse {
  pub fn ok(message: impl Into<String>) -> StatusResponse {
    StatusResponse {
      status: String::from("ok"),
      message: message.into(),
    }
  }
}

/// The `{"code": "<group>.<tag>", "error": "<detail>"}` body
/// carried by every non-2xx control plane response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
  pub code: String,
  pub error: String,
}

impl std::fmt::Display for ErrorEnvelope {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}: {}", self.code, self.error)
  }
}

impl std::error::Error for ErrorEnvelope {}

pub mod error_code {
  pub const COMPONENT_NOT_FOUND: &str = "component.not_found";
  pub const COMPONENT_UPGRADE_FAILED: &str =
    "component.upgrade_failed";
  pub const SERVICE_NOT_FOUND: &str = "service.not_found";
  pub const SERVICE_START_FAILED: &str = "service.start_failed";
  pub const SERVICE_CONFLICT: &str = "service.conflict";
  pub const SERVICE_BUDGET_EXHAUSTED: &str =
    "service.budget_exhausted";
  pub const CONFIG_RELOAD_FAILED: &str = "config.reload_failed";
  pub const CONFIG_INVALID: &str = "config.invalid";
  pub const PORT_EXHAUSTED: &str = "port.exhausted";
  pub const TUNNEL_OPEN_FAILED: &str = "tunnel.open_failed";
  pub const TRANSIENT_IO: &str = "io.transient";
  pub const FATAL: &str = "internal.fatal";
}
