use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use keeper_client::entities::{ErrorEnvelope, error_code};

/// Typed boundary error for the control plane. Every variant maps
/// 1:1 onto an envelope code and an HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
  #[error("component '{0}' is not declared or not installed")]
  ComponentNotFound(String),
  #[error("component '{name}' upgrade failed: {reason:#}")]
  ComponentUpgradeFailed {
    name: String,
    #[source]
    reason: anyhow::Error,
  },
  #[error("service '{0}' is not declared")]
  ServiceNotFound(String),
  #[error("service '{name}' failed to start: {reason:#}")]
  ServiceStartFailed {
    name: String,
    #[source]
    reason: anyhow::Error,
  },
  /// The state machine rejected the command, eg start on a
  /// running service. Not retryable.
  #[error("{0}")]
  Conflict(String),
  #[error("'{0}' spent its restart budget")]
  BudgetExhausted(String),
  #[error("spec reload failed: {0:#}")]
  ConfigReload(#[source] anyhow::Error),
  #[error("invalid configuration: {0:#}")]
  ConfigInvalid(#[source] anyhow::Error),
  #[error("no free port for '{0}'")]
  PortExhausted(String),
  #[error("tunnel open for '{name}' failed: {reason:#}")]
  TunnelOpenFailed {
    name: String,
    #[source]
    reason: anyhow::Error,
  },
  /// Transient upstream IO, the caller may retry with backoff.
  #[error("{0:#}")]
  Transient(#[source] anyhow::Error),
  #[error("{0:#}")]
  Fatal(#[source] anyhow::Error),
}

impl KeeperError {
  pub fn code(&self) -> &'static str {
    use KeeperError::*;
    match self {
      ComponentNotFound(_) => error_code::COMPONENT_NOT_FOUND,
      ComponentUpgradeFailed { .. } => {
        error_code::COMPONENT_UPGRADE_FAILED
      }
      ServiceNotFound(_) => error_code::SERVICE_NOT_FOUND,
      ServiceStartFailed { .. } => error_code::SERVICE_START_FAILED,
      Conflict(_) => error_code::SERVICE_CONFLICT,
      BudgetExhausted(_) => error_code::SERVICE_BUDGET_EXHAUSTED,
      ConfigReload(_) => error_code::CONFIG_RELOAD_FAILED,
      ConfigInvalid(_) => error_code::CONFIG_INVALID,
      PortExhausted(_) => error_code::PORT_EXHAUSTED,
      TunnelOpenFailed { .. } => error_code::TUNNEL_OPEN_FAILED,
      Transient(_) => error_code::TRANSIENT_IO,
      Fatal(_) => error_code::FATAL,
    }
  }

  fn status(&self) -> StatusCode {
    use KeeperError::*;
    match self {
      ComponentNotFound(_) | ServiceNotFound(_) => {
        StatusCode::NOT_FOUND
      }
      Conflict(_) => StatusCode::CONFLICT,
      BudgetExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
      ConfigInvalid(_) => StatusCode::BAD_REQUEST,
      Transient(_) => StatusCode::BAD_GATEWAY,
      PortExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
      ComponentUpgradeFailed { .. }
      | ServiceStartFailed { .. }
      | ConfigReload(_)
      | TunnelOpenFailed { .. }
      | Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  pub fn envelope(&self) -> ErrorEnvelope {
    ErrorEnvelope {
      code: self.code().to_string(),
      error: format!("{self:#}"),
    }
  }
}

impl IntoResponse for KeeperError {
  fn into_response(self) -> Response {
    (self.status(), Json(self.envelope())).into_response()
  }
}

pub type KeeperResult<T> = Result<T, KeeperError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn codes_match_envelope_prefixes() {
    let err = KeeperError::ServiceNotFound(String::from("x"));
    assert_eq!(err.code(), "service.not_found");
    let envelope = err.envelope();
    assert!(envelope.error.contains("'x'"));

    let err = KeeperError::PortExhausted(String::from("svc"));
    assert_eq!(err.code(), "port.exhausted");

    let err = KeeperError::Conflict(String::from("busy"));
    assert_eq!(err.code(), "service.conflict");
  }
}
