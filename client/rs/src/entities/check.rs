use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{
  component::ComponentDetail, service::ServiceInstance,
};

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
pub enum CheckStatus {
  #[default]
  Healthy,
  Warning,
  Error,
}

/// Full health aggregation, the body of `POST /check`.
/// Tunnel state is nested per service; there are no top level
/// process / tunnel arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
  pub timestamp: DateTime<Utc>,
  pub status: CheckStatus,
  #[serde(default)]
  pub services: Vec<ServiceInstance>,
  #[serde(default)]
  pub components: Vec<ComponentDetail>,
  pub total_checks: u32,
  pub passed_checks: u32,
  pub failed_checks: u32,
}

impl CheckResponse {
  /// `passedChecks + failedChecks = totalChecks` must hold in
  /// every response.
  pub fn counters_consistent(&self) -> bool {
    self.passed_checks + self.failed_checks == self.total_checks
  }
}

/// Cheap process liveness, the body of `GET /healthz`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthzResponse {
  pub version: String,
  pub start_time: DateTime<Utc>,
  pub status: String,
  /// Seconds since the keeper process started.
  pub uptime: u64,
  #[serde(default)]
  pub metrics: IndexMap<String, i64>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn check_counters() {
    let check = CheckResponse {
      timestamp: Utc::now(),
      status: CheckStatus::Warning,
      services: vec![],
      components: vec![],
      total_checks: 5,
      passed_checks: 3,
      failed_checks: 2,
    };
    assert!(check.counters_consistent());
    let json = serde_json::to_value(&check).unwrap();
    assert_eq!(json["totalChecks"], 5);
    assert_eq!(json["status"], "warning");
  }
}
