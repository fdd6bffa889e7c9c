use std::sync::Arc;

use axum::{Json, extract::State};
use keeper_client::entities::{
  CheckResponse, HealthzResponse, StatusResponse, WellKnown,
};

use crate::{coordinator::Coordinator, error::KeeperResult};

pub async fn healthz(
  State(coordinator): State<Arc<Coordinator>>,
) -> Json<HealthzResponse> {
  Json(coordinator.healthz().await)
}

pub async fn reload(
  State(coordinator): State<Arc<Coordinator>>,
) -> KeeperResult<Json<StatusResponse>> {
  let (added, removed, changed) = coordinator.reload().await?;
  Ok(Json(StatusResponse::ok(format!(
    "spec reloaded: {added} added, {removed} removed, \
     {changed} changed"
  ))))
}

pub async fn check(
  State(coordinator): State<Arc<Coordinator>>,
) -> Json<CheckResponse> {
  Json(coordinator.check().await)
}

pub async fn known(
  State(coordinator): State<Arc<Coordinator>>,
) -> Json<WellKnown> {
  Json(coordinator.well_known().await)
}

pub async fn clean(
  State(coordinator): State<Arc<Coordinator>>,
) -> KeeperResult<Json<StatusResponse>> {
  let message = coordinator.clean().await?;
  Ok(Json(StatusResponse::ok(message)))
}

pub async fn upload_logs(
  State(coordinator): State<Arc<Coordinator>>,
) -> KeeperResult<Json<StatusResponse>> {
  let message = coordinator.bundle_logs().await?;
  Ok(Json(StatusResponse::ok(message)))
}
