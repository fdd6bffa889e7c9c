use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State},
};
use keeper_client::entities::{
  ComponentDetail, StatusResponse,
};

use crate::{coordinator::Coordinator, error::KeeperResult};

pub async fn list(
  State(coordinator): State<Arc<Coordinator>>,
) -> Json<Vec<ComponentDetail>> {
  Json(coordinator.component_details().await)
}

pub async fn upgrade(
  State(coordinator): State<Arc<Coordinator>>,
  Path(name): Path<String>,
) -> KeeperResult<Json<StatusResponse>> {
  let message = coordinator.upgrade_component(&name).await?;
  Ok(Json(StatusResponse::ok(message)))
}

pub async fn remove(
  State(coordinator): State<Arc<Coordinator>>,
  Path(name): Path<String>,
) -> KeeperResult<Json<StatusResponse>> {
  coordinator.remove_component(&name).await?;
  Ok(Json(StatusResponse::ok(format!("{name} removed"))))
}
