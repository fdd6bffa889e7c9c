use std::sync::Arc;

use axum::{
  Json,
  extract::{Path, State},
  response::{IntoResponse, Response},
};
use keeper_client::entities::{
  ServiceInstance, StatusResponse,
};

use crate::{
  coordinator::Coordinator,
  error::{KeeperError, KeeperResult},
  supervisor::TunnelOp,
};

pub async fn list(
  State(coordinator): State<Arc<Coordinator>>,
) -> Json<Vec<ServiceInstance>> {
  Json(coordinator.list_instances().await)
}

pub async fn get_one(
  State(coordinator): State<Arc<Coordinator>>,
  Path(name): Path<String>,
) -> KeeperResult<Json<ServiceInstance>> {
  Ok(Json(coordinator.get_instance(&name).await?))
}

/// `start` / `stop` / `restart` answer with a status body;
/// `open` / `close` / `reopen` answer with the tunnel snapshot.
pub async fn action(
  State(coordinator): State<Arc<Coordinator>>,
  Path((name, action)): Path<(String, String)>,
) -> KeeperResult<Response> {
  let supervisor = coordinator.get_supervisor(&name).await?;
  match action.as_str() {
    "start" => {
      let instance = supervisor.start().await?;
      Ok(status_body(&name, &instance))
    }
    "stop" => {
      let instance = supervisor.stop().await?;
      Ok(status_body(&name, &instance))
    }
    "restart" => {
      let instance = supervisor.restart().await?;
      Ok(status_body(&name, &instance))
    }
    "open" => {
      let tunnel = supervisor.tunnel(TunnelOp::Open).await?;
      Ok(Json(tunnel).into_response())
    }
    "close" => {
      let tunnel = supervisor.tunnel(TunnelOp::Close).await?;
      Ok(Json(tunnel).into_response())
    }
    "reopen" => {
      let tunnel =
        supervisor.tunnel(TunnelOp::Reopen).await?;
      Ok(Json(tunnel).into_response())
    }
    other => Err(KeeperError::ServiceNotFound(format!(
      "{name}/{other}"
    ))),
  }
}

fn status_body(
  name: &str,
  instance: &ServiceInstance,
) -> Response {
  Json(StatusResponse::ok(format!(
    "{name} is {}",
    instance.status
  )))
  .into_response()
}
