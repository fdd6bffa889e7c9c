use std::sync::Arc;

use axum::{
  Router,
  routing::{delete, get, post},
};

use crate::coordinator::Coordinator;

mod components;
mod services;
mod system;

/// The control plane: everything under `/costrict/api/v1` plus
/// the bare `/healthz` liveness probe. Served on loopback TCP
/// and, on unix, the domain socket under `run/`.
pub fn app(coordinator: Arc<Coordinator>) -> Router {
  let v1 = Router::new()
    .route("/reload", post(system::reload))
    .route("/check", post(system::check))
    .route("/known", get(system::known))
    .route("/clean", post(system::clean))
    .route("/logs/upload", post(system::upload_logs))
    .route("/services", get(services::list))
    .route("/services/{name}", get(services::get_one))
    .route(
      "/services/{name}/{action}",
      post(services::action),
    )
    .route("/components", get(components::list))
    .route(
      "/components/{name}/upgrade",
      post(components::upgrade),
    )
    .route("/components/{name}", delete(components::remove));

  Router::new()
    .route("/healthz", get(system::healthz))
    .nest("/costrict/api/v1", v1)
    .with_state(coordinator)
}
