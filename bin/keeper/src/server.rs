use std::sync::Arc;

use anyhow::Context;

use crate::{
  api,
  config::keeper_config,
  coordinator::{
    BootstrapOutcome, Coordinator, RELAUNCH_EXIT_CODE, loops,
  },
};

/// Run the supervisor daemon until SIGTERM / ctrl-c. Returns the
/// process exit code (None = 0).
pub async fn run() -> anyhow::Result<Option<i32>> {
  let config = Arc::new(keeper_config().clone());
  let keeper_log = config.keeper_log_path();
  logger::init(&config.logging, Some(keeper_log.as_path()))?;

  info!(
    "costrict keeper v{} | root {}",
    env!("CARGO_PKG_VERSION"),
    config.root_directory.display()
  );

  let (coordinator, notify_rx) =
    Coordinator::init(config.clone()).await?;

  match coordinator.bootstrap().await? {
    BootstrapOutcome::Relaunch { version } => {
      info!(
        "Exiting for relaunch into keeper v{version}"
      );
      return Ok(Some(RELAUNCH_EXIT_CODE));
    }
    BootstrapOutcome::Ready => {}
  }

  loops::spawn_all(coordinator.clone(), notify_rx);

  let app = api::app(coordinator.clone());
  let shutdown = coordinator.shutdown_token();

  let tcp_addr = format!("127.0.0.1:{}", config.port);
  let tcp_listener = tokio::net::TcpListener::bind(&tcp_addr)
    .await
    .with_context(|| format!("Failed to bind {tcp_addr}"))?;
  info!("Control plane on {tcp_addr}");
  let tcp_shutdown = shutdown.clone();
  let tcp_app = app.clone();
  tokio::spawn(async move {
    let serve = axum::serve(tcp_listener, tcp_app)
      .with_graceful_shutdown(async move {
        tcp_shutdown.cancelled().await;
      });
    if let Err(e) = serve.await {
      error!("TCP control plane failed | {e:#}");
    }
  });

  #[cfg(unix)]
  {
    let socket = config.socket_path();
    // A previous run may have left the socket file behind.
    let _ = std::fs::remove_file(&socket);
    match tokio::net::UnixListener::bind(&socket) {
      Ok(unix_listener) => {
        info!("Control plane on {}", socket.display());
        let unix_shutdown = shutdown.clone();
        let unix_app = app.clone();
        tokio::spawn(async move {
          let serve = axum::serve(unix_listener, unix_app)
            .with_graceful_shutdown(async move {
              unix_shutdown.cancelled().await;
            });
          if let Err(e) = serve.await {
            error!("Unix control plane failed | {e:#}");
          }
        });
      }
      Err(e) => {
        warn!(
          "Could not bind {}, unix transport disabled | {e:#}",
          socket.display()
        );
      }
    }
  }

  wait_for_termination().await;

  info!("Shutting down, stopping all services");
  coordinator.shutdown().await;
  // Give the writer loop a beat to flush the final well-known.
  tokio::time::sleep(std::time::Duration::from_millis(200))
    .await;
  #[cfg(unix)]
  {
    let _ = std::fs::remove_file(config.socket_path());
  }
  Ok(None)
}

#[cfg(unix)]
async fn wait_for_termination() {
  let mut term = match tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  ) {
    Ok(term) => term,
    Err(e) => {
      error!("Failed to install SIGTERM handler | {e:#}");
      let _ = tokio::signal::ctrl_c().await;
      return;
    }
  };
  tokio::select! {
    _ = term.recv() => {}
    _ = tokio::signal::ctrl_c() => {}
  }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
  let _ = tokio::signal::ctrl_c().await;
}
