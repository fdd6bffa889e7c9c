use std::{path::PathBuf, time::Duration};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use command::{ChildProcess, ChildSpec, ExitEvent};
use keeper_client::entities::{
  PortPair, RunStatus, TunnelInstance,
};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
  config::{KeeperConfig, resolve_command},
  supervisor::budget::RestartBudget,
  supervisor::health,
};

/// Consecutive probe failures before a tunnel reads unhealthy.
const TUNNEL_FAIL_THRESHOLD: u32 = 2;

/// Deadline for the helper's mapping-port negotiation with the
/// gateway, download class rather than control class.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the helper prints on stdout when asked to negotiate a
/// mapping port with the gateway.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiationReply {
  mapping_port: u16,
}

/// One reverse tunnel for one remote-accessible service. Wraps the
/// helper child with the same supervision discipline as services,
/// scaled down. Owned by the service's supervisor; holds only the
/// service's name, never a back pointer.
pub struct Tunnel {
  service: String,
  helper: String,
  gateway: String,
  local_port: u16,
  mapping_port: u16,
  child: ChildProcess,
  exit_rx: mpsc::Receiver<ExitEvent>,
  status: RunStatus,
  healthy: bool,
  health: health::HealthTracker,
  budget: RestartBudget,
  created_at: DateTime<Utc>,
  bin_dir: PathBuf,
}

impl Tunnel {
  pub fn new(
    service: &str,
    local_port: u16,
    config: &KeeperConfig,
  ) -> Tunnel {
    let (child, exit_rx) = ChildProcess::new(
      format!("{service}-tunnel"),
      config.service_log_path(&format!("{service}-tunnel")),
      config.service_log_max_bytes,
    );
    Tunnel {
      service: service.to_string(),
      helper: config.tunnel.command.clone(),
      gateway: config.tunnel.gateway.clone(),
      local_port,
      mapping_port: 0,
      child,
      exit_rx,
      status: RunStatus::Stopped,
      healthy: false,
      health: health::HealthTracker::new(TUNNEL_FAIL_THRESHOLD),
      budget: RestartBudget::new(
        config.tunnel.restart_budget_count,
        Duration::from_secs(
          config.tunnel.restart_budget_window_secs,
        ),
      ),
      created_at: Utc::now(),
      bin_dir: config.bin_dir(),
    }
  }

  /// The local port moves with the service across restarts.
  pub fn set_local_port(&mut self, port: u16) {
    self.local_port = port;
  }

  pub fn status(&self) -> RunStatus {
    self.status
  }

  /// Negotiate a fresh mapping port with the gateway, then spawn
  /// the forwarding helper.
  pub async fn open(&mut self) -> anyhow::Result<TunnelInstance> {
    if self.status == RunStatus::Running {
      return Ok(self.snapshot());
    }
    let mapping_port = self.negotiate().await?;
    self.spawn_helper(mapping_port)?;
    Ok(self.snapshot())
  }

  pub async fn close(&mut self, grace: Duration) {
    self.child.stop(grace).await;
    // Swallow the stop's exit event so a later unexpected exit
    // is not misread.
    while let Ok(event) = self.exit_rx.try_recv() {
      debug!(
        "Tunnel {} helper stopped | {}",
        self.service, event.reason
      );
    }
    self.status = RunStatus::Stopped;
    self.healthy = false;
    self.health.reset();
  }

  pub async fn reopen(
    &mut self,
    grace: Duration,
  ) -> anyhow::Result<TunnelInstance> {
    self.close(grace).await;
    self.open().await
  }

  pub fn snapshot(&self) -> TunnelInstance {
    TunnelInstance {
      service: self.service.clone(),
      pairs: if self.mapping_port == 0 {
        Vec::new()
      } else {
        vec![PortPair {
          local_port: self.local_port,
          mapping_port: self.mapping_port,
        }]
      },
      status: self.status,
      pid: self.child.pid(),
      created_at: self.created_at,
      healthy: self.healthy,
    }
  }

  /// Await the next helper exit. The owning supervisor selects on
  /// this from its control loop.
  pub async fn recv_exit(&mut self) -> Option<ExitEvent> {
    self.exit_rx.recv().await
  }

  /// Unexpected helper exit: retry within the scaled-down budget,
  /// otherwise park in error until an explicit reopen.
  pub async fn handle_exit(&mut self, event: ExitEvent) {
    if self.status != RunStatus::Running {
      return;
    }
    warn!(
      "Tunnel helper for {} exited unexpectedly | {}",
      self.service, event.reason
    );
    self.healthy = false;
    if self.budget.consume() {
      match self.open_fresh().await {
        Ok(()) => {
          info!("Tunnel for {} reestablished", self.service);
        }
        Err(e) => {
          error!(
            "Failed to reestablish tunnel for {} | {e:#}",
            self.service
          );
          self.status = RunStatus::Error;
        }
      }
    } else {
      warn!(
        "Tunnel for {} spent its restart budget",
        self.service
      );
      self.status = RunStatus::Error;
    }
  }

  /// Helper alive AND the gateway answers on the mapping port.
  pub async fn probe(&mut self, timeout: Duration) {
    if self.status != RunStatus::Running {
      return;
    }
    let reachable = if !self.child.is_alive() {
      false
    } else {
      let host = self
        .gateway
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(self.gateway.as_str());
      health::probe_tcp(
        &format!("{host}:{}", self.mapping_port),
        timeout,
      )
      .await
    };
    self.health.record(reachable);
    self.healthy = self.health.healthy();
  }

  async fn open_fresh(&mut self) -> anyhow::Result<()> {
    self.status = RunStatus::Stopped;
    let mapping_port = self.negotiate().await?;
    self.spawn_helper(mapping_port)
  }

  async fn negotiate(&self) -> anyhow::Result<u16> {
    let (program, _) =
      resolve_command(&self.helper, &[], 0, &self.bin_dir);
    let local_port = self.local_port.to_string();
    let out = command::run_probe(
      &program,
      [
        "negotiate",
        "--gateway",
        self.gateway.as_str(),
        "--local-port",
        local_port.as_str(),
      ],
      NEGOTIATE_TIMEOUT,
    )
    .await;
    if !out.success {
      return Err(anyhow!(
        "tunnel helper negotiation failed: {}",
        out.combined().trim()
      ));
    }
    // The helper echoes the granted port as a single JSON object.
    let line = out
      .stdout
      .lines()
      .find(|line| line.trim_start().starts_with('{'))
      .context("helper printed no negotiation reply")?;
    let reply: NegotiationReply = serde_json::from_str(line)
      .context("invalid negotiation reply from helper")?;
    Ok(reply.mapping_port)
  }

  fn spawn_helper(
    &mut self,
    mapping_port: u16,
  ) -> anyhow::Result<()> {
    let (program, _) =
      resolve_command(&self.helper, &[], 0, &self.bin_dir);
    self
      .child
      .start(&ChildSpec {
        program,
        args: vec![
          String::from("forward"),
          String::from("--gateway"),
          self.gateway.clone(),
          String::from("--local-port"),
          self.local_port.to_string(),
          String::from("--mapping-port"),
          mapping_port.to_string(),
        ],
        ..Default::default()
      })
      .context("failed to spawn tunnel helper")?;
    self.mapping_port = mapping_port;
    self.status = RunStatus::Running;
    self.health.reset();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(dir: &tempfile::TempDir) -> KeeperConfig {
    KeeperConfig {
      root_directory: dir.path().to_path_buf(),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn snapshot_before_open_is_stopped_and_empty() {
    let dir = tempfile::tempdir().unwrap();
    let tunnel = Tunnel::new("svc-b", 8081, &config(&dir));
    let snapshot = tunnel.snapshot();
    assert_eq!(snapshot.status, RunStatus::Stopped);
    assert!(snapshot.pairs.is_empty());
    assert_eq!(snapshot.pid, 0);
    assert_eq!(snapshot.service, "svc-b");
  }

  #[tokio::test]
  async fn open_fails_cleanly_without_helper() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.tunnel.command =
      String::from("definitely-not-a-helper-binary");
    let mut tunnel = Tunnel::new("svc-b", 8081, &config);
    assert!(tunnel.open().await.is_err());
    assert_eq!(tunnel.status(), RunStatus::Stopped);
  }

  #[tokio::test]
  async fn close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut tunnel = Tunnel::new("svc-b", 8081, &config(&dir));
    tunnel.close(Duration::from_millis(100)).await;
    tunnel.close(Duration::from_millis(100)).await;
    assert_eq!(tunnel.status(), RunStatus::Stopped);
  }
}
