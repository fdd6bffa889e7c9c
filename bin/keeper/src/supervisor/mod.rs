use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use arc_swap::ArcSwap;
use chrono::Utc;
use command::{ChildProcess, ChildSpec, ExitEvent, StartError};
use keeper_client::entities::{
  Accessibility, ComponentDecl, ComponentRecord, RunStatus,
  ServiceDecl, ServiceInstance, StartupMode, TunnelInstance,
};
use ports::{PortAllocator, PortError};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::{
  config::{KeeperConfig, resolve_command},
  error::{KeeperError, KeeperResult},
  installer::Installer,
  metrics::Metrics,
  tunnel::Tunnel,
  wellknown::WellKnownNotify,
};

pub mod budget;
pub mod health;

use budget::{Backoff, RestartBudget};
use health::HealthTracker;

/// Everything a supervisor borrows from the coordinator.
pub struct SupervisorDeps {
  pub config: Arc<KeeperConfig>,
  pub installer: Arc<Installer>,
  pub ports: Arc<PortAllocator>,
  pub notify: Arc<WellKnownNotify>,
  pub metrics: Arc<Metrics>,
}

#[derive(Debug, Clone, Copy)]
pub enum TunnelOp {
  Open,
  Close,
  Reopen,
}

enum Cmd {
  Start(oneshot::Sender<KeeperResult<ServiceInstance>>),
  Stop(oneshot::Sender<KeeperResult<ServiceInstance>>),
  Restart(oneshot::Sender<KeeperResult<ServiceInstance>>),
  Tunnel(
    TunnelOp,
    oneshot::Sender<KeeperResult<TunnelInstance>>,
  ),
  UpdateDecl(
    Box<(ServiceDecl, ComponentDecl)>,
    oneshot::Sender<()>,
  ),
  RetryBudget,
  Shutdown(oneshot::Sender<()>),
}

/// Handle to one service's control task. All mutation flows
/// through the bounded command channel and is serialized in
/// arrival order; reads take lock free snapshot copies.
pub struct Supervisor {
  name: String,
  snapshot: Arc<ArcSwap<ServiceInstance>>,
  decl: ArcSwap<ServiceDecl>,
  cmd_tx: mpsc::Sender<Cmd>,
  watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
  pub fn spawn(
    decl: ServiceDecl,
    component: ComponentDecl,
    deps: SupervisorDeps,
  ) -> Arc<Supervisor> {
    let name = decl.name.clone();
    let snapshot = Arc::new(ArcSwap::from_pointee(
      ServiceInstance {
        name: name.clone(),
        status: RunStatus::Disabled,
        ..Default::default()
      },
    ));
    let (cmd_tx, cmd_rx) = mpsc::channel(16);

    let runtime = ServiceRuntime::new(
      decl.clone(),
      component,
      deps,
      snapshot.clone(),
    );
    let control = tokio::spawn(runtime.run(cmd_rx));

    // Contain panics: a crashed control task marks the instance
    // `error` instead of taking the coordinator down.
    let watcher_snapshot = snapshot.clone();
    let watcher_name = name.clone();
    let watcher = tokio::spawn(async move {
      let Err(e) = control.await else {
        return;
      };
      if e.is_panic() {
        error!(
          "Supervisor for {watcher_name} panicked | {e:#}"
        );
        let mut instance =
          ServiceInstance::clone(&watcher_snapshot.load());
        instance.status = RunStatus::Error;
        instance.pid = 0;
        instance.healthy = false;
        instance.last_exit_reason = format!("panic: {e}");
        watcher_snapshot.store(Arc::new(instance));
      }
    });

    Arc::new(Supervisor {
      name,
      snapshot,
      decl: ArcSwap::from_pointee(decl),
      cmd_tx,
      watcher: Mutex::new(Some(watcher)),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn snapshot(&self) -> ServiceInstance {
    ServiceInstance::clone(&self.snapshot.load())
  }

  pub fn decl(&self) -> Arc<ServiceDecl> {
    self.decl.load_full()
  }

  pub async fn start(&self) -> KeeperResult<ServiceInstance> {
    self.roundtrip(Cmd::Start).await?
  }

  pub async fn stop(&self) -> KeeperResult<ServiceInstance> {
    self.roundtrip(Cmd::Stop).await?
  }

  pub async fn restart(&self) -> KeeperResult<ServiceInstance> {
    self.roundtrip(Cmd::Restart).await?
  }

  pub async fn tunnel(
    &self,
    op: TunnelOp,
  ) -> KeeperResult<TunnelInstance> {
    self
      .roundtrip(|reply| Cmd::Tunnel(op, reply))
      .await?
  }

  /// Swap in a changed declaration (reload, no port change).
  /// Returns once the control task has acknowledged it.
  pub async fn update_decl(
    &self,
    decl: ServiceDecl,
    component: ComponentDecl,
  ) -> KeeperResult<()> {
    self.decl.store(Arc::new(decl.clone()));
    self
      .roundtrip(|reply| {
        Cmd::UpdateDecl(Box::new((decl, component)), reply)
      })
      .await
  }

  /// Slow reconciler: clear an exhausted budget and retry once.
  pub fn retry_budget(&self) {
    let _ = self.cmd_tx.try_send(Cmd::RetryBudget);
  }

  /// Graceful stop and control task exit. The supervisor accepts
  /// no commands afterwards.
  pub async fn shutdown(&self) {
    let (reply, rx) = oneshot::channel();
    if self.cmd_tx.send(Cmd::Shutdown(reply)).await.is_ok() {
      let _ = rx.await;
    }
    if let Some(watcher) = self.watcher.lock().await.take() {
      let _ = watcher.await;
    }
  }

  async fn roundtrip<T>(
    &self,
    cmd: impl FnOnce(oneshot::Sender<T>) -> Cmd,
  ) -> KeeperResult<T> {
    let (reply, rx) = oneshot::channel();
    self
      .cmd_tx
      .send(cmd(reply))
      .await
      .map_err(|_| dead_task(&self.name))?;
    rx.await.map_err(|_| dead_task(&self.name))
  }
}

fn dead_task(name: &str) -> KeeperError {
  KeeperError::Fatal(anyhow!(
    "supervisor task for '{name}' is gone"
  ))
}

/// Internal state of one control task. Owned by exactly one tokio
/// task; the outside world sees only snapshot copies.
struct ServiceRuntime {
  decl: ServiceDecl,
  component: ComponentDecl,
  deps: SupervisorDeps,
  child: ChildProcess,
  exit_rx: mpsc::Receiver<ExitEvent>,
  status: RunStatus,
  port: u16,
  start_time: Option<chrono::DateTime<Utc>>,
  restart_count: u32,
  last_exit_time: Option<chrono::DateTime<Utc>>,
  last_exit_reason: String,
  component_record: Option<ComponentRecord>,
  budget: RestartBudget,
  backoff: Backoff,
  health: HealthTracker,
  tunnel: Option<Tunnel>,
  /// Remote services open their tunnel after the first healthy
  /// confirmation following a (re)start.
  tunnel_pending: bool,
  restart_at: Option<tokio::time::Instant>,
  snapshot: Arc<ArcSwap<ServiceInstance>>,
}

impl ServiceRuntime {
  fn new(
    decl: ServiceDecl,
    component: ComponentDecl,
    deps: SupervisorDeps,
    snapshot: Arc<ArcSwap<ServiceInstance>>,
  ) -> ServiceRuntime {
    let config = &deps.config;
    let (child, exit_rx) = ChildProcess::new(
      decl.name.clone(),
      config.service_log_path(&decl.name),
      config.service_log_max_bytes,
    );
    let budget = RestartBudget::new(
      config.restart_budget_count,
      Duration::from_secs(config.restart_budget_window_secs),
    );
    let backoff = Backoff::new(Duration::from_secs(
      config.error_backoff_cap_secs,
    ));
    let health =
      HealthTracker::new(config.health_fail_threshold);
    ServiceRuntime {
      decl,
      component,
      deps,
      child,
      exit_rx,
      status: RunStatus::Disabled,
      port: 0,
      start_time: None,
      restart_count: 0,
      last_exit_time: None,
      last_exit_reason: String::new(),
      component_record: None,
      budget,
      backoff,
      health,
      tunnel: None,
      tunnel_pending: false,
      restart_at: None,
      snapshot,
    }
  }

  async fn run(mut self, mut cmd_rx: mpsc::Receiver<Cmd>) {
    let mut probe = tokio::time::interval(Duration::from_secs(
      self.deps.config.health_interval_secs,
    ));
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      let restart_at = self.restart_at;
      tokio::select! {
        cmd = cmd_rx.recv() => {
          match cmd {
            None => {
              self.shutdown().await;
              break;
            }
            Some(Cmd::Shutdown(reply)) => {
              self.shutdown().await;
              let _ = reply.send(());
              break;
            }
            Some(cmd) => self.handle_cmd(cmd).await,
          }
        }
        Some(event) = self.exit_rx.recv() => {
          self.handle_service_exit(event).await;
        }
        event = async {
          match self.tunnel.as_mut() {
            Some(tunnel) => tunnel.recv_exit().await,
            None => std::future::pending().await,
          }
        } => {
          if let Some(event) = event {
            self.handle_tunnel_exit(event).await;
          }
        }
        _ = probe.tick(),
          if self.status == RunStatus::Running => {
          self.on_probe_tick().await;
        }
        _ = async {
          let deadline = restart_at.unwrap_or_else(|| {
            tokio::time::Instant::now()
              + Duration::from_secs(3600)
          });
          tokio::time::sleep_until(deadline).await
        }, if restart_at.is_some() => {
          self.restart_at = None;
          self.attempt_auto_restart().await;
        }
      }
    }
  }

  async fn handle_cmd(&mut self, cmd: Cmd) {
    match cmd {
      Cmd::Start(reply) => {
        let result = self.explicit_start().await;
        let _ =
          reply.send(result.map(|_| self.build_snapshot()));
      }
      Cmd::Stop(reply) => {
        self.user_stop().await;
        let _ = reply.send(Ok(self.build_snapshot()));
      }
      Cmd::Restart(reply) => {
        let result = self.user_restart().await;
        let _ =
          reply.send(result.map(|_| self.build_snapshot()));
      }
      Cmd::Tunnel(op, reply) => {
        let _ = reply.send(self.tunnel_op(op).await);
      }
      Cmd::UpdateDecl(update, reply) => {
        let (decl, component) = *update;
        self.decl = decl;
        self.component = component;
        self.publish();
        let _ = reply.send(());
      }
      Cmd::RetryBudget => self.budget_retry().await,
      // Shutdown is intercepted in the select loop.
      Cmd::Shutdown(reply) => {
        let _ = reply.send(());
      }
    }
  }

  /// User initiated start. Conflict while running; from any
  /// parked state it resets budget and backoff for a fresh run.
  async fn explicit_start(&mut self) -> KeeperResult<()> {
    if self.status == RunStatus::Running {
      return Err(KeeperError::Conflict(format!(
        "service '{}' is already running",
        self.decl.name
      )));
    }
    self.restart_at = None;
    self.budget.reset();
    self.backoff.reset();
    self.spawn_child().await.inspect_err(|_| {
      self.status = RunStatus::Error;
      self.publish();
    })
  }

  async fn user_stop(&mut self) {
    self.restart_at = None;
    self.stop_child().await;
    self.close_tunnel().await;
    // Stop is sticky: no auto restart leaves this state.
    self.status = RunStatus::Stopped;
    self.publish();
  }

  async fn user_restart(&mut self) -> KeeperResult<()> {
    self.restart_at = None;
    self.stop_child().await;
    self.close_tunnel().await;
    self.budget.reset();
    self.backoff.reset();
    self.spawn_child().await.inspect_err(|_| {
      self.status = RunStatus::Error;
      self.publish();
    })
  }

  async fn tunnel_op(
    &mut self,
    op: TunnelOp,
  ) -> KeeperResult<TunnelInstance> {
    if self.decl.accessible != Accessibility::Remote {
      return Err(KeeperError::Conflict(format!(
        "service '{}' is not remote-accessible",
        self.decl.name
      )));
    }
    let grace = self.grace();
    match op {
      TunnelOp::Open => {
        if self.status != RunStatus::Running {
          return Err(KeeperError::Conflict(format!(
            "service '{}' is not running",
            self.decl.name
          )));
        }
        // A tunnel parked in error spent its helper budget;
        // only an explicit reopen renegotiates it.
        if let Some(tunnel) = &self.tunnel
          && tunnel.status() == RunStatus::Error
        {
          return Err(KeeperError::BudgetExhausted(format!(
            "tunnel for '{}'",
            self.decl.name
          )));
        }
        let tunnel = self.ensure_tunnel();
        let result = tunnel.open().await.map_err(|reason| {
          KeeperError::TunnelOpenFailed {
            name: self.decl.name.clone(),
            reason,
          }
        });
        self.tunnel_pending = false;
        self.publish();
        result
      }
      TunnelOp::Close => {
        let Some(tunnel) = self.tunnel.as_mut() else {
          return Err(KeeperError::Conflict(format!(
            "service '{}' has no tunnel",
            self.decl.name
          )));
        };
        tunnel.close(grace).await;
        let snapshot = tunnel.snapshot();
        self.publish();
        Ok(snapshot)
      }
      TunnelOp::Reopen => {
        if self.status != RunStatus::Running {
          return Err(KeeperError::Conflict(format!(
            "service '{}' is not running",
            self.decl.name
          )));
        }
        let tunnel = self.ensure_tunnel();
        let result =
          tunnel.reopen(grace).await.map_err(|reason| {
            KeeperError::TunnelOpenFailed {
              name: self.decl.name.clone(),
              reason,
            }
          });
        self.publish();
        result
      }
    }
  }

  /// Child exit observed on the runner channel. Stops initiated
  /// by the keeper drain the channel inline, so anything arriving
  /// here is the child's own doing.
  async fn handle_service_exit(&mut self, event: ExitEvent) {
    info!(
      "Service {} ({}) exited | {}",
      self.decl.name, event.pid, event.reason
    );
    self.last_exit_time = Some(Utc::now());
    self.last_exit_reason = event.reason.clone();
    if self.status != RunStatus::Running {
      // Stale event from a stop that raced the drain; the state
      // machine already moved on.
      self.publish();
      return;
    }
    self.health.reset();
    self.close_tunnel().await;

    if event.clean() {
      self.status = RunStatus::Exited;
      self.publish();
      if self.decl.startup == StartupMode::Always {
        // Fast path: clean exits restart immediately while the
        // budget lasts.
        if self.budget.consume() {
          self.auto_restart_now().await;
        } else {
          warn!(
            "Service {} spent its restart budget, staying \
             exited until the reconciler retries",
            self.decl.name
          );
        }
      }
      return;
    }

    self.status = RunStatus::Error;
    self.publish();
    if self.decl.startup != StartupMode::Always {
      return;
    }
    if self.budget.consume() {
      let delay = self.backoff.next_delay();
      debug!(
        "Service {} restarting in {delay:?}",
        self.decl.name
      );
      self.restart_at =
        Some(tokio::time::Instant::now() + delay);
    } else {
      warn!(
        "Service {} spent its restart budget, parked in error \
         until the reconciler retries",
        self.decl.name
      );
    }
  }

  async fn handle_tunnel_exit(&mut self, event: ExitEvent) {
    if let Some(tunnel) = self.tunnel.as_mut() {
      tunnel.handle_exit(event).await;
      self.publish();
    }
  }

  async fn on_probe_tick(&mut self) {
    let timeout =
      Duration::from_secs(self.deps.config.health_timeout_secs);
    let health_fail_threshold = self.deps.config.health_fail_threshold;

    if self.decl.health_path.is_empty() {
      // Liveness is pid presence alone; exits arrive on the
      // channel. A quiet minute earns the backoff back.
      if self.child.is_alive()
        && let Some(started) = self.start_time
        && (Utc::now() - started).num_seconds() >= 60
      {
        self.backoff.reset();
      }
      if self.tunnel_pending && self.child.is_alive() {
        self.open_pending_tunnel().await;
      }
    } else {
      let healthy_before = self.health.healthy();
      let ok = health::probe_http(
        self.port,
        &self.decl.health_path,
        timeout,
      )
      .await;
      let crossed = self.health.record(ok);
      if ok {
        self.backoff.reset();
        if self.tunnel_pending {
          self.open_pending_tunnel().await;
        }
      }
      if crossed {
        warn!(
          "Service {} failed {} consecutive health probes",
          self.decl.name, health_fail_threshold
        );
        self.fail_unhealthy().await;
        return;
      }
      if healthy_before != self.health.healthy() {
        self.publish();
      }
    }

    if let Some(tunnel) = self.tunnel.as_mut() {
      tunnel.probe(timeout).await;
    }
    self.publish();
  }

  /// Health probe threshold crossed: the child is alive but
  /// unresponsive. Recycle it through the error path.
  async fn fail_unhealthy(&mut self) {
    self.stop_child().await;
    self.close_tunnel().await;
    self.last_exit_time = Some(Utc::now());
    self.last_exit_reason =
      String::from("health probe failures");
    self.status = RunStatus::Error;
    self.publish();
    if self.decl.startup == StartupMode::Always {
      if self.budget.consume() {
        let delay = self.backoff.next_delay();
        self.restart_at =
          Some(tokio::time::Instant::now() + delay);
      } else {
        warn!(
          "Service {} spent its restart budget after failed \
           probes",
          self.decl.name
        );
      }
    }
  }

  /// Backoff timer fired.
  async fn attempt_auto_restart(&mut self) {
    if self.status != RunStatus::Error
      || self.decl.startup != StartupMode::Always
    {
      return;
    }
    self.auto_restart_now().await;
  }

  async fn auto_restart_now(&mut self) {
    match self.spawn_child().await {
      Ok(()) => {
        self.restart_count += 1;
        Metrics::bump(&self.deps.metrics.restarts_total);
        self.publish();
      }
      Err(e) => {
        error!(
          "Auto restart of {} failed | {e:#}",
          self.decl.name
        );
        self.status = RunStatus::Error;
        self.publish();
        if self.budget.consume() {
          self.restart_at = Some(
            tokio::time::Instant::now()
              + self.backoff.next_delay(),
          );
        }
      }
    }
  }

  /// Budget cleared by the five minute reconciler: one retry.
  async fn budget_retry(&mut self) {
    let parked = matches!(
      self.status,
      RunStatus::Error | RunStatus::Exited
    );
    if !parked
      || self.decl.startup != StartupMode::Always
      || self.child.is_alive()
    {
      return;
    }
    info!(
      "Reconciler retrying {} with a fresh restart budget",
      self.decl.name
    );
    self.budget.reset();
    self.backoff.reset();
    if self.budget.consume() {
      self.auto_restart_now().await;
    }
  }

  /// The spawn pipeline: binary present, port bound, command
  /// resolved, child running.
  async fn spawn_child(&mut self) -> KeeperResult<()> {
    let config = self.deps.config.clone();
    self.ensure_component().await?;

    let preferred = if self.port != 0 {
      self.port
    } else {
      self.decl.port
    };
    let port = self
      .deps
      .ports
      .acquire(&self.decl.name, preferred)
      .map_err(|PortError::Exhausted { .. }| {
        KeeperError::PortExhausted(self.decl.name.clone())
      })?;
    self.port = port;

    let (program, args) = resolve_command(
      &self.decl.command,
      &self.decl.args,
      port,
      &config.bin_dir(),
    );
    let mut envs = Vec::new();
    if let Some(token) = config.read_token() {
      envs.push((String::from("COSTRICT_TOKEN"), token));
    }
    let pid = self
      .child
      .start(&ChildSpec {
        program,
        args,
        cwd: Some(config.root_directory.clone()),
        envs,
      })
      .map_err(|e| match e {
        StartError::AlreadyRunning => KeeperError::Conflict(
          format!("service '{}' is already running", self.decl.name),
        ),
        StartError::Spawn(e) => KeeperError::ServiceStartFailed {
          name: self.decl.name.clone(),
          reason: anyhow::Error::from(e),
        },
      })?;

    info!(
      "Service {} running (pid {pid}, port {port})",
      self.decl.name
    );
    self.status = RunStatus::Running;
    self.start_time = Some(Utc::now());
    self.health.reset();
    self.tunnel_pending =
      self.decl.accessible == Accessibility::Remote;
    if let Some(tunnel) = self.tunnel.as_mut() {
      tunnel.set_local_port(port);
    }
    // Without a probe path the first liveness confirmation is
    // the successful spawn itself.
    if self.tunnel_pending && self.decl.health_path.is_empty() {
      self.open_pending_tunnel().await;
    }
    self.publish();
    Ok(())
  }

  /// Make sure the backing component is on disk. Missing record
  /// or binary triggers an install; a bare PATH command is taken
  /// as externally managed.
  async fn ensure_component(&mut self) -> KeeperResult<()> {
    let installer = &self.deps.installer;
    let name = self.decl.component_name().to_string();
    self.component_record = installer.record(&name).await;

    let binary = installer.binary_path(&name);
    let have_binary = binary.exists();
    let bare_path_command = !self
      .decl
      .command
      .contains(std::path::MAIN_SEPARATOR)
      && !binary.exists();

    if self.component_record.is_some() && have_binary {
      return Ok(());
    }
    if bare_path_command && self.component_record.is_none() {
      // Nothing to install; the command resolves on PATH.
      return Ok(());
    }

    match installer.ensure(&self.component, false).await {
      Ok(outcome) => {
        debug!(
          "Component {name} ready at v{}",
          outcome.version()
        );
        self.component_record = installer.record(&name).await;
        Ok(())
      }
      Err(e) => Err(KeeperError::ServiceStartFailed {
        name: self.decl.name.clone(),
        reason: anyhow::Error::from(e)
          .context("component install failed"),
      }),
    }
  }

  async fn stop_child(&mut self) {
    self.child.stop(self.grace()).await;
    // The stop's exit event is already queued; consume it here
    // so the select loop cannot mistake it for a crash.
    while let Ok(event) = self.exit_rx.try_recv() {
      self.last_exit_time = Some(Utc::now());
      self.last_exit_reason = event.reason;
    }
    self.health.reset();
  }

  async fn close_tunnel(&mut self) {
    self.tunnel_pending = false;
    let grace = self.grace();
    if let Some(tunnel) = self.tunnel.as_mut() {
      tunnel.close(grace).await;
    }
  }

  async fn open_pending_tunnel(&mut self) {
    self.tunnel_pending = false;
    let tunnel = self.ensure_tunnel();
    if let Err(e) = tunnel.open().await {
      error!(
        "Failed to open tunnel for {} | {e:#}",
        self.decl.name
      );
    }
    self.publish();
  }

  fn ensure_tunnel(&mut self) -> &mut Tunnel {
    let config = &self.deps.config;
    let port = self.port;
    let tunnel = self.tunnel.get_or_insert_with(|| {
      Tunnel::new(&self.decl.name, port, config)
    });
    tunnel.set_local_port(port);
    tunnel
  }

  async fn shutdown(&mut self) {
    self.restart_at = None;
    self.stop_child().await;
    self.close_tunnel().await;
    if self.status == RunStatus::Running {
      self.status = RunStatus::Stopped;
    }
    self.publish();
  }

  fn grace(&self) -> Duration {
    Duration::from_secs(
      self.deps.config.graceful_stop_timeout_secs,
    )
  }

  fn build_snapshot(&self) -> ServiceInstance {
    ServiceInstance {
      name: self.decl.name.clone(),
      port: self.port,
      pid: self.child.pid(),
      status: self.status,
      healthy: if self.decl.health_path.is_empty() {
        self.status == RunStatus::Running
          && self.child.is_alive()
      } else {
        self.health.healthy()
      },
      start_time: self.start_time,
      restart_count: self.restart_count,
      last_exit_time: self.last_exit_time,
      last_exit_reason: self.last_exit_reason.clone(),
      component: self.component_record.clone(),
      // The tunnel object is reused across restarts, but it only
      // exists to the outside while the service is in a state
      // that can carry one.
      tunnel: if self.status.wants_tunnel() {
        self.tunnel.as_ref().map(|t| t.snapshot())
      } else {
        None
      },
    }
  }

  fn publish(&self) {
    self.snapshot.store(Arc::new(self.build_snapshot()));
    self.deps.notify.notify();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn deps(dir: &tempfile::TempDir) -> SupervisorDeps {
    let mut config = KeeperConfig {
      root_directory: dir.path().to_path_buf(),
      ..Default::default()
    };
    config.restart_budget_count = 2;
    config.restart_budget_window_secs = 60;
    let config = Arc::new(config);
    let installer =
      Arc::new(Installer::new(&config).unwrap());
    let ports = Arc::new(PortAllocator::load(
      config.port_range_min,
      config.port_range_max,
      config.port_state_path(),
    ));
    let (notify, _rx) = WellKnownNotify::channel();
    SupervisorDeps {
      config,
      installer,
      ports,
      notify: Arc::new(notify),
      metrics: Arc::new(Metrics::default()),
    }
  }

  fn decl(
    name: &str,
    command: &str,
    args: &[&str],
    startup: StartupMode,
  ) -> (ServiceDecl, ComponentDecl) {
    (
      ServiceDecl {
        name: name.to_string(),
        component: name.to_string(),
        startup,
        command: command.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        protocol: String::from("http"),
        port: 0,
        metrics_path: String::new(),
        health_path: String::new(),
        accessible: Accessibility::Local,
      },
      ComponentDecl {
        name: name.to_string(),
        version: String::from("^1.0.0"),
        upgrade: Default::default(),
      },
    )
  }

  async fn wait_for_status(
    supervisor: &Supervisor,
    status: RunStatus,
    within: Duration,
  ) -> ServiceInstance {
    let deadline = tokio::time::Instant::now() + within;
    loop {
      let snapshot = supervisor.snapshot();
      if snapshot.status == status {
        return snapshot;
      }
      if tokio::time::Instant::now() > deadline {
        panic!(
          "service never reached {status}, last snapshot: \
           {snapshot:?}"
        );
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
  }

  #[tokio::test]
  async fn start_stop_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (service, component) =
      decl("svc-a", "sleep", &["30"], StartupMode::Always);
    let supervisor =
      Supervisor::spawn(service, component, deps(&dir));

    let snapshot = supervisor.start().await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Running);
    assert_ne!(snapshot.pid, 0);
    assert_ne!(snapshot.port, 0);

    // Start while running is a state machine conflict.
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, KeeperError::Conflict(_)));

    let snapshot = supervisor.stop().await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Stopped);
    assert_eq!(snapshot.pid, 0);
    supervisor.shutdown().await;
  }

  #[tokio::test]
  async fn stop_is_sticky() {
    let dir = tempfile::tempdir().unwrap();
    let (service, component) =
      decl("svc-a", "sleep", &["30"], StartupMode::Always);
    let supervisor =
      Supervisor::spawn(service, component, deps(&dir));
    supervisor.start().await.unwrap();
    supervisor.stop().await.unwrap();
    // No auto restart may leave `stopped`.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
      supervisor.snapshot().status,
      RunStatus::Stopped
    );
    supervisor.shutdown().await;
  }

  #[tokio::test]
  async fn clean_exit_of_once_service_stays_exited() {
    let dir = tempfile::tempdir().unwrap();
    let (service, component) =
      decl("svc-a", "true", &[], StartupMode::Once);
    let supervisor =
      Supervisor::spawn(service, component, deps(&dir));
    supervisor.start().await.unwrap();
    let snapshot = wait_for_status(
      &supervisor,
      RunStatus::Exited,
      Duration::from_secs(5),
    )
    .await;
    assert_eq!(snapshot.restart_count, 0);
    assert_eq!(snapshot.last_exit_reason, "exit code: 0");
    supervisor.shutdown().await;
  }

  #[tokio::test]
  async fn crash_loop_exhausts_budget_and_parks_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let (service, component) =
      decl("svc-a", "false", &[], StartupMode::Always);
    let supervisor =
      Supervisor::spawn(service, component, deps(&dir));
    supervisor.start().await.unwrap();

    // Budget of 2: two backoff restarts, then parked in error.
    let snapshot = wait_for_status(
      &supervisor,
      RunStatus::Error,
      Duration::from_secs(10),
    )
    .await;
    assert!(snapshot.last_exit_reason.contains("exit code: 1"));

    tokio::time::sleep(Duration::from_secs(4)).await;
    let snapshot = supervisor.snapshot();
    assert_eq!(snapshot.status, RunStatus::Error);
    assert_eq!(snapshot.restart_count, 2);
    supervisor.shutdown().await;
  }

  #[tokio::test]
  async fn budget_retry_is_a_noop_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let (service, component) =
      decl("svc-a", "sleep", &["30"], StartupMode::Always);
    let supervisor =
      Supervisor::spawn(service, component, deps(&dir));
    supervisor.start().await.unwrap();
    let pid = supervisor.snapshot().pid;
    supervisor.retry_budget();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = supervisor.snapshot();
    assert_eq!(snapshot.status, RunStatus::Running);
    assert_eq!(snapshot.pid, pid);
    supervisor.shutdown().await;
  }

  #[tokio::test]
  async fn restart_preserves_port() {
    let dir = tempfile::tempdir().unwrap();
    let (service, component) =
      decl("svc-a", "sleep", &["30"], StartupMode::Always);
    let supervisor =
      Supervisor::spawn(service, component, deps(&dir));
    let first = supervisor.start().await.unwrap();
    let second = supervisor.restart().await.unwrap();
    assert_eq!(second.status, RunStatus::Running);
    assert_eq!(first.port, second.port);
    assert_ne!(first.pid, second.pid);
    supervisor.shutdown().await;
  }

  #[tokio::test]
  async fn tunnel_ops_on_local_service_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (service, component) =
      decl("svc-a", "sleep", &["30"], StartupMode::Always);
    let supervisor =
      Supervisor::spawn(service, component, deps(&dir));
    supervisor.start().await.unwrap();
    let err =
      supervisor.tunnel(TunnelOp::Open).await.unwrap_err();
    assert!(matches!(err, KeeperError::Conflict(_)));
    supervisor.shutdown().await;
  }
}
