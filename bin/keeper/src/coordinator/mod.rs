use std::{sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use indexmap::IndexMap;
use keeper_client::entities::{
  CheckResponse, CheckStatus, ComponentDecl, ComponentDetail,
  HealthzResponse, RunStatus, ServiceDecl, ServiceInstance,
  StartupMode, SystemSpec, WellKnown, WellKnownEndpoint,
  WellKnownLogs, WellKnownService,
};
use ports::PortAllocator;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
  config::KeeperConfig,
  error::{KeeperError, KeeperResult},
  installer::{InstallError, InstallOutcome, Installer},
  metrics::Metrics,
  supervisor::{Supervisor, SupervisorDeps},
  wellknown::WellKnownNotify,
};

pub mod loops;

/// What bootstrap decided about the keeper's own binary.
#[derive(Debug, PartialEq)]
pub enum BootstrapOutcome {
  Ready,
  /// A newer keeper landed in `bin/`; the process should exit
  /// with [RELAUNCH_EXIT_CODE] so the launcher swaps and
  /// restarts it.
  Relaunch { version: String },
}

/// Exit code the launcher reads as "relaunch me".
pub const RELAUNCH_EXIT_CODE: i32 = 86;

/// Sole owner of the fleet: the supervisor registry, the
/// installer, the port allocator and the scheduled loops. Only
/// the HTTP adapter and the CLI reach into it.
pub struct Coordinator {
  pub config: Arc<KeeperConfig>,
  pub installer: Arc<Installer>,
  pub ports: Arc<PortAllocator>,
  pub metrics: Arc<Metrics>,
  spec: ArcSwap<SystemSpec>,
  supervisors: RwLock<IndexMap<String, Arc<Supervisor>>>,
  notify: Arc<WellKnownNotify>,
  start_time: DateTime<Utc>,
  shutdown: CancellationToken,
}

impl Coordinator {
  /// Load the spec and assemble the managers. Does not start
  /// anything yet; `bootstrap` does.
  pub async fn init(
    config: Arc<KeeperConfig>,
  ) -> anyhow::Result<(Arc<Coordinator>, mpsc::Receiver<()>)> {
    config.ensure_layout()?;
    let spec = load_spec(&config).await?;
    spec
      .validate()
      .context("system spec failed validation")?;

    let installer = Arc::new(Installer::new(&config)?);
    let ports = Arc::new(PortAllocator::load(
      config.port_range_min,
      config.port_range_max,
      config.port_state_path(),
    ));
    let (notify, notify_rx) = WellKnownNotify::channel();

    let coordinator = Arc::new(Coordinator {
      config,
      installer,
      ports,
      metrics: Arc::new(Metrics::default()),
      spec: ArcSwap::from_pointee(spec),
      supervisors: RwLock::new(IndexMap::new()),
      notify: Arc::new(notify),
      start_time: Utc::now(),
      shutdown: CancellationToken::new(),
    });
    Ok((coordinator, notify_rx))
  }

  pub fn spec(&self) -> Arc<SystemSpec> {
    self.spec.load_full()
  }

  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  /// First boot: self upgrade check, install everything the spec
  /// declares, create one supervisor per service and start the
  /// autostarting ones. Install failures mark the affected
  /// service `error` but never abort the coordinator.
  pub async fn bootstrap(
    self: &Arc<Self>,
  ) -> anyhow::Result<BootstrapOutcome> {
    let spec = self.spec();

    if let Some(version) = self.self_upgrade(&spec).await {
      return Ok(BootstrapOutcome::Relaunch { version });
    }

    for component in &spec.components {
      match self.installer.ensure(component, false).await {
        Ok(outcome) => {
          debug!(
            "Component {} at v{}",
            component.name,
            outcome.version()
          );
        }
        Err(e) => {
          error!(
            "Bootstrap install of {} failed | {e:#}",
            component.name
          );
        }
      }
    }

    {
      let mut supervisors = self.supervisors.write().await;
      for service in &spec.services {
        let component = self.component_decl(&spec, service);
        let supervisor = Supervisor::spawn(
          service.clone(),
          component,
          self.supervisor_deps(),
        );
        supervisors
          .insert(service.name.clone(), supervisor);
      }
    }

    let supervisors = self.supervisors.read().await;
    for (name, supervisor) in supervisors.iter() {
      let startup = supervisor.decl().startup;
      if matches!(
        startup,
        StartupMode::Always | StartupMode::Once
      ) && let Err(e) = supervisor.start().await
      {
        error!("Startup of {name} failed | {e:#}");
      }
    }
    drop(supervisors);

    self.notify.notify();
    info!(
      "Bootstrap complete: {} components, {} services",
      spec.components.len(),
      spec.services.len()
    );
    Ok(BootstrapOutcome::Ready)
  }

  /// Cooperative self upgrade: install the keeper's own component
  /// and, when a different version landed, hand control back to
  /// the launcher.
  async fn self_upgrade(
    &self,
    spec: &SystemSpec,
  ) -> Option<String> {
    let outcome =
      match self.installer.ensure(&spec.keeper, false).await {
        Ok(outcome) => outcome,
        Err(e) => {
          warn!("Keeper self upgrade check failed | {e:#}");
          return None;
        }
      };
    let version = outcome.version().to_string();
    match outcome {
      InstallOutcome::AlreadyCurrent(_) => None,
      InstallOutcome::Installed(_)
      | InstallOutcome::Staged(_) => {
        if version == env!("CARGO_PKG_VERSION") {
          return None;
        }
        info!(
          "Keeper v{version} downloaded, requesting relaunch"
        );
        Some(version)
      }
    }
  }

  fn component_decl(
    &self,
    spec: &SystemSpec,
    service: &ServiceDecl,
  ) -> ComponentDecl {
    spec
      .component(service.component_name())
      .cloned()
      .unwrap_or_else(|| ComponentDecl {
        name: service.component_name().to_string(),
        version: String::from("*"),
        upgrade: Default::default(),
      })
  }

  fn supervisor_deps(&self) -> SupervisorDeps {
    SupervisorDeps {
      config: self.config.clone(),
      installer: self.installer.clone(),
      ports: self.ports.clone(),
      notify: self.notify.clone(),
      metrics: self.metrics.clone(),
    }
  }

  /// Re-fetch the spec and reconcile the running set against it.
  /// Returns once every add / remove / change has been
  /// acknowledged by the affected supervisor.
  pub async fn reload(&self) -> KeeperResult<(usize, usize, usize)> {
    let spec = load_spec(&self.config)
      .await
      .map_err(KeeperError::ConfigReload)?;
    spec
      .validate()
      .map_err(KeeperError::ConfigInvalid)?;

    let mut added = 0;
    let mut removed = 0;
    let mut changed = 0;

    let mut supervisors = self.supervisors.write().await;

    // Drop services the new spec no longer lists. Their tunnel
    // dies with them, and the port binding is returned.
    let stale = supervisors
      .keys()
      .filter(|name| spec.service(name).is_none())
      .cloned()
      .collect::<Vec<_>>();
    for name in stale {
      if let Some(supervisor) = supervisors.shift_remove(&name)
      {
        info!("Spec dropped service {name}, stopping");
        supervisor.shutdown().await;
        self.ports.release(&name);
        removed += 1;
      }
    }

    for service in &spec.services {
      let component = self.component_decl(&spec, service);
      match supervisors.get(&service.name) {
        None => {
          let supervisor = Supervisor::spawn(
            service.clone(),
            component,
            self.supervisor_deps(),
          );
          if matches!(
            service.startup,
            StartupMode::Always | StartupMode::Once
          ) && let Err(e) = supervisor.start().await
          {
            error!(
              "Start of added service {} failed | {e:#}",
              service.name
            );
          }
          supervisors
            .insert(service.name.clone(), supervisor);
          added += 1;
        }
        Some(existing) => {
          let old = existing.decl();
          match classify_change(&old, service) {
            SpecChange::Unchanged => {
              // Still push the (possibly changed) component
              // declaration down for future installs.
              existing
                .update_decl(service.clone(), component)
                .await?;
            }
            SpecChange::InPlace => {
              info!(
                "Service {} changed in place, restarting",
                service.name
              );
              existing
                .update_decl(service.clone(), component)
                .await?;
              let was_running = existing.snapshot().status
                == RunStatus::Running;
              if was_running
                && let Err(e) = existing.restart().await
              {
                error!(
                  "Restart of changed service {} failed | {e:#}",
                  service.name
                );
              }
              changed += 1;
            }
            SpecChange::Recreate => {
              info!(
                "Service {} changed structurally, recreating",
                service.name
              );
              let was_started = existing.snapshot().status
                != RunStatus::Disabled;
              if let Some(old) =
                supervisors.shift_remove(&service.name)
              {
                old.shutdown().await;
              }
              self.ports.release(&service.name);
              let supervisor = Supervisor::spawn(
                service.clone(),
                component,
                self.supervisor_deps(),
              );
              if (was_started
                || service.startup == StartupMode::Always)
                && service.startup != StartupMode::None
                && let Err(e) = supervisor.start().await
              {
                error!(
                  "Start of recreated service {} failed | {e:#}",
                  service.name
                );
              }
              supervisors
                .insert(service.name.clone(), supervisor);
              changed += 1;
            }
          }
        }
      }
    }

    // Preserve spec ordering in the registry for deterministic
    // listings and stop ordering.
    supervisors.sort_by(|a_name, _, b_name, _| {
      let pos = |n: &str| {
        spec
          .services
          .iter()
          .position(|s| s.name == n)
          .unwrap_or(usize::MAX)
      };
      pos(a_name).cmp(&pos(b_name))
    });
    drop(supervisors);

    self.spec.store(Arc::new(spec));
    Metrics::bump(&self.metrics.reloads_total);
    self.notify.notify();
    Ok((added, removed, changed))
  }

  pub async fn list_instances(&self) -> Vec<ServiceInstance> {
    let supervisors = self.supervisors.read().await;
    supervisors
      .values()
      .map(|supervisor| supervisor.snapshot())
      .collect()
  }

  pub async fn get_supervisor(
    &self,
    name: &str,
  ) -> KeeperResult<Arc<Supervisor>> {
    let supervisors = self.supervisors.read().await;
    supervisors
      .get(name)
      .cloned()
      .ok_or_else(|| {
        KeeperError::ServiceNotFound(name.to_string())
      })
  }

  pub async fn get_instance(
    &self,
    name: &str,
  ) -> KeeperResult<ServiceInstance> {
    Ok(self.get_supervisor(name).await?.snapshot())
  }

  pub async fn component_details(&self) -> Vec<ComponentDetail> {
    let spec = self.spec();
    let mut details = Vec::new();
    for decl in &spec.components {
      details.push(self.installer.detail(decl).await);
    }
    details
  }

  /// User-forced upgrade: ignores a manual pin, swaps the binary
  /// and bounces every running service built from it.
  pub async fn upgrade_component(
    &self,
    name: &str,
  ) -> KeeperResult<String> {
    let spec = self.spec();
    let decl = spec.component(name).cloned().ok_or_else(|| {
      KeeperError::ComponentNotFound(name.to_string())
    })?;

    let outcome = self
      .installer
      .ensure(&decl, true)
      .await
      .map_err(|e| match e {
        InstallError::NoSuchComponent(name) => {
          KeeperError::ComponentNotFound(name)
        }
        InstallError::Transient(e) => KeeperError::Transient(
          e.context(format!("upgrade of '{name}'")),
        ),
        e => KeeperError::ComponentUpgradeFailed {
          name: name.to_string(),
          reason: e.into(),
        },
      })?;

    let version = outcome.version().to_string();
    match outcome {
      InstallOutcome::AlreadyCurrent(_) => {
        return Ok(format!("already current at v{version}"));
      }
      InstallOutcome::Installed(_)
      | InstallOutcome::Staged(_) => {}
    }

    self.bounce_component_services(&decl).await;
    Metrics::bump(&self.metrics.upgrades_applied);
    Ok(format!("upgraded to v{version}"))
  }

  /// Stop every running service built from `decl` in reverse
  /// declaration order, swap a staged artifact if one waits, and
  /// start them again in forward order.
  pub async fn bounce_component_services(
    &self,
    decl: &ComponentDecl,
  ) {
    let supervisors = self.supervisors.read().await;
    let affected = supervisors
      .values()
      .filter(|supervisor| {
        supervisor.decl().component_name() == decl.name
          && supervisor.snapshot().status == RunStatus::Running
      })
      .cloned()
      .collect::<Vec<_>>();
    drop(supervisors);
    if affected.is_empty() {
      let _ = self
        .installer
        .swap_staged(decl)
        .await
        .inspect_err(|e| {
          error!("Staged swap of {} failed | {e:#}", decl.name)
        });
      return;
    }

    for supervisor in affected.iter().rev() {
      if let Err(e) = supervisor.stop().await {
        error!(
          "Stop of {} for upgrade failed | {e:#}",
          supervisor.name()
        );
      }
    }
    if let Err(e) = self.installer.swap_staged(decl).await {
      error!("Staged swap of {} failed | {e:#}", decl.name);
    }
    for supervisor in affected.iter() {
      if let Err(e) = supervisor.start().await {
        error!(
          "Restart of {} after upgrade failed | {e:#}",
          supervisor.name()
        );
      }
    }
  }

  pub async fn remove_component(
    &self,
    name: &str,
  ) -> KeeperResult<()> {
    let supervisors = self.supervisors.read().await;
    let busy = supervisors.values().any(|supervisor| {
      supervisor.decl().component_name() == name
        && supervisor.snapshot().status == RunStatus::Running
    });
    drop(supervisors);
    if busy {
      return Err(KeeperError::Conflict(format!(
        "component '{name}' backs a running service"
      )));
    }
    self.installer.uninstall(name).await.map_err(
      |e| match e {
        InstallError::NotInstalled(name) => {
          KeeperError::ComponentNotFound(name)
        }
        e => KeeperError::Fatal(e.into()),
      },
    )
  }

  /// Full health aggregation. One check per service plus one per
  /// declared component; overall is healthy only when every
  /// always-service is running and healthy and every component
  /// satisfies its range.
  pub async fn check(&self) -> CheckResponse {
    let services = self.list_instances().await;
    let components = self.component_details().await;
    let spec = self.spec();

    let mut passed = 0u32;
    let mut failed = 0u32;
    let mut always_failed = false;
    let mut other_failed = false;

    for instance in &services {
      let startup = spec
        .service(&instance.name)
        .map(|decl| decl.startup)
        .unwrap_or(StartupMode::None);
      let ok = match startup {
        StartupMode::Always => {
          instance.status == RunStatus::Running
            && instance.healthy
        }
        _ => instance.status != RunStatus::Error,
      };
      if ok {
        passed += 1;
      } else {
        failed += 1;
        if startup == StartupMode::Always {
          always_failed = true;
        } else {
          other_failed = true;
        }
      }
    }

    for component in &components {
      if component.satisfied {
        passed += 1;
      } else {
        failed += 1;
        other_failed = true;
      }
    }

    let status = if always_failed {
      CheckStatus::Error
    } else if other_failed {
      CheckStatus::Warning
    } else {
      CheckStatus::Healthy
    };

    let total = passed + failed;
    Metrics::add(&self.metrics.checks_total, total as i64);
    Metrics::add(&self.metrics.checks_passed, passed as i64);
    Metrics::add(&self.metrics.checks_failed, failed as i64);

    CheckResponse {
      timestamp: Utc::now(),
      status,
      services,
      components,
      total_checks: total,
      passed_checks: passed,
      failed_checks: failed,
    }
  }

  pub async fn healthz(&self) -> HealthzResponse {
    let services = self.list_instances().await;
    let running = services
      .iter()
      .filter(|s| s.status == RunStatus::Running)
      .count() as i64;
    let errored = services
      .iter()
      .filter(|s| s.status == RunStatus::Error)
      .count() as i64;
    HealthzResponse {
      version: env!("CARGO_PKG_VERSION").to_string(),
      start_time: self.start_time,
      status: String::from("ok"),
      uptime: (Utc::now() - self.start_time).num_seconds()
        .max(0) as u64,
      metrics: self.metrics.export(running, errored),
    }
  }

  /// The document behind `share/.well-known.json` and
  /// `GET /known`.
  pub async fn well_known(&self) -> WellKnown {
    let supervisors = self.supervisors.read().await;
    let mut services = Vec::with_capacity(supervisors.len());
    for supervisor in supervisors.values() {
      let decl = supervisor.decl();
      let snapshot = supervisor.snapshot();
      services.push(WellKnownService {
        name: decl.name.clone(),
        version: snapshot
          .component
          .as_ref()
          .map(|record| record.version.clone())
          .unwrap_or_default(),
        installed: snapshot.component.is_some(),
        startup: decl.startup,
        status: snapshot.status,
        protocol: decl.protocol.clone(),
        port: snapshot.port,
        accessible: decl.accessible,
      });
    }
    WellKnown {
      logs: WellKnownLogs {
        dir: self
          .config
          .logs_dir()
          .to_string_lossy()
          .into_owned(),
        level: self.config.logging.level.to_string(),
      },
      services,
      endpoint: Some(WellKnownEndpoint {
        port: self.config.port,
      }),
    }
  }

  /// Ask the writer loop for a fresh well-known file.
  pub fn poke_well_known(&self) {
    self.notify.notify();
  }

  /// Parallel stop of the whole fleet with a per-service
  /// deadline.
  pub async fn stop_all(&self) {
    let supervisors = self.supervisors.read().await;
    let deadline = Duration::from_secs(
      self.config.graceful_stop_timeout_secs + 5,
    );
    let stops =
      supervisors.values().map(|supervisor| {
        let supervisor = supervisor.clone();
        async move {
          if tokio::time::timeout(
            deadline,
            supervisor.shutdown(),
          )
          .await
          .is_err()
          {
            error!(
              "Shutdown of {} missed its deadline",
              supervisor.name()
            );
          }
        }
      });
    join_all(stops).await;
  }

  /// Cancel in-flight work and stop every supervisor.
  pub async fn shutdown(&self) {
    self.shutdown.cancel();
    self.stop_all().await;
    self.notify.notify();
  }

  /// Clear transient state: cache contents and stale run files
  /// other than the live socket and port assignments.
  pub async fn clean(&self) -> KeeperResult<String> {
    let cache = self.config.cache_dir();
    let mut cleared = 0usize;
    if let Ok(mut entries) = tokio::fs::read_dir(&cache).await {
      while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let result = if path.is_dir() {
          tokio::fs::remove_dir_all(&path).await
        } else {
          tokio::fs::remove_file(&path).await
        };
        match result {
          Ok(()) => cleared += 1,
          Err(e) => warn!(
            "Failed to clear {} | {e:#}",
            path.display()
          ),
        }
      }
    }
    Ok(format!("cleared {cleared} cache entries"))
  }

  /// Gzip every current service log into `share/upload/` for the
  /// uploader to pick up.
  pub async fn bundle_logs(&self) -> KeeperResult<String> {
    use async_compression::tokio::write::GzipEncoder;
    use tokio::io::AsyncWriteExt;

    let out_dir = self.config.share_dir().join("upload");
    tokio::fs::create_dir_all(&out_dir)
      .await
      .map_err(|e| KeeperError::Fatal(e.into()))?;

    let mut bundled = 0usize;
    let logs_dir = self.config.logs_dir();
    let Ok(mut entries) = tokio::fs::read_dir(&logs_dir).await
    else {
      return Ok(String::from("no logs to bundle"));
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
      let path = entry.path();
      if path.extension().is_none_or(|ext| ext != "log") {
        continue;
      }
      let Ok(contents) = tokio::fs::read(&path).await else {
        continue;
      };
      let file_name = entry.file_name();
      let out_path = out_dir.join(format!(
        "{}.gz",
        file_name.to_string_lossy()
      ));
      let result = async {
        let out =
          tokio::fs::File::create(&out_path).await?;
        let mut encoder = GzipEncoder::new(out);
        encoder.write_all(&contents).await?;
        encoder.shutdown().await?;
        std::io::Result::Ok(())
      }
      .await;
      match result {
        Ok(()) => bundled += 1,
        Err(e) => warn!(
          "Failed to bundle {} | {e:#}",
          path.display()
        ),
      }
    }
    Ok(format!(
      "bundled {bundled} logs at {}",
      out_dir.display()
    ))
  }
}

/// How a reloaded declaration differs from the running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecChange {
  Unchanged,
  /// Command / args / probe changes apply with a restart on the
  /// same port.
  InPlace,
  /// Port or accessibility moved; the instance is rebuilt.
  Recreate,
}

pub fn classify_change(
  old: &ServiceDecl,
  new: &ServiceDecl,
) -> SpecChange {
  if old.port != new.port
    || old.accessible != new.accessible
    || old.component_name() != new.component_name()
  {
    return SpecChange::Recreate;
  }
  if old.command != new.command
    || old.args != new.args
    || old.health_path != new.health_path
    || old.startup != new.startup
    || old.protocol != new.protocol
    || old.metrics_path != new.metrics_path
  {
    return SpecChange::InPlace;
  }
  SpecChange::Unchanged
}

/// Resolve the system spec: explicit local file, then the
/// manifest url (caching a copy), then the last cached copy.
pub async fn load_spec(
  config: &KeeperConfig,
) -> anyhow::Result<SystemSpec> {
  if let Some(path) = &config.spec_path {
    let raw = tokio::fs::read_to_string(path)
      .await
      .with_context(|| {
        format!("Failed to read spec at {}", path.display())
      })?;
    return serde_json::from_str(&raw).with_context(|| {
      format!("Invalid spec file at {}", path.display())
    });
  }

  let url = config.resolved_spec_url();
  match fetch_spec(config, &url).await {
    Ok(spec) => {
      let cache = config.spec_cache_path();
      if let Some(parent) = cache.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
      }
      match serde_json::to_vec_pretty(&spec) {
        Ok(raw) => {
          if let Err(e) =
            tokio::fs::write(&cache, raw).await
          {
            warn!("Failed to cache spec | {e:#}");
          }
        }
        Err(e) => warn!("Failed to serialize spec | {e:#}"),
      }
      Ok(spec)
    }
    Err(e) => {
      warn!(
        "Spec fetch from {url} failed, trying cache | {e:#}"
      );
      let cache = config.spec_cache_path();
      let raw = tokio::fs::read_to_string(&cache)
        .await
        .map_err(|_| {
          anyhow!(
            "spec unreachable at {url} and no cached copy at {}",
            cache.display()
          )
        })?;
      serde_json::from_str(&raw)
        .context("cached spec is unreadable")
    }
  }
}

async fn fetch_spec(
  config: &KeeperConfig,
  url: &str,
) -> anyhow::Result<SystemSpec> {
  let client = reqwest::Client::builder()
    .timeout(Duration::from_secs(
      config.download_timeout_secs,
    ))
    .build()
    .context("Failed to build spec http client")?;
  let mut req = client.get(url);
  if let Some(token) = config.read_token() {
    req = req.bearer_auth(token);
  }
  let res = req
    .send()
    .await
    .and_then(|res| res.error_for_status())
    .with_context(|| format!("GET {url} failed"))?;
  res
    .json::<SystemSpec>()
    .await
    .with_context(|| format!("Invalid spec at {url}"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use keeper_client::entities::Accessibility;

  fn service(name: &str, port: u16) -> ServiceDecl {
    ServiceDecl {
      name: name.to_string(),
      component: name.to_string(),
      startup: StartupMode::Always,
      command: name.to_string(),
      args: vec![],
      protocol: String::from("http"),
      port,
      metrics_path: String::new(),
      health_path: String::new(),
      accessible: Accessibility::Local,
    }
  }

  #[test]
  fn identical_decls_are_unchanged() {
    let a = service("svc-a", 8080);
    assert_eq!(
      classify_change(&a, &a.clone()),
      SpecChange::Unchanged
    );
  }

  #[test]
  fn arg_change_is_in_place() {
    let a = service("svc-a", 8080);
    let mut b = a.clone();
    b.args.push(String::from("--verbose"));
    assert_eq!(classify_change(&a, &b), SpecChange::InPlace);
  }

  #[test]
  fn port_change_recreates() {
    let a = service("svc-a", 8080);
    let mut b = a.clone();
    b.port = 8090;
    assert_eq!(classify_change(&a, &b), SpecChange::Recreate);
  }

  #[test]
  fn accessibility_change_recreates() {
    let a = service("svc-a", 8080);
    let mut b = a.clone();
    b.accessible = Accessibility::Remote;
    assert_eq!(classify_change(&a, &b), SpecChange::Recreate);
  }

  #[tokio::test]
  async fn load_spec_prefers_local_file() {
    let dir = tempfile::tempdir().unwrap();
    let spec_path = dir.path().join("spec.json");
    let spec = serde_json::json!({
      "platform": "linux",
      "arch": "amd64",
      "version": "2025.07.01",
      "keeper": { "name": "costrict-keeper", "version": "^1.0.0" },
      "components": [
        { "name": "svc-a", "version": "^1.0.0" }
      ],
      "services": [
        { "name": "svc-a", "command": "svc-a", "port": 8080 }
      ]
    });
    tokio::fs::write(
      &spec_path,
      serde_json::to_vec(&spec).unwrap(),
    )
    .await
    .unwrap();
    let config = KeeperConfig {
      root_directory: dir.path().to_path_buf(),
      spec_path: Some(spec_path),
      ..Default::default()
    };
    let spec = load_spec(&config).await.unwrap();
    spec.validate().unwrap();
    assert_eq!(spec.services[0].name, "svc-a");
    assert_eq!(spec.format_version, "v1");
  }
}
