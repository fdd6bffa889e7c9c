use std::{sync::Arc, time::Duration};

use async_timing_util::{Timelength, wait_until_timelength};
use chrono::{Local, NaiveTime, TimeZone};
use keeper_client::entities::{RunStatus, StartupMode};
use tokio::sync::mpsc;

use crate::{
  installer::InstallOutcome, wellknown::write_atomic,
};

use super::Coordinator;

/// Spawn the coordinator's background loops: the well-known
/// writer, the five minute slow-restart reconciler, the midnight
/// rooster upgrade pass and the health sweep.
pub fn spawn_all(
  coordinator: Arc<Coordinator>,
  notify_rx: mpsc::Receiver<()>,
) {
  tokio::spawn(writer_loop(coordinator.clone(), notify_rx));
  tokio::spawn(slow_reconciler_loop(coordinator.clone()));
  tokio::spawn(rooster_loop(coordinator.clone()));
  tokio::spawn(health_sweep_loop(coordinator));
}

/// Rewrites `share/.well-known.json` on fleet transitions,
/// debounced to at most one write per second.
async fn writer_loop(
  coordinator: Arc<Coordinator>,
  mut notify_rx: mpsc::Receiver<()>,
) {
  let shutdown = coordinator.shutdown_token();
  let path = coordinator.config.well_known_path();
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => {
        // One last write so the IDE sees the final states.
        let doc = coordinator.well_known().await;
        if let Err(e) = write_atomic(&path, &doc).await {
          warn!("Final well-known write failed | {e:#}");
        }
        break;
      }
      msg = notify_rx.recv() => {
        if msg.is_none() {
          break;
        }
      }
    }
    let doc = coordinator.well_known().await;
    if let Err(e) = write_atomic(&path, &doc).await {
      warn!(
        "Failed to write {} | {e:#}",
        path.display()
      );
    }
    // Debounce window; notifications landing meanwhile collapse
    // into the single buffered slot.
    tokio::time::sleep(Duration::from_secs(1)).await;
  }
}

/// Every five minutes, hand services parked on a spent restart
/// budget a fresh one and a single retry.
async fn slow_reconciler_loop(coordinator: Arc<Coordinator>) {
  let shutdown = coordinator.shutdown_token();
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = wait_until_timelength(
        Timelength::FiveMinutes, 0
      ) => {}
    }
    let spec = coordinator.spec();
    for instance in coordinator.list_instances().await {
      let startup = spec
        .service(&instance.name)
        .map(|decl| decl.startup)
        .unwrap_or(StartupMode::None);
      if startup != StartupMode::Always {
        continue;
      }
      if matches!(
        instance.status,
        RunStatus::Error | RunStatus::Exited
      ) && let Ok(supervisor) =
        coordinator.get_supervisor(&instance.name).await
      {
        supervisor.retry_budget();
      }
    }
  }
}

/// The midnight rooster: once per scheduled off-hours window,
/// reconcile every declared component with `mode=auto` and apply
/// coalesced restarts. The loop wakes every minute and compares
/// the wall clock against the target rather than sleeping the
/// whole gap: a monotonic timer does not advance while the
/// machine is suspended, so a missed window must be caught by
/// wall-clock comparison on the first wake after resume.
async fn rooster_loop(coordinator: Arc<Coordinator>) {
  let shutdown = coordinator.shutdown_token();
  let config = coordinator.config.clone();
  let mut target = next_local_window(
    config.upgrade_hour,
    config.upgrade_minute,
  );
  info!("Next upgrade window at {target}");
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = wait_until_timelength(Timelength::OneMinute, 0) => {}
    }
    if Local::now() < target {
      continue;
    }
    upgrade_pass(&coordinator).await;
    target = next_local_window(
      config.upgrade_hour,
      config.upgrade_minute,
    );
    info!("Next upgrade window at {target}");
  }
}

/// One reconciliation pass over the current spec. Upgrades are
/// coalesced: affected services stop in reverse declaration
/// order, every binary swaps, then they start again in forward
/// order.
pub async fn upgrade_pass(coordinator: &Coordinator) {
  let spec = coordinator.spec();
  info!(
    "Upgrade pass over {} components",
    spec.components.len()
  );

  let mut upgraded = Vec::new();
  for decl in &spec.components {
    match coordinator.installer.ensure(decl, false).await {
      Ok(InstallOutcome::AlreadyCurrent(_)) => {}
      Ok(outcome) => {
        info!(
          "Component {} upgraded to v{}",
          decl.name,
          outcome.version()
        );
        upgraded.push(decl.clone());
      }
      // Logged and retried on the next wake.
      Err(e) => {
        warn!(
          "Upgrade of {} failed, retrying next window | {e:#}",
          decl.name
        );
      }
    }
  }

  for decl in &upgraded {
    coordinator.bounce_component_services(decl).await;
    crate::metrics::Metrics::bump(
      &coordinator.metrics.upgrades_applied,
    );
  }

  // The keeper's own upgrade only lands on relaunch.
  match coordinator.installer.ensure(&spec.keeper, false).await
  {
    Ok(InstallOutcome::AlreadyCurrent(_)) | Err(_) => {}
    Ok(outcome) => {
      info!(
        "Keeper v{} staged, applies on next launch",
        outcome.version()
      );
    }
  }
}

/// Periodic freshness for the well-known file even without
/// transitions.
async fn health_sweep_loop(coordinator: Arc<Coordinator>) {
  let shutdown = coordinator.shutdown_token();
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = wait_until_timelength(Timelength::OneMinute, 0) => {}
    }
    coordinator.poke_well_known();
  }
}

/// Next local occurrence of `hour:minute`, strictly in the
/// future. If the time already passed today, the next window is
/// tomorrow.
fn next_local_window(
  hour: u32,
  minute: u32,
) -> chrono::DateTime<Local> {
  let now = Local::now();
  let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0)
  else {
    // Bad config values fall back to one day out.
    return now + chrono::Duration::days(1);
  };
  let mut target = now.date_naive().and_time(time);
  if target <= now.naive_local() {
    target += chrono::Duration::days(1);
  }
  match Local.from_local_datetime(&target).earliest() {
    Some(target) => target,
    // Nonexistent local time (DST gap): try again in an hour.
    None => now + chrono::Duration::hours(1),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn next_window_is_in_the_future_within_a_day() {
    let now = Local::now();
    let target = next_local_window(3, 30);
    assert!(target > now);
    assert!(target <= now + chrono::Duration::days(1));
  }

  #[test]
  fn bad_time_values_fall_back_a_day() {
    let now = Local::now();
    let target = next_local_window(99, 99);
    assert!(target > now);
    assert!(target <= now + chrono::Duration::days(1));
  }
}
