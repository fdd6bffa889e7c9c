use std::sync::atomic::{AtomicI64, Ordering};

use indexmap::IndexMap;

/// Gauge-style counters surfaced in `/healthz` and the `metrics`
/// CLI subcommand.
#[derive(Debug, Default)]
pub struct Metrics {
  pub restarts_total: AtomicI64,
  pub upgrades_applied: AtomicI64,
  pub checks_total: AtomicI64,
  pub checks_passed: AtomicI64,
  pub checks_failed: AtomicI64,
  pub reloads_total: AtomicI64,
}

impl Metrics {
  pub fn bump(counter: &AtomicI64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn add(counter: &AtomicI64, amount: i64) {
    counter.fetch_add(amount, Ordering::Relaxed);
  }

  pub fn export(
    &self,
    services_running: i64,
    services_error: i64,
  ) -> IndexMap<String, i64> {
    let mut map = IndexMap::new();
    map.insert(
      String::from("services_running"),
      services_running,
    );
    map.insert(String::from("services_error"), services_error);
    map.insert(
      String::from("restarts_total"),
      self.restarts_total.load(Ordering::Relaxed),
    );
    map.insert(
      String::from("upgrades_applied"),
      self.upgrades_applied.load(Ordering::Relaxed),
    );
    map.insert(
      String::from("checks_total"),
      self.checks_total.load(Ordering::Relaxed),
    );
    map.insert(
      String::from("checks_passed"),
      self.checks_passed.load(Ordering::Relaxed),
    );
    map.insert(
      String::from("checks_failed"),
      self.checks_failed.load(Ordering::Relaxed),
    );
    map.insert(
      String::from("reloads_total"),
      self.reloads_total.load(Ordering::Relaxed),
    );
    map
  }
}
