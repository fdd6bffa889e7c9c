use std::time::Duration;

/// One HTTP liveness probe against a local service:
/// `GET http://127.0.0.1:<port><path>`, healthy on any 2xx within
/// the timeout.
pub async fn probe_http(
  port: u16,
  path: &str,
  timeout: Duration,
) -> bool {
  let path = if path.starts_with('/') {
    path.to_string()
  } else {
    format!("/{path}")
  };
  let url = format!("http://127.0.0.1:{port}{path}");
  let client = match reqwest::Client::builder()
    .timeout(timeout)
    .build()
  {
    Ok(client) => client,
    Err(e) => {
      error!("Failed to build health probe client | {e:#}");
      return false;
    }
  };
  match client.get(&url).send().await {
    Ok(res) => res.status().is_success(),
    Err(e) => {
      debug!("Health probe {url} failed | {e:#}");
      false
    }
  }
}

/// Plain TCP reachability, used for tunnel mapping ports on the
/// gateway.
pub async fn probe_tcp(
  addr: &str,
  timeout: Duration,
) -> bool {
  matches!(
    tokio::time::timeout(
      timeout,
      tokio::net::TcpStream::connect(addr)
    )
    .await,
    Ok(Ok(_))
  )
}

/// Tracks consecutive probe outcomes: `fail_threshold` consecutive
/// failures flip unhealthy, a single success flips back.
#[derive(Debug)]
pub struct HealthTracker {
  fail_threshold: u32,
  consecutive_failures: u32,
  healthy: bool,
  /// Whether any probe has succeeded since the last (re)start.
  pub ever_healthy: bool,
}

impl HealthTracker {
  pub fn new(fail_threshold: u32) -> HealthTracker {
    HealthTracker {
      fail_threshold,
      consecutive_failures: 0,
      healthy: false,
      ever_healthy: false,
    }
  }

  /// Record one probe outcome. Returns true when this probe
  /// crossed the failure threshold (edge, not level).
  pub fn record(&mut self, success: bool) -> bool {
    if success {
      self.consecutive_failures = 0;
      self.healthy = true;
      self.ever_healthy = true;
      return false;
    }
    self.consecutive_failures += 1;
    if self.consecutive_failures == self.fail_threshold {
      self.healthy = false;
      return true;
    }
    if self.consecutive_failures > self.fail_threshold {
      self.healthy = false;
    }
    false
  }

  pub fn healthy(&self) -> bool {
    self.healthy
  }

  pub fn reset(&mut self) {
    self.consecutive_failures = 0;
    self.healthy = false;
    self.ever_healthy = false;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn threshold_edge_fires_once() {
    let mut tracker = HealthTracker::new(3);
    assert!(!tracker.record(false));
    assert!(!tracker.record(false));
    assert!(tracker.record(false));
    assert!(!tracker.record(false));
    assert!(!tracker.healthy());
  }

  #[test]
  fn one_success_recovers() {
    let mut tracker = HealthTracker::new(2);
    tracker.record(false);
    tracker.record(false);
    assert!(!tracker.healthy());
    tracker.record(true);
    assert!(tracker.healthy());
    assert!(tracker.ever_healthy);
  }

  #[tokio::test]
  async fn tcp_probe_hits_live_listener() {
    let listener =
      tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    assert!(
      probe_tcp(&addr.to_string(), Duration::from_secs(1)).await
    );
    drop(listener);
  }
}
