//! Hands out local TCP ports to services and tunnels from a bounded
//! pool. Assignments are name keyed, survive restarts through a
//! small JSON state file, and are verified with a real bind test
//! before being handed out.

use std::{
  collections::BTreeMap,
  net::{Ipv4Addr, TcpListener},
  path::PathBuf,
  sync::Mutex,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PortError {
  #[error("port pool exhausted ({min}-{max})")]
  Exhausted { min: u16, max: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSnapshot {
  pub min: u16,
  pub max: u16,
  pub allocated: Vec<PortBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBinding {
  pub name: String,
  pub port: u16,
}

/// Persisted shape of the allocation state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PortState {
  #[serde(default)]
  assigned: BTreeMap<String, u16>,
}

pub struct PortAllocator {
  min: u16,
  max: u16,
  state_path: PathBuf,
  /// All mutation happens under this lock, bind tests included,
  /// so two concurrent acquires cannot race on one candidate.
  inner: Mutex<PortState>,
}

impl PortAllocator {
  /// Rehydrate bindings from the state file. An entry whose port
  /// is no longer free is discarded, the owner re-acquires later.
  pub fn load(min: u16, max: u16, state_path: PathBuf) -> PortAllocator {
    let mut state = read_state(&state_path);
    state.assigned.retain(|name, port| {
      let keep =
        (min..=max).contains(port) && port_is_free(*port);
      if !keep {
        tracing::info!(
          "Dropping stale port binding {name} -> {port}"
        );
      }
      keep
    });
    let allocator = PortAllocator {
      min,
      max,
      state_path,
      inner: Mutex::new(state),
    };
    allocator.persist();
    allocator
  }

  /// Returns `preferred` when it is in range, unassigned (or
  /// assigned to `name` itself), and passes a bind test. Otherwise
  /// scans deterministically from the bottom of the range.
  pub fn acquire(
    &self,
    name: &str,
    preferred: u16,
  ) -> Result<u16, PortError> {
    let mut inner = lock(&self.inner);
    if self.usable(&inner, name, preferred)
      && port_is_free(preferred)
    {
      inner.assigned.insert(name.to_string(), preferred);
      drop(inner);
      self.persist();
      return Ok(preferred);
    }
    for candidate in self.min..=self.max {
      if candidate != preferred
        && self.usable(&inner, name, candidate)
        && port_is_free(candidate)
      {
        inner.assigned.insert(name.to_string(), candidate);
        drop(inner);
        self.persist();
        return Ok(candidate);
      }
    }
    Err(PortError::Exhausted {
      min: self.min,
      max: self.max,
    })
  }

  pub fn release(&self, name: &str) {
    let removed = lock(&self.inner).assigned.remove(name);
    if removed.is_some() {
      self.persist();
    }
  }

  /// Current binding for `name`, if any.
  pub fn get(&self, name: &str) -> Option<u16> {
    lock(&self.inner).assigned.get(name).copied()
  }

  pub fn snapshot(&self) -> PortSnapshot {
    let inner = lock(&self.inner);
    PortSnapshot {
      min: self.min,
      max: self.max,
      allocated: inner
        .assigned
        .iter()
        .map(|(name, port)| PortBinding {
          name: name.clone(),
          port: *port,
        })
        .collect(),
    }
  }

  fn usable(
    &self,
    state: &PortState,
    name: &str,
    port: u16,
  ) -> bool {
    if !(self.min..=self.max).contains(&port) {
      return false;
    }
    state
      .assigned
      .iter()
      .all(|(owner, assigned)| owner == name || *assigned != port)
  }

  fn persist(&self) {
    let state = {
      let inner = lock(&self.inner);
      match serde_json::to_vec_pretty(&*inner) {
        Ok(state) => state,
        Err(e) => {
          tracing::error!(
            "Failed to serialize port state | {e:#}"
          );
          return;
        }
      }
    };
    if let Err(e) = write_atomic(&self.state_path, &state) {
      tracing::warn!(
        "Failed to persist port state to {} | {e:#}",
        self.state_path.display()
      );
    }
  }
}

fn lock(
  inner: &Mutex<PortState>,
) -> std::sync::MutexGuard<'_, PortState> {
  // The lock is never held across unwind points.
  inner.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn port_is_free(port: u16) -> bool {
  TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn read_state(path: &PathBuf) -> PortState {
  let Ok(raw) = std::fs::read_to_string(path) else {
    return PortState::default();
  };
  serde_json::from_str(&raw)
    .inspect_err(|e| {
      tracing::warn!(
        "Unreadable port state at {} | {e:#}",
        path.display()
      )
    })
    .unwrap_or_default()
}

fn write_atomic(
  path: &PathBuf,
  contents: &[u8],
) -> anyhow::Result<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).with_context(|| {
      format!("Failed to create {}", parent.display())
    })?;
  }
  let tmp = path.with_extension("json.tmp");
  std::fs::write(&tmp, contents)
    .with_context(|| format!("Failed to write {}", tmp.display()))?;
  std::fs::rename(&tmp, path).with_context(|| {
    format!("Failed to move state into {}", path.display())
  })?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scratch() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ports.json");
    (dir, path)
  }

  /// An OS assigned listener anchors the test range so fixed port
  /// collisions with the host cannot flake the suite.
  fn anchored_range() -> (TcpListener, u16) {
    let listener =
      TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
  }

  #[test]
  fn preferred_port_wins_when_free() {
    let (listener, base) = anchored_range();
    drop(listener);
    let (_dir, path) = scratch();
    let allocator = PortAllocator::load(base, base + 20, path);
    let port = allocator.acquire("svc-a", base + 3).unwrap();
    assert_eq!(port, base + 3);
  }

  #[test]
  fn occupied_preferred_falls_back_to_scan() {
    let (listener, base) = anchored_range();
    let (_dir, path) = scratch();
    let allocator = PortAllocator::load(base, base + 20, path);
    // `base` is still bound by the anchor listener.
    let port = allocator.acquire("svc-a", base).unwrap();
    assert_ne!(port, base);
    assert!((base..=base + 20).contains(&port));
    drop(listener);
  }

  #[test]
  fn same_name_reacquires_same_port() {
    let (listener, base) = anchored_range();
    drop(listener);
    let (_dir, path) = scratch();
    let allocator = PortAllocator::load(base, base + 20, path);
    let first = allocator.acquire("svc-a", base + 1).unwrap();
    let second = allocator.acquire("svc-a", first).unwrap();
    assert_eq!(first, second);
  }

  #[test]
  fn two_names_never_share_a_port() {
    let (listener, base) = anchored_range();
    drop(listener);
    let (_dir, path) = scratch();
    let allocator = PortAllocator::load(base, base + 20, path);
    let a = allocator.acquire("svc-a", base + 1).unwrap();
    let b = allocator.acquire("svc-b", base + 1).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn release_frees_the_binding() {
    let (listener, base) = anchored_range();
    drop(listener);
    let (_dir, path) = scratch();
    let allocator = PortAllocator::load(base, base + 20, path);
    let a = allocator.acquire("svc-a", base + 1).unwrap();
    allocator.release("svc-a");
    assert_eq!(allocator.get("svc-a"), None);
    let b = allocator.acquire("svc-b", a).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn exhausted_pool_errors() {
    let (listener, base) = anchored_range();
    drop(listener);
    let (_dir, path) = scratch();
    let allocator = PortAllocator::load(base, base + 1, path);
    allocator.acquire("svc-a", base).unwrap();
    allocator.acquire("svc-b", base).unwrap();
    let err = allocator.acquire("svc-c", base).unwrap_err();
    assert!(matches!(err, PortError::Exhausted { .. }));
  }

  #[test]
  fn state_survives_reload() {
    let (listener, base) = anchored_range();
    drop(listener);
    let (_dir, path) = scratch();
    let first = {
      let allocator =
        PortAllocator::load(base, base + 20, path.clone());
      allocator.acquire("svc-a", base + 4).unwrap()
    };
    let allocator = PortAllocator::load(base, base + 20, path);
    assert_eq!(allocator.get("svc-a"), Some(first));
  }

  #[test]
  fn busy_port_dropped_on_reload() {
    let (listener, base) = anchored_range();
    drop(listener);
    let (_dir, path) = scratch();
    {
      let allocator =
        PortAllocator::load(base, base + 20, path.clone());
      allocator.acquire("svc-a", base + 2).unwrap();
    }
    // Occupy the persisted port before rehydration.
    let squatter =
      TcpListener::bind((Ipv4Addr::LOCALHOST, base + 2)).unwrap();
    let allocator = PortAllocator::load(base, base + 20, path);
    assert_eq!(allocator.get("svc-a"), None);
    drop(squatter);
  }

  #[test]
  fn snapshot_reports_range_and_bindings() {
    let (listener, base) = anchored_range();
    drop(listener);
    let (_dir, path) = scratch();
    let allocator = PortAllocator::load(base, base + 20, path);
    allocator.acquire("svc-a", base + 1).unwrap();
    let snapshot = allocator.snapshot();
    assert_eq!(snapshot.min, base);
    assert_eq!(snapshot.max, base + 20);
    assert_eq!(snapshot.allocated.len(), 1);
    assert_eq!(snapshot.allocated[0].name, "svc-a");
  }
}
