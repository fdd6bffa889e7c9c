use std::path::Path;

use anyhow::Context;
use keeper_client::entities::WellKnown;
use tokio::sync::mpsc;

/// Handed to every supervisor so state transitions can poke the
/// writer loop. Lossy by design: one pending wakeup is enough.
pub struct WellKnownNotify {
  tx: mpsc::Sender<()>,
}

impl WellKnownNotify {
  pub fn channel() -> (WellKnownNotify, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (WellKnownNotify { tx }, rx)
  }

  pub fn notify(&self) {
    let _ = self.tx.try_send(());
  }
}

/// Write the document atomically: temp file beside the target,
/// then rename, so the IDE never reads a half written file.
pub async fn write_atomic(
  path: &Path,
  well_known: &WellKnown,
) -> anyhow::Result<()> {
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .with_context(|| {
        format!("Failed to create {}", parent.display())
      })?;
  }
  let raw = serde_json::to_vec_pretty(well_known)
    .context("Failed to serialize well-known document")?;
  let tmp = path.with_extension("json.tmp");
  tokio::fs::write(&tmp, raw).await.with_context(|| {
    format!("Failed to write {}", tmp.display())
  })?;
  tokio::fs::rename(&tmp, path).await.with_context(|| {
    format!("Failed to move well-known into {}", path.display())
  })?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use keeper_client::entities::{WellKnownLogs, WellKnownService};
  use keeper_client::entities::{
    Accessibility, RunStatus, StartupMode,
  };

  #[tokio::test]
  async fn written_file_parses_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("share/.well-known.json");
    let doc = WellKnown {
      logs: WellKnownLogs {
        dir: String::from("/tmp/logs"),
        level: String::from("INFO"),
      },
      services: vec![WellKnownService {
        name: String::from("svc-a"),
        version: String::from("1.0.0"),
        installed: true,
        startup: StartupMode::Always,
        status: RunStatus::Running,
        protocol: String::from("http"),
        port: 8080,
        accessible: Accessibility::Local,
      }],
      endpoint: None,
    };
    write_atomic(&path, &doc).await.unwrap();
    let raw = tokio::fs::read_to_string(&path).await.unwrap();
    let parsed: WellKnown = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.services.len(), 1);
    assert_eq!(parsed.services[0].name, "svc-a");
    // No stray temp file once the rename landed.
    assert!(!path.with_extension("json.tmp").exists());
  }

  #[test]
  fn notify_is_lossy_and_non_blocking() {
    let (notify, mut rx) = WellKnownNotify::channel();
    notify.notify();
    notify.notify();
    notify.notify();
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
  }
}
