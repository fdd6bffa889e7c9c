use std::path::{Path, PathBuf};

use anyhow::Context;
use keeper_client::entities::ComponentRecord;

pub fn record_path(package_dir: &Path, name: &str) -> PathBuf {
  package_dir.join(format!("{name}.json"))
}

pub async fn read(
  package_dir: &Path,
  name: &str,
) -> Option<ComponentRecord> {
  let path = record_path(package_dir, name);
  let raw = tokio::fs::read_to_string(&path).await.ok()?;
  serde_json::from_str(&raw)
    .inspect_err(|e| {
      warn!(
        "Unreadable install record at {} | {e:#}",
        path.display()
      )
    })
    .ok()
}

pub async fn write(
  package_dir: &Path,
  record: &ComponentRecord,
) -> anyhow::Result<()> {
  tokio::fs::create_dir_all(package_dir)
    .await
    .with_context(|| {
      format!("Failed to create {}", package_dir.display())
    })?;
  let path = record_path(package_dir, &record.name);
  let tmp = path.with_extension("json.tmp");
  let raw = serde_json::to_vec_pretty(record)
    .context("Failed to serialize install record")?;
  tokio::fs::write(&tmp, raw).await.with_context(|| {
    format!("Failed to write {}", tmp.display())
  })?;
  tokio::fs::rename(&tmp, &path).await.with_context(|| {
    format!("Failed to move record into {}", path.display())
  })?;
  Ok(())
}

pub async fn remove(
  package_dir: &Path,
  name: &str,
) -> anyhow::Result<()> {
  let path = record_path(package_dir, name);
  match tokio::fs::remove_file(&path).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e).with_context(|| {
      format!("Failed to remove {}", path.display())
    }),
  }
}

pub async fn list(package_dir: &Path) -> Vec<ComponentRecord> {
  let Ok(mut entries) =
    tokio::fs::read_dir(package_dir).await
  else {
    return Vec::new();
  };
  let mut records = Vec::new();
  while let Ok(Some(entry)) = entries.next_entry().await {
    let path = entry.path();
    if path.extension().is_none_or(|ext| ext != "json") {
      continue;
    }
    let Ok(raw) = tokio::fs::read_to_string(&path).await else {
      continue;
    };
    match serde_json::from_str::<ComponentRecord>(&raw) {
      Ok(record) => records.push(record),
      Err(e) => {
        warn!(
          "Skipping unreadable record {} | {e:#}",
          path.display()
        );
      }
    }
  }
  records.sort_by(|a, b| a.name.cmp(&b.name));
  records
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use keeper_client::entities::ComponentDecl;

  fn record(name: &str) -> ComponentRecord {
    ComponentRecord {
      name: name.to_string(),
      version: String::from("1.0.0"),
      path: PathBuf::from(format!("/tmp/bin/{name}")),
      size: 42,
      modified_at: Utc::now(),
      url: String::from("https://x/pkg"),
      declared: ComponentDecl {
        name: name.to_string(),
        version: String::from("^1.0.0"),
        upgrade: Default::default(),
      },
    }
  }

  #[tokio::test]
  async fn round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let original = record("svc-a");
    write(dir.path(), &original).await.unwrap();
    let loaded = read(dir.path(), "svc-a").await.unwrap();
    assert_eq!(loaded, original);
  }

  #[tokio::test]
  async fn missing_record_is_none() {
    let dir = tempfile::tempdir().unwrap();
    assert!(read(dir.path(), "absent").await.is_none());
  }

  #[tokio::test]
  async fn list_skips_garbage() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), &record("svc-a")).await.unwrap();
    write(dir.path(), &record("svc-b")).await.unwrap();
    tokio::fs::write(dir.path().join("junk.json"), "{nope")
      .await
      .unwrap();
    let records = list(dir.path()).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name, "svc-a");
  }

  #[tokio::test]
  async fn remove_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), &record("svc-a")).await.unwrap();
    remove(dir.path(), "svc-a").await.unwrap();
    remove(dir.path(), "svc-a").await.unwrap();
    assert!(read(dir.path(), "svc-a").await.is_none());
  }
}
