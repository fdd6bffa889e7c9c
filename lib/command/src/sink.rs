use std::{
  path::PathBuf,
  sync::atomic::{AtomicU64, Ordering},
};

use tokio::{
  fs::{File, OpenOptions},
  io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
  sync::Mutex,
};

/// Append-only log file for one child's stdout + stderr, rotated
/// in place once it grows past `max_bytes`. One `.old` generation
/// is kept.
pub struct LogSink {
  path: PathBuf,
  max_bytes: u64,
  written: AtomicU64,
  file: Mutex<Option<File>>,
}

impl LogSink {
  pub fn new(path: PathBuf, max_bytes: u64) -> LogSink {
    let written = std::fs::metadata(&path)
      .map(|meta| meta.len())
      .unwrap_or(0);
    LogSink {
      path,
      max_bytes,
      written: AtomicU64::new(written),
      file: Mutex::new(None),
    }
  }

  pub fn path(&self) -> &PathBuf {
    &self.path
  }

  pub async fn write_line(&self, line: &str) {
    let mut guard = self.file.lock().await;
    if self.written.load(Ordering::Relaxed)
      >= self.max_bytes
    {
      *guard = None;
      let old = self.path.with_extension("log.old");
      if let Err(e) =
        tokio::fs::rename(&self.path, &old).await
      {
        tracing::warn!(
          "Failed to rotate {} | {e:#}",
          self.path.display()
        );
      }
      self.written.store(0, Ordering::Relaxed);
    }
    if guard.is_none() {
      match self.open().await {
        Ok(file) => *guard = Some(file),
        Err(e) => {
          tracing::warn!(
            "Failed to open log sink {} | {e:#}",
            self.path.display()
          );
          return;
        }
      }
    }
    if let Some(file) = guard.as_mut() {
      let written = async {
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await
      }
      .await;
      match written {
        Ok(()) => {
          self.written.fetch_add(
            line.len() as u64 + 1,
            Ordering::Relaxed,
          );
        }
        Err(e) => {
          tracing::warn!(
            "Failed to write log sink {} | {e:#}",
            self.path.display()
          );
          *guard = None;
        }
      }
    }
  }

  async fn open(&self) -> std::io::Result<File> {
    if let Some(parent) = self.path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .await
  }
}

/// Copy lines from a child pipe into the sink until EOF.
pub async fn pipe_lines(
  sink: std::sync::Arc<LogSink>,
  reader: impl AsyncRead + Unpin,
) {
  let mut lines = BufReader::new(reader).lines();
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => sink.write_line(&line).await,
      Ok(None) => break,
      Err(e) => {
        tracing::debug!("Child pipe read failed | {e:#}");
        break;
      }
    }
  }
}
