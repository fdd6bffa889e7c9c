//! Child process primitives for the keeper: [run_probe] for
//! short-lived helper invocations with captured output, and
//! [ChildProcess], the supervised long-lived child used by
//! services and tunnels.

use std::{
  ffi::OsStr,
  path::PathBuf,
  process::Stdio,
  sync::{Arc, Mutex},
  time::Duration,
};

use tokio::{process::Command, sync::mpsc};
use tokio_util::sync::CancellationToken;

mod output;
mod sink;

pub use output::*;
pub use sink::{LogSink, pipe_lines};

/// Run a short-lived probe (a version check, a tunnel
/// negotiation) to completion and capture its output. The probe
/// is killed once `within` elapses; a supervised child must never
/// hang the keeper on a stuck helper. Takes an explicit argv, no
/// shell is involved.
pub async fn run_probe<I>(
  program: impl AsRef<OsStr>,
  args: I,
  within: Duration,
) -> ProbeOutput
where
  I: IntoIterator,
  I::Item: AsRef<OsStr>,
{
  let mut cmd = Command::new(program);
  cmd
    .args(args)
    .kill_on_drop(true)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  match tokio::time::timeout(within, cmd.output()).await {
    Ok(output) => ProbeOutput::from(output),
    // Dropping the output future reaps the child via
    // kill_on_drop.
    Err(_) => ProbeOutput::from_err(std::io::Error::new(
      std::io::ErrorKind::TimedOut,
      format!("probe gave no result within {within:?}"),
    )),
  }
}

/// Everything needed to spawn one child.
#[derive(Debug, Clone, Default)]
pub struct ChildSpec {
  pub program: String,
  pub args: Vec<String>,
  pub cwd: Option<PathBuf>,
  pub envs: Vec<(String, String)>,
}

/// Emitted exactly once per spawn on the runner's exit channel.
#[derive(Debug, Clone)]
pub struct ExitEvent {
  pub pid: u32,
  pub code: Option<i32>,
  /// "exit code: …", "signal: …" or "wait error: …".
  pub reason: String,
}

impl ExitEvent {
  pub fn clean(&self) -> bool {
    self.code == Some(0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
  #[error("child is already running")]
  AlreadyRunning,
  #[error("failed to spawn child: {0}")]
  Spawn(#[from] std::io::Error),
}

const DEFAULT_GRACE: Duration = Duration::from_secs(10);

struct Running {
  pid: u32,
  stop: CancellationToken,
  done: CancellationToken,
  grace: Arc<Mutex<Duration>>,
}

/// Owns at most one OS child. `start` twice without a `stop` is
/// refused; the exit channel receives one event per spawn, after
/// the internal slot is cleared, so a receiver observing the event
/// may immediately start again.
pub struct ChildProcess {
  name: String,
  sink: Arc<LogSink>,
  exit_tx: mpsc::Sender<ExitEvent>,
  inner: Arc<Mutex<Option<Running>>>,
}

impl ChildProcess {
  pub fn new(
    name: impl Into<String>,
    log_path: PathBuf,
    log_max_bytes: u64,
  ) -> (ChildProcess, mpsc::Receiver<ExitEvent>) {
    let (exit_tx, exit_rx) = mpsc::channel(8);
    (
      ChildProcess {
        name: name.into(),
        sink: Arc::new(LogSink::new(log_path, log_max_bytes)),
        exit_tx,
        inner: Default::default(),
      },
      exit_rx,
    )
  }

  /// Spawn the child and return its pid without waiting.
  pub fn start(&self, spec: &ChildSpec) -> Result<u32, StartError> {
    let mut slot = lock(&self.inner);
    if slot.is_some() {
      return Err(StartError::AlreadyRunning);
    }

    let mut cmd = Command::new(&spec.program);
    cmd
      .args(&spec.args)
      .kill_on_drop(true)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
      cmd.current_dir(cwd);
    }
    for (key, val) in &spec.envs {
      cmd.env(key, val);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or_default();

    if let Some(stdout) = child.stdout.take() {
      tokio::spawn(pipe_lines(self.sink.clone(), stdout));
    }
    if let Some(stderr) = child.stderr.take() {
      tokio::spawn(pipe_lines(self.sink.clone(), stderr));
    }

    let stop = CancellationToken::new();
    let done = CancellationToken::new();
    let grace = Arc::new(Mutex::new(DEFAULT_GRACE));

    tokio::spawn(wait_on_child(
      self.name.clone(),
      child,
      pid,
      stop.clone(),
      done.clone(),
      grace.clone(),
      self.inner.clone(),
      self.exit_tx.clone(),
    ));

    *slot = Some(Running {
      pid,
      stop,
      done,
      grace,
    });
    Ok(pid)
  }

  /// Politely terminate the child, escalating to SIGKILL after
  /// `graceful`. Waits for the exit to be fully processed.
  /// Idempotent on already dead children.
  pub async fn stop(&self, graceful: Duration) {
    let running = {
      let slot = lock(&self.inner);
      slot.as_ref().map(|running| {
        (
          running.stop.clone(),
          running.done.clone(),
          running.grace.clone(),
        )
      })
    };
    let Some((stop, done, grace)) = running else {
      return;
    };
    *lock_plain(&grace) = graceful;
    stop.cancel();
    done.cancelled().await;
  }

  /// Fast liveness probe from the OS pid table, independent of
  /// the exit channel.
  pub fn is_alive(&self) -> bool {
    lock(&self.inner)
      .as_ref()
      .map(|running| pid_alive(running.pid))
      .unwrap_or(false)
  }

  /// Pid of the running child, 0 when there is none.
  pub fn pid(&self) -> u32 {
    lock(&self.inner)
      .as_ref()
      .map(|running| running.pid)
      .unwrap_or(0)
  }

  pub fn log_path(&self) -> &PathBuf {
    self.sink.path()
  }
}

#[allow(clippy::too_many_arguments)]
async fn wait_on_child(
  name: String,
  mut child: tokio::process::Child,
  pid: u32,
  stop: CancellationToken,
  done: CancellationToken,
  grace: Arc<Mutex<Duration>>,
  inner: Arc<Mutex<Option<Running>>>,
  exit_tx: mpsc::Sender<ExitEvent>,
) {
  let natural = tokio::select! {
    status = child.wait() => Some(status),
    _ = stop.cancelled() => None,
  };

  let (code, reason) = match natural {
    Some(status) => describe_exit(status),
    // Stop requested: SIGTERM, bounded wait, then SIGKILL.
    None => {
      let graceful = *lock_plain(&grace);
      signal_term(pid);
      match tokio::time::timeout(graceful, child.wait()).await {
        Ok(status) => describe_exit(status),
        Err(_) => {
          tracing::warn!(
            "Child {name} ({pid}) ignored SIGTERM for {graceful:?}, killing"
          );
          if let Err(e) = child.kill().await {
            tracing::error!(
              "Failed to kill child {name} ({pid}) | {e:#}"
            );
          }
          match child.wait().await {
            Ok(status) => describe_exit(Ok(status)),
            Err(e) => (None, format!("wait error: {e}")),
          }
        }
      }
    }
  };

  // Clear the slot before emitting so the receiver can restart
  // immediately on seeing the event. `done` fires last: a stop()
  // returning implies the exit event is already queued.
  lock(&inner).take();
  if exit_tx
    .send(ExitEvent { pid, code, reason })
    .await
    .is_err()
  {
    tracing::debug!("Exit channel for {name} closed, event dropped");
  }
  done.cancel();
}

fn describe_exit(
  status: std::io::Result<std::process::ExitStatus>,
) -> (Option<i32>, String) {
  match status {
    Ok(status) => {
      #[cfg(unix)]
      {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
          return (None, format!("signal: {signal}"));
        }
      }
      let code = status.code();
      (
        code,
        format!(
          "exit code: {}",
          code
            .map(|c| c.to_string())
            .unwrap_or_else(|| String::from("unknown"))
        ),
      )
    }
    Err(e) => (None, format!("wait error: {e}")),
  }
}

#[cfg(unix)]
fn signal_term(pid: u32) {
  use nix::{sys::signal, unistd::Pid};
  if pid == 0 {
    return;
  }
  if let Err(e) =
    signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGTERM)
  {
    tracing::debug!("SIGTERM to {pid} failed | {e}");
  }
}

#[cfg(not(unix))]
fn signal_term(_pid: u32) {}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
  use nix::unistd::Pid;
  if pid == 0 {
    return false;
  }
  nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(pid: u32) -> bool {
  pid != 0
}

fn lock(
  inner: &Mutex<Option<Running>>,
) -> std::sync::MutexGuard<'_, Option<Running>> {
  inner.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn lock_plain<T>(inner: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  inner.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sink_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("child.log")
  }

  #[tokio::test]
  async fn probe_captures_output() {
    let out = run_probe(
      "echo",
      ["hello"],
      Duration::from_secs(5),
    )
    .await;
    assert!(out.success);
    assert_eq!(out.stdout.trim(), "hello");
  }

  #[tokio::test]
  async fn stuck_probe_is_killed_at_the_deadline() {
    let out = run_probe(
      "sleep",
      ["5"],
      Duration::from_millis(200),
    )
    .await;
    assert!(!out.success);
    assert_eq!(out.code, None);
    assert!(out.stderr.contains("no result within"));
  }

  #[tokio::test]
  async fn exit_event_carries_code() {
    let dir = tempfile::tempdir().unwrap();
    let (child, mut exits) =
      ChildProcess::new("t", sink_path(&dir), 1 << 20);
    child
      .start(&ChildSpec {
        program: String::from("sh"),
        args: vec![
          String::from("-c"),
          String::from("echo out; exit 3"),
        ],
        ..Default::default()
      })
      .unwrap();
    let event = exits.recv().await.unwrap();
    assert_eq!(event.code, Some(3));
    assert_eq!(event.reason, "exit code: 3");
    assert!(!event.clean());
    // Slot cleared before the event was emitted.
    assert_eq!(child.pid(), 0);
  }

  #[tokio::test]
  async fn output_reaches_the_sink() {
    let dir = tempfile::tempdir().unwrap();
    let (child, mut exits) =
      ChildProcess::new("t", sink_path(&dir), 1 << 20);
    child
      .start(&ChildSpec {
        program: String::from("sh"),
        args: vec![
          String::from("-c"),
          String::from("echo to-the-log"),
        ],
        ..Default::default()
      })
      .unwrap();
    exits.recv().await.unwrap();
    // Pipe tasks race the exit event, give them a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let log =
      tokio::fs::read_to_string(sink_path(&dir)).await.unwrap();
    assert!(log.contains("to-the-log"));
  }

  #[tokio::test]
  async fn double_start_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (child, mut exits) =
      ChildProcess::new("t", sink_path(&dir), 1 << 20);
    let spec = ChildSpec {
      program: String::from("sleep"),
      args: vec![String::from("5")],
      ..Default::default()
    };
    child.start(&spec).unwrap();
    assert!(matches!(
      child.start(&spec),
      Err(StartError::AlreadyRunning)
    ));
    child.stop(Duration::from_secs(1)).await;
    let event = exits.recv().await.unwrap();
    assert!(event.reason.starts_with("signal:"));
  }

  #[tokio::test]
  async fn stop_is_idempotent_and_reports_liveness() {
    let dir = tempfile::tempdir().unwrap();
    let (child, mut exits) =
      ChildProcess::new("t", sink_path(&dir), 1 << 20);
    assert!(!child.is_alive());
    child.stop(Duration::from_secs(1)).await;
    child
      .start(&ChildSpec {
        program: String::from("sleep"),
        args: vec![String::from("5")],
        ..Default::default()
      })
      .unwrap();
    assert!(child.is_alive());
    child.stop(Duration::from_secs(1)).await;
    assert!(!child.is_alive());
    exits.recv().await.unwrap();
    // A second stop on the dead child returns immediately.
    child.stop(Duration::from_secs(1)).await;
  }
}
