use std::{
  path::{Path, PathBuf},
  sync::OnceLock,
};

use clap::{Parser, Subcommand};
use colored::Colorize;
use keeper_client::entities::{LogConfig, LogLevel};
use serde::Deserialize;

pub fn keeper_args() -> &'static CliArgs {
  static KEEPER_ARGS: OnceLock<CliArgs> = OnceLock::new();
  KEEPER_ARGS.get_or_init(CliArgs::parse)
}

pub fn keeper_config() -> &'static KeeperConfig {
  static KEEPER_CONFIG: OnceLock<KeeperConfig> = OnceLock::new();
  KEEPER_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse keeper environment");
    let args = keeper_args();

    let root = args
      .root
      .clone()
      .or(env.keeper_root_directory.clone())
      .unwrap_or_else(default_root);

    let config_path = args
      .config
      .clone()
      .or(env.keeper_config_path.clone())
      .unwrap_or_else(|| root.join("config.toml"));

    let mut config = match std::fs::read_to_string(&config_path) {
      Ok(raw) => toml::from_str::<KeeperConfig>(&raw)
        .expect("failed to parse keeper config file"),
      Err(_) => {
        println!(
          "{}: no config at {}, using defaults",
          "INFO".green(),
          config_path.display()
        );
        KeeperConfig::default()
      }
    };

    config.root_directory = root;
    if let Some(port) = env.keeper_port {
      config.port = port;
    }
    if let Some(base) = env.keeper_manifest_base_url {
      config.manifest_base_url = base;
    }
    if let Some(spec_url) = env.keeper_spec_url {
      config.spec_url = Some(spec_url);
    }
    if let Some(spec_path) = env.keeper_spec_path {
      config.spec_path = Some(spec_path);
    }
    if let Some(level) = args.log_level.or(env.keeper_log_level) {
      config.logging.level = level;
    }
    config
  })
}

#[derive(Parser)]
#[command(
  name = "keeper",
  about = "Host-resident supervisor for costrict helper services",
  version
)]
pub struct CliArgs {
  /// Override the keeper root directory
  /// (default $HOME/.costrict).
  #[arg(long, global = true)]
  pub root: Option<PathBuf>,

  /// Override the config file path
  /// (default <root>/config.toml).
  #[arg(long, global = true)]
  pub config: Option<PathBuf>,

  /// Override the log level.
  #[arg(long, global = true)]
  pub log_level: Option<LogLevel>,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
  /// Run the supervisor daemon.
  Server,
  /// Inspect or drive supervised services.
  Service {
    #[command(subcommand)]
    action: ServiceAction,
  },
  /// Inspect or drive installed components.
  Component {
    #[command(subcommand)]
    action: ComponentAction,
  },
  /// Run the full health aggregation.
  Check,
  /// Print the current fleet state.
  State,
  /// Reload the system spec from the manifest url.
  Reload,
  /// Print the well-known document.
  Known,
  /// Clear transient keeper state.
  Clean,
  /// Per-service log operations.
  Logs {
    #[command(subcommand)]
    action: LogsAction,
  },
  /// Print keeper runtime metrics.
  Metrics,
  /// Print the keeper version.
  Version,
}

#[derive(Subcommand)]
pub enum ServiceAction {
  List,
  Start { name: String },
  Stop { name: String },
  Restart { name: String },
  Open { name: String },
  Close { name: String },
  Reopen { name: String },
}

#[derive(Subcommand)]
pub enum ComponentAction {
  List,
  Upgrade { name: String },
  Remove { name: String },
}

#[derive(Subcommand)]
pub enum LogsAction {
  /// Bundle current service logs for upload.
  Upload,
}

#[derive(Deserialize)]
struct Env {
  keeper_root_directory: Option<PathBuf>,
  keeper_config_path: Option<PathBuf>,
  keeper_port: Option<u16>,
  keeper_manifest_base_url: Option<String>,
  keeper_spec_url: Option<String>,
  keeper_spec_path: Option<PathBuf>,
  keeper_log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
  /// Root of the on-disk layout, `$HOME/.costrict` by default.
  pub root_directory: PathBuf,
  /// Loopback TCP port of the control plane.
  pub port: u16,
  /// Base url packages and the system spec are fetched from.
  pub manifest_base_url: String,
  /// Full spec url override. Defaults to
  /// `<manifest_base_url>/spec-<os>-<arch>.json`.
  pub spec_url: Option<String>,
  /// Local spec file override, takes precedence over any url.
  pub spec_path: Option<PathBuf>,
  pub port_range_min: u16,
  pub port_range_max: u16,
  pub graceful_stop_timeout_secs: u64,
  pub health_interval_secs: u64,
  pub health_timeout_secs: u64,
  pub health_fail_threshold: u32,
  pub restart_budget_count: u32,
  pub restart_budget_window_secs: u64,
  pub error_backoff_cap_secs: u64,
  /// Local time the midnight rooster wakes at.
  pub upgrade_hour: u32,
  pub upgrade_minute: u32,
  pub download_timeout_secs: u64,
  pub control_timeout_secs: u64,
  /// Cap before per-service logs rotate.
  pub service_log_max_bytes: u64,
  pub tunnel: TunnelConfig,
  pub logging: LogConfig,
}

impl Default for KeeperConfig {
  fn default() -> Self {
    KeeperConfig {
      root_directory: default_root(),
      port: keeper_client::DEFAULT_PORT,
      manifest_base_url: String::from(
        "https://costrict.zgsm.ai/packages",
      ),
      spec_url: None,
      spec_path: None,
      port_range_min: 8000,
      port_range_max: 8999,
      graceful_stop_timeout_secs: 10,
      health_interval_secs: 10,
      health_timeout_secs: 2,
      health_fail_threshold: 3,
      restart_budget_count: 5,
      restart_budget_window_secs: 60,
      error_backoff_cap_secs: 300,
      upgrade_hour: 3,
      upgrade_minute: 30,
      download_timeout_secs: 30,
      control_timeout_secs: 5,
      service_log_max_bytes: 10 * 1024 * 1024,
      tunnel: TunnelConfig::default(),
      logging: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
  /// Reverse tunnel helper binary, resolved on PATH or under
  /// `bin/`.
  pub command: String,
  /// Remote gateway `host:port` the helper connects to.
  pub gateway: String,
  /// Restart budget for tunnel helpers, scaled below the service
  /// budget.
  pub restart_budget_count: u32,
  pub restart_budget_window_secs: u64,
}

impl Default for TunnelConfig {
  fn default() -> Self {
    TunnelConfig {
      command: String::from("costrict-tunnel"),
      gateway: String::from("tunnel.zgsm.ai:443"),
      restart_budget_count: 3,
      restart_budget_window_secs: 30,
    }
  }
}

impl KeeperConfig {
  pub fn bin_dir(&self) -> PathBuf {
    self.root_directory.join("bin")
  }

  pub fn package_dir(&self) -> PathBuf {
    self.root_directory.join("package")
  }

  pub fn logs_dir(&self) -> PathBuf {
    self.root_directory.join("logs")
  }

  pub fn share_dir(&self) -> PathBuf {
    self.root_directory.join("share")
  }

  pub fn cache_dir(&self) -> PathBuf {
    self.root_directory.join("cache")
  }

  pub fn run_dir(&self) -> PathBuf {
    self.root_directory.join("run")
  }

  pub fn well_known_path(&self) -> PathBuf {
    self.root_directory.join(keeper_client::WELL_KNOWN_PATH)
  }

  pub fn socket_path(&self) -> PathBuf {
    self.root_directory.join(keeper_client::SOCKET_PATH)
  }

  pub fn port_state_path(&self) -> PathBuf {
    self.run_dir().join("ports.json")
  }

  pub fn spec_cache_path(&self) -> PathBuf {
    self.cache_dir().join("spec.json")
  }

  pub fn token_path(&self) -> PathBuf {
    self.share_dir().join("token")
  }

  pub fn keeper_log_path(&self) -> PathBuf {
    self.logs_dir().join("keeper.log")
  }

  pub fn service_log_path(&self, name: &str) -> PathBuf {
    self.logs_dir().join(format!("{name}.log"))
  }

  pub fn resolved_spec_url(&self) -> String {
    match &self.spec_url {
      Some(url) => url.clone(),
      None => format!(
        "{}/spec-{}-{}.json",
        self.manifest_base_url.trim_end_matches('/'),
        os_tag(),
        arch_tag()
      ),
    }
  }

  /// Create the full directory layout under root.
  pub fn ensure_layout(&self) -> anyhow::Result<()> {
    for dir in [
      self.bin_dir(),
      self.package_dir(),
      self.logs_dir(),
      self.share_dir(),
      self.cache_dir(),
      self.run_dir(),
    ] {
      std::fs::create_dir_all(&dir).map_err(|e| {
        anyhow::anyhow!("Failed to create {}: {e}", dir.display())
      })?;
    }
    Ok(())
  }

  /// Opaque bearer token placed beside the well-known file by the
  /// launcher, passed through to children and remote requests.
  pub fn read_token(&self) -> Option<String> {
    let token =
      std::fs::read_to_string(self.token_path()).ok()?;
    let token = token.trim();
    if token.is_empty() {
      None
    } else {
      Some(token.to_string())
    }
  }
}

fn default_root() -> PathBuf {
  dirs::home_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join(".costrict")
}

/// Platform tag in manifest naming ("windows" / "darwin" /
/// "linux").
pub fn os_tag() -> &'static str {
  match std::env::consts::OS {
    "macos" => "darwin",
    os => os,
  }
}

/// Architecture tag in manifest naming ("amd64" / "arm64").
pub fn arch_tag() -> &'static str {
  match std::env::consts::ARCH {
    "x86_64" => "amd64",
    "aarch64" => "arm64",
    arch => arch,
  }
}

/// Expand a service command template against its assigned port.
/// `{port}` placeholders are substituted wherever they appear; a
/// template without one gets `--port <n>` appended so the child
/// always learns its port.
pub fn resolve_command(
  command: &str,
  args: &[String],
  port: u16,
  bin_dir: &Path,
) -> (String, Vec<String>) {
  let port_str = port.to_string();
  let mut saw_placeholder = command.contains("{port}");
  let program = command.replace("{port}", &port_str);
  let mut resolved = Vec::with_capacity(args.len() + 2);
  for arg in args {
    if arg.contains("{port}") {
      saw_placeholder = true;
    }
    resolved.push(arg.replace("{port}", &port_str));
  }
  if !saw_placeholder && port != 0 {
    resolved.push(String::from("--port"));
    resolved.push(port_str);
  }
  // Bare program names resolve against the keeper bin dir when
  // installed there.
  let program = if !program.contains(std::path::MAIN_SEPARATOR) {
    let installed = bin_dir.join(&program);
    if installed.exists() {
      installed.to_string_lossy().into_owned()
    } else {
      program
    }
  } else {
    program
  };
  (program, resolved)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn port_placeholder_substituted() {
    let dir = tempfile::tempdir().unwrap();
    let (program, args) = resolve_command(
      "svc-a",
      &[String::from("--listen"), String::from("127.0.0.1:{port}")],
      8080,
      dir.path(),
    );
    assert_eq!(program, "svc-a");
    assert_eq!(args, vec!["--listen", "127.0.0.1:8080"]);
  }

  #[test]
  fn port_flag_appended_without_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let (_, args) =
      resolve_command("svc-a", &[], 8081, dir.path());
    assert_eq!(args, vec!["--port", "8081"]);
  }

  #[test]
  fn zero_port_appends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (_, args) = resolve_command("svc-a", &[], 0, dir.path());
    assert!(args.is_empty());
  }

  #[test]
  fn installed_binary_resolves_to_bin_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("svc-a"), b"#!/bin/sh\n")
      .unwrap();
    let (program, _) =
      resolve_command("svc-a", &[], 8080, dir.path());
    assert_eq!(
      program,
      dir.path().join("svc-a").to_string_lossy()
    );
  }

  #[test]
  fn default_config_is_consistent() {
    let config = KeeperConfig::default();
    assert!(config.port_range_min < config.port_range_max);
    assert_eq!(config.port, keeper_client::DEFAULT_PORT);
    assert!(
      config
        .resolved_spec_url()
        .starts_with(&config.manifest_base_url)
    );
  }
}
