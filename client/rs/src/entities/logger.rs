use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
  /// Minimum level written, default Info.
  #[serde(default)]
  pub level: LogLevel,
  /// How logs reach stdout / stderr.
  #[serde(default)]
  pub stdio: StdioLogMode,
  /// Use the multiline pretty formatter.
  #[serde(default)]
  pub pretty: bool,
  /// Include the emitting module in log lines.
  #[serde(default)]
  pub location: bool,
  #[serde(default = "default_ansi")]
  pub ansi: bool,
  /// Also copy the keeper's own log to `logs/keeper.log`.
  #[serde(default = "default_file")]
  pub file: bool,
}

fn default_ansi() -> bool {
  true
}

fn default_file() -> bool {
  true
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
  Off,
  Error,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}
