use std::{fs::File, path::Path, sync::Arc};

use anyhow::Context;
use keeper_client::entities::{LogConfig, LogLevel, StdioLogMode};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  Layer, Registry, layer::SubscriberExt, registry::LookupSpan,
  util::SubscriberInitExt,
};

/// Initialize the keeper's tracing stack from config: stdio in the
/// configured mode, plus an optional plain-format copy into
/// `log_file` when `config.file` is set.
pub fn init(
  config: &LogConfig,
  log_file: Option<&Path>,
) -> anyhow::Result<()> {
  let registry =
    Registry::default().with(level_filter(config.level));

  let log_file = if config.file { log_file } else { None };

  match (config.stdio, config.pretty) {
    (StdioLogMode::Standard, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(false)
          .with_line_number(false)
          .with_target(config.location)
          .with_ansi(config.ansi),
      )
      .with(file_layer(config, log_file)?)
      .try_init(),
    (StdioLogMode::Standard, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(false)
          .with_line_number(false)
          .with_target(config.location)
          .with_ansi(config.ansi),
      )
      .with(file_layer(config, log_file)?)
      .try_init(),
    (StdioLogMode::Json, _) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .with(file_layer(config, log_file)?)
      .try_init(),
    (StdioLogMode::None, _) => {
      match file_layer(config, log_file)? {
        Some(file_layer) => {
          registry.with(file_layer).try_init()
        }
        None => Ok(()),
      }
    }
  }
  .context("failed to init logger")
}

/// Plain-format file copy of the log stream. Generic over the
/// subscriber so each stdio arm can stack it.
fn file_layer<S>(
  config: &LogConfig,
  log_file: Option<&Path>,
) -> anyhow::Result<Option<impl Layer<S>>>
where
  S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
  let Some(path) = log_file else {
    return Ok(None);
  };
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).with_context(|| {
      format!("Failed to create {}", parent.display())
    })?;
  }
  let file = File::options()
    .create(true)
    .append(true)
    .open(path)
    .with_context(|| {
      format!("Failed to open log file {}", path.display())
    })?;
  Ok(Some(
    tracing_subscriber::fmt::layer()
      .with_target(config.location)
      .with_ansi(false)
      .with_writer(Arc::new(file)),
  ))
}

fn level_filter(level: LogLevel) -> LevelFilter {
  match level {
    LogLevel::Off => LevelFilter::OFF,
    LogLevel::Error => LevelFilter::ERROR,
    LogLevel::Warn => LevelFilter::WARN,
    LogLevel::Info => LevelFilter::INFO,
    LogLevel::Debug => LevelFilter::DEBUG,
    LogLevel::Trace => LevelFilter::TRACE,
  }
}
