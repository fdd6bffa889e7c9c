use std::{io, process::Output};

/// Captured result of one short-lived probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeOutput {
  pub success: bool,
  pub code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

impl ProbeOutput {
  pub fn from(output: io::Result<Output>) -> Self {
    match output {
      Ok(output) => Self {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout)
          .into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr)
          .into_owned(),
      },
      Err(e) => ProbeOutput::from_err(e),
    }
  }

  pub fn from_err(e: io::Error) -> Self {
    Self {
      success: false,
      code: None,
      stdout: String::new(),
      stderr: format!("{e:#}"),
    }
  }

  /// Stdout with stderr appended, for single line probes.
  pub fn combined(&self) -> String {
    if self.stderr.is_empty() {
      self.stdout.clone()
    } else if self.stdout.is_empty() {
      self.stderr.clone()
    } else {
      format!("{}\n{}", self.stdout, self.stderr)
    }
  }
}
