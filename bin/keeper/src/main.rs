#[macro_use]
extern crate tracing;

mod api;
mod cli;
mod config;
mod coordinator;
mod error;
mod installer;
mod metrics;
mod server;
mod supervisor;
mod tunnel;
mod wellknown;

use config::{Command, keeper_args};

#[tokio::main]
async fn main() {
  dotenvy::dotenv().ok();
  let args = keeper_args();

  let code = match &args.command {
    Command::Server => match server::run().await {
      Ok(Some(code)) => code,
      Ok(None) => 0,
      Err(e) => {
        eprintln!("keeper server failed: {e:#}");
        1
      }
    },
    command => cli::run(command).await,
  };

  std::process::exit(code);
}
