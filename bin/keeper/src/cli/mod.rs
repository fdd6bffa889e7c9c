use colored::Colorize;
use keeper_client::{ClientError, KeeperClient};

use crate::config::{
  Command, ComponentAction, LogsAction, ServiceAction,
  keeper_config,
};

mod print;

/// Run one client subcommand against the local keeper and print a
/// human readable summary. Returns the process exit code: 0 on
/// 2xx, 1 on anything else.
pub async fn run(command: &Command) -> i32 {
  let config = keeper_config();
  let client =
    KeeperClient::connect(&config.root_directory).await;
  match dispatch(&client, command).await {
    Ok(()) => 0,
    Err(ClientError::Api(envelope)) => {
      eprintln!(
        "{}: {} | {}",
        "error".red().bold(),
        envelope.code,
        envelope.error
      );
      1
    }
    Err(ClientError::Transport(e)) => {
      eprintln!(
        "{}: could not reach the keeper | {e:#}",
        "error".red().bold()
      );
      eprintln!(
        "{}: is `keeper server` running?",
        "hint".yellow()
      );
      1
    }
  }
}

async fn dispatch(
  client: &KeeperClient,
  command: &Command,
) -> Result<(), ClientError> {
  match command {
    // Handled in main before the client exists.
    Command::Server => Ok(()),

    Command::Service { action } => {
      service(client, action).await
    }
    Command::Component { action } => {
      component(client, action).await
    }

    Command::Check => {
      let check = client.check().await?;
      println!(
        "overall: {}   checks: {} passed / {} failed of {}",
        print::check_cell(check.status),
        check.passed_checks,
        check.failed_checks,
        check.total_checks
      );
      println!("{}", print::service_table(&check.services));
      println!(
        "{}",
        print::component_table(&check.components)
      );
      Ok(())
    }

    Command::State => {
      let services = client.list_services().await?;
      let components = client.list_components().await?;
      println!("{}", print::service_table(&services));
      println!("{}", print::component_table(&components));
      Ok(())
    }

    Command::Reload => {
      let res = client.reload().await?;
      println!("{}", res.message);
      Ok(())
    }

    Command::Known => {
      let known = client.known().await?;
      match serde_json::to_string_pretty(&known) {
        Ok(raw) => println!("{raw}"),
        Err(e) => eprintln!("unprintable response: {e}"),
      }
      Ok(())
    }

    Command::Clean => {
      let res = client.clean().await?;
      println!("{}", res.message);
      Ok(())
    }

    Command::Logs { action } => match action {
      LogsAction::Upload => {
        let res = client.upload_logs().await?;
        println!("{}", res.message);
        Ok(())
      }
    },

    Command::Metrics => {
      let healthz = client.healthz().await?;
      let mut table = print::table(&["metric", "value"]);
      for (key, value) in &healthz.metrics {
        table.add_row(vec![key.clone(), value.to_string()]);
      }
      println!("{table}");
      Ok(())
    }

    Command::Version => {
      println!(
        "keeper cli v{}",
        env!("CARGO_PKG_VERSION")
      );
      match client.healthz().await {
        Ok(healthz) => {
          println!(
            "keeper server v{} (up {}s)",
            healthz.version, healthz.uptime
          );
        }
        Err(_) => {
          println!("keeper server not reachable");
        }
      }
      Ok(())
    }
  }
}

async fn service(
  client: &KeeperClient,
  action: &ServiceAction,
) -> Result<(), ClientError> {
  match action {
    ServiceAction::List => {
      let services = client.list_services().await?;
      println!("{}", print::service_table(&services));
    }
    ServiceAction::Start { name }
    | ServiceAction::Stop { name }
    | ServiceAction::Restart { name } => {
      let verb = match action {
        ServiceAction::Start { .. } => "start",
        ServiceAction::Stop { .. } => "stop",
        _ => "restart",
      };
      let res = client.service_action(name, verb).await?;
      println!("{}", res.message);
    }
    ServiceAction::Open { name }
    | ServiceAction::Close { name }
    | ServiceAction::Reopen { name } => {
      let verb = match action {
        ServiceAction::Open { .. } => "open",
        ServiceAction::Close { .. } => "close",
        _ => "reopen",
      };
      let tunnel = client.tunnel_action(name, verb).await?;
      let pair = tunnel
        .pairs
        .first()
        .map(|pair| {
          format!(
            "{} -> {}",
            pair.local_port, pair.mapping_port
          )
        })
        .unwrap_or_else(|| String::from("no pairs"));
      println!(
        "tunnel for {name}: {} ({pair})",
        print::status_cell(tunnel.status)
      );
    }
  }
  Ok(())
}

async fn component(
  client: &KeeperClient,
  action: &ComponentAction,
) -> Result<(), ClientError> {
  match action {
    ComponentAction::List => {
      let components = client.list_components().await?;
      println!(
        "{}",
        print::component_table(&components)
      );
    }
    ComponentAction::Upgrade { name } => {
      let res = client.upgrade_component(name).await?;
      println!("{name}: {}", res.message);
    }
    ComponentAction::Remove { name } => {
      let res = client.remove_component(name).await?;
      println!("{name}: {}", res.message);
    }
  }
  Ok(())
}
