use colored::Colorize;
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use keeper_client::entities::{
  CheckStatus, ComponentDetail, RunStatus, ServiceInstance,
};

pub fn table(headers: &[&str]) -> Table {
  let mut table = Table::new();
  table.load_preset(UTF8_FULL_CONDENSED);
  table.set_header(headers.to_vec());
  table
}

pub fn status_cell(status: RunStatus) -> String {
  let text = status.to_string();
  match status {
    RunStatus::Running => text.green().to_string(),
    RunStatus::Error => text.red().to_string(),
    RunStatus::Exited | RunStatus::Stopped => {
      text.yellow().to_string()
    }
    RunStatus::Disabled => text.dimmed().to_string(),
  }
}

pub fn check_cell(status: CheckStatus) -> String {
  let text = status.to_string();
  match status {
    CheckStatus::Healthy => text.green().to_string(),
    CheckStatus::Warning => text.yellow().to_string(),
    CheckStatus::Error => text.red().to_string(),
  }
}

pub fn service_table(
  instances: &[ServiceInstance],
) -> Table {
  let mut table = table(&[
    "name", "status", "healthy", "pid", "port", "restarts",
    "tunnel",
  ]);
  for instance in instances {
    let tunnel = instance
      .tunnel
      .as_ref()
      .map(|tunnel| {
        tunnel
          .pairs
          .first()
          .map(|pair| {
            format!(
              "{} -> {} ({})",
              pair.local_port, pair.mapping_port, tunnel.status
            )
          })
          .unwrap_or_else(|| tunnel.status.to_string())
      })
      .unwrap_or_else(|| String::from("-"));
    table.add_row(vec![
      instance.name.clone(),
      status_cell(instance.status),
      if instance.healthy { "yes" } else { "no" }.to_string(),
      if instance.pid == 0 {
        String::from("-")
      } else {
        instance.pid.to_string()
      },
      if instance.port == 0 {
        String::from("-")
      } else {
        instance.port.to_string()
      },
      instance.restart_count.to_string(),
      tunnel,
    ]);
  }
  table
}

pub fn component_table(
  components: &[ComponentDetail],
) -> Table {
  let mut table = table(&[
    "name",
    "declared",
    "installed",
    "satisfied",
    "upgrade needed",
  ]);
  for component in components {
    table.add_row(vec![
      component.name.clone(),
      component.declared_version.clone(),
      component
        .installed_version
        .clone()
        .unwrap_or_else(|| "-".dimmed().to_string()),
      yes_no(component.satisfied),
      yes_no(component.upgrade_needed),
    ]);
  }
  table
}

fn yes_no(value: bool) -> String {
  if value {
    String::from("yes")
  } else {
    String::from("no")
  }
}
