use std::collections::HashSet;

use anyhow::{Context, anyhow};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use super::service::ServiceDecl;

/// The declarative manifest describing which components and services
/// belong to this host. Fetched from the cloud manifest url, cached
/// under `cache/spec.json`, and reloadable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSpec {
  /// Manifest format tag, currently "v1".
  #[serde(default = "default_format_version")]
  pub format_version: String,
  /// Target platform, eg "linux" / "darwin" / "windows".
  pub platform: String,
  /// Target architecture, eg "amd64" / "arm64".
  pub arch: String,
  /// Version of the spec document itself.
  pub version: String,
  /// The keeper's own component entry, driving self upgrade.
  pub keeper: ComponentDecl,
  /// Components to keep installed, in declaration order.
  #[serde(default)]
  pub components: Vec<ComponentDecl>,
  /// Services to keep supervised, in declaration order.
  #[serde(default)]
  pub services: Vec<ServiceDecl>,
}

fn default_format_version() -> String {
  String::from("v1")
}

impl SystemSpec {
  /// Names must be unique per category, every service must
  /// reference a declared component, and version ranges must parse.
  pub fn validate(&self) -> anyhow::Result<()> {
    let mut components = HashSet::new();
    for component in &self.components {
      if !components.insert(component.name.as_str()) {
        return Err(anyhow!(
          "Duplicate component declaration '{}'",
          component.name
        ));
      }
      component.version_req().with_context(|| {
        format!(
          "Component '{}' has invalid version range '{}'",
          component.name, component.version
        )
      })?;
      component.upgrade.validate(&component.name)?;
    }
    let mut services = HashSet::new();
    for service in &self.services {
      if !services.insert(service.name.as_str()) {
        return Err(anyhow!(
          "Duplicate service declaration '{}'",
          service.name
        ));
      }
      if !components.contains(service.component_name()) {
        return Err(anyhow!(
          "Service '{}' references undeclared component '{}'",
          service.name,
          service.component_name()
        ));
      }
      if service.command.trim().is_empty() {
        return Err(anyhow!(
          "Service '{}' has an empty command",
          service.name
        ));
      }
    }
    Ok(())
  }

  pub fn component(&self, name: &str) -> Option<&ComponentDecl> {
    self.components.iter().find(|c| c.name == name)
  }

  pub fn service(&self, name: &str) -> Option<&ServiceDecl> {
    self.services.iter().find(|s| s.name == name)
  }
}

/// A downloadable binary artifact managed by the keeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDecl {
  pub name: String,
  /// Semver range the installed version must satisfy, eg "^1.0.0".
  pub version: String,
  #[serde(default)]
  pub upgrade: UpgradeSpec,
}

impl ComponentDecl {
  pub fn version_req(&self) -> anyhow::Result<VersionReq> {
    VersionReq::parse(&self.version).with_context(|| {
      format!("Failed to parse version range '{}'", self.version)
    })
  }
}

/// Bounds on automatic upgrades for one component.
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSpec {
  #[serde(default)]
  pub mode: UpgradeMode,
  /// Versions below this are force-upgraded even in manual mode.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lowest: Option<String>,
  /// Versions above this are never auto-installed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub highest: Option<String>,
}

impl UpgradeSpec {
  pub fn validate(&self, component: &str) -> anyhow::Result<()> {
    self.lowest_version().with_context(|| {
      format!("Component '{component}' has invalid 'lowest' bound")
    })?;
    self.highest_version().with_context(|| {
      format!("Component '{component}' has invalid 'highest' bound")
    })?;
    Ok(())
  }

  pub fn lowest_version(&self) -> anyhow::Result<Option<Version>> {
    parse_bound(self.lowest.as_deref())
  }

  pub fn highest_version(&self) -> anyhow::Result<Option<Version>> {
    parse_bound(self.highest.as_deref())
  }
}

fn parse_bound(
  bound: Option<&str>,
) -> anyhow::Result<Option<Version>> {
  let Some(bound) = bound else {
    return Ok(None);
  };
  let version = Version::parse(bound.trim_start_matches('v'))
    .with_context(|| format!("Invalid version bound '{bound}'"))?;
  Ok(Some(version))
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
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UpgradeMode {
  #[default]
  Auto,
  Manual,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entities::{Accessibility, StartupMode};

  fn decl(name: &str, version: &str) -> ComponentDecl {
    ComponentDecl {
      name: name.to_string(),
      version: version.to_string(),
      upgrade: Default::default(),
    }
  }

  fn spec_with(
    components: Vec<ComponentDecl>,
    services: Vec<ServiceDecl>,
  ) -> SystemSpec {
    SystemSpec {
      format_version: String::from("v1"),
      platform: String::from("linux"),
      arch: String::from("amd64"),
      version: String::from("2025.07.01"),
      keeper: decl("costrict-keeper", "^1.0.0"),
      components,
      services,
    }
  }

  fn service(name: &str, component: &str) -> ServiceDecl {
    ServiceDecl {
      name: name.to_string(),
      component: component.to_string(),
      startup: StartupMode::Always,
      command: format!("bin/{name}"),
      args: vec![],
      protocol: String::from("http"),
      port: 8080,
      metrics_path: String::new(),
      health_path: String::new(),
      accessible: Accessibility::Local,
    }
  }

  #[test]
  fn valid_spec_passes() {
    let spec = spec_with(
      vec![decl("svc-a", "^1.0.0")],
      vec![service("svc-a", "svc-a")],
    );
    spec.validate().unwrap();
  }

  #[test]
  fn duplicate_service_rejected() {
    let spec = spec_with(
      vec![decl("svc-a", "^1.0.0")],
      vec![service("svc-a", "svc-a"), service("svc-a", "svc-a")],
    );
    assert!(spec.validate().is_err());
  }

  #[test]
  fn undeclared_component_rejected() {
    let spec = spec_with(
      vec![decl("svc-a", "^1.0.0")],
      vec![service("svc-b", "svc-b")],
    );
    assert!(spec.validate().is_err());
  }

  #[test]
  fn bad_version_range_rejected() {
    let spec = spec_with(vec![decl("svc-a", "not-a-range")], vec![]);
    assert!(spec.validate().is_err());
  }

  #[test]
  fn bounds_parse_with_v_prefix() {
    let upgrade = UpgradeSpec {
      mode: UpgradeMode::Auto,
      lowest: Some(String::from("v1.2.0")),
      highest: None,
    };
    assert_eq!(
      upgrade.lowest_version().unwrap(),
      Some(Version::new(1, 2, 0))
    );
  }
}
