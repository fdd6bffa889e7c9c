use std::path::PathBuf;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use super::spec::ComponentDecl;

/// On-disk install record, one JSON file per component under
/// `package/`. These records are the authoritative local inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRecord {
  pub name: String,
  /// Installed version, always a full `MAJOR.MINOR.MICRO`.
  pub version: String,
  /// Absolute path of the installed executable.
  pub path: PathBuf,
  /// Byte size recorded at install time.
  pub size: u64,
  pub modified_at: DateTime<Utc>,
  /// Url the artifact was last downloaded from.
  pub url: String,
  /// The declaration that produced this install.
  pub declared: ComponentDecl,
}

impl ComponentRecord {
  pub fn installed_version(&self) -> anyhow::Result<Version> {
    Version::parse(&self.version).map_err(Into::into)
  }
}

/// Component shape returned by `GET /components`: the local record
/// (if any) joined with the current declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDetail {
  pub name: String,
  /// Declared semver range from the current spec.
  pub declared_version: String,
  /// Installed version, or null when not installed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub installed_version: Option<String>,
  #[serde(default)]
  pub installed: bool,
  /// Whether the installed version satisfies the declared range.
  #[serde(default)]
  pub satisfied: bool,
  /// Whether the reconciler would install a newer version.
  #[serde(default)]
  pub upgrade_needed: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub record: Option<ComponentRecord>,
}

/// Remote package index at
/// `<base>/<name>/packages-<os>-<arch>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageIndex {
  pub newest: String,
  #[serde(default)]
  pub versions: Vec<PackageVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVersion {
  pub version: String,
  pub url: String,
  pub size: u64,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub description: String,
}

impl PackageVersion {
  pub fn parsed_version(&self) -> anyhow::Result<Version> {
    Version::parse(self.version.trim_start_matches('v'))
      .map_err(Into::into)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn package_index_parses_wire_shape() {
    let index: PackageIndex = serde_json::from_str(
      r#"{
        "newest": "1.0.3",
        "versions": [
          { "version": "1.0.3", "url": "https://x/a", "size": 10 },
          { "version": "v1.0.0", "url": "https://x/b", "size": 9,
            "description": "initial" }
        ]
      }"#,
    )
    .unwrap();
    assert_eq!(index.newest, "1.0.3");
    assert_eq!(
      index.versions[1].parsed_version().unwrap(),
      Version::new(1, 0, 0)
    );
  }
}
