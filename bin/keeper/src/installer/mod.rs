use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use keeper_client::entities::{
  ComponentDecl, ComponentDetail, ComponentRecord, PackageIndex,
  PackageVersion, UpgradeMode,
};
use semver::Version;

use crate::config::KeeperConfig;

mod index;
pub mod record;

pub use index::PackageClient;

/// Deadline for shelling an installed binary with `--version`.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
  #[error("no such component '{0}' in the package registry")]
  NoSuchComponent(String),
  #[error(
    "no version of '{name}' satisfies '{range}' within bounds"
  )]
  NoMatchingVersion { name: String, range: String },
  #[error(
    "artifact for '{name}' corrupt: expected {expected} bytes, \
     got {actual}"
  )]
  CorruptArtifact {
    name: String,
    expected: u64,
    actual: u64,
  },
  #[error("component '{0}' is not installed")]
  NotInstalled(String),
  #[error(transparent)]
  Transient(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
  /// Local install already satisfies the selection.
  AlreadyCurrent(Version),
  Installed(Version),
  /// Target binary was locked; the artifact waits beside it as
  /// `<name>.staged` for the next quiet window.
  Staged(Version),
}

impl InstallOutcome {
  pub fn version(&self) -> &Version {
    match self {
      InstallOutcome::AlreadyCurrent(v)
      | InstallOutcome::Installed(v)
      | InstallOutcome::Staged(v) => v,
    }
  }
}

/// What `select_version` decided to do with a component.
#[derive(Debug, PartialEq)]
enum Selection {
  Keep(Version),
  Install(PackageVersion),
}

/// Resolves component declarations against the remote registry and
/// the local install records, and applies installs atomically.
pub struct Installer {
  bin_dir: PathBuf,
  package_dir: PathBuf,
  client: PackageClient,
}

impl Installer {
  pub fn new(config: &KeeperConfig) -> anyhow::Result<Installer> {
    Ok(Installer {
      bin_dir: config.bin_dir(),
      package_dir: config.package_dir(),
      client: PackageClient::new(
        config.manifest_base_url.clone(),
        config.read_token(),
        Duration::from_secs(config.download_timeout_secs),
      )?,
    })
  }

  pub fn binary_path(&self, name: &str) -> PathBuf {
    if cfg!(windows) {
      self.bin_dir.join(format!("{name}.exe"))
    } else {
      self.bin_dir.join(name)
    }
  }

  fn staged_path(&self, name: &str) -> PathBuf {
    self.bin_dir.join(format!("{name}.staged"))
  }

  pub async fn record(
    &self,
    name: &str,
  ) -> Option<ComponentRecord> {
    record::read(&self.package_dir, name).await
  }

  /// Reconcile one component against the registry. `force`
  /// ignores a manual pin (explicit user upgrade).
  pub async fn ensure(
    &self,
    decl: &ComponentDecl,
    force: bool,
  ) -> Result<InstallOutcome, InstallError> {
    let index = self.client.fetch_index(&decl.name).await?;
    let local = self.local_state(decl).await;
    let selection =
      select_version(&index, decl, local.as_ref(), force)?;

    let package = match selection {
      Selection::Keep(version) => {
        debug!("Component {} already current", decl.name);
        return Ok(InstallOutcome::AlreadyCurrent(version));
      }
      Selection::Install(package) => package,
    };
    let version = package
      .parsed_version()
      .map_err(InstallError::Transient)?;

    info!(
      "Installing {} v{version} from {}",
      decl.name, package.url
    );

    let target = self.binary_path(&decl.name);
    if let Some(parent) = target.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| {
          format!("Failed to create {}", parent.display())
        })
        .map_err(InstallError::Transient)?;
    }
    let tmp = self.bin_dir.join(format!(
      ".{}.download-{:08x}",
      decl.name,
      rand::random::<u32>()
    ));
    self
      .client
      .download(&decl.name, &package.url, &tmp, package.size)
      .await?;
    set_executable(&tmp).await.map_err(InstallError::Transient)?;

    let staged = match tokio::fs::rename(&tmp, &target).await {
      Ok(()) => false,
      // A running service can hold the target locked (notably on
      // windows). Stage beside it for the next quiet window.
      Err(e) => {
        warn!(
          "Could not swap {} in place ({e}), staging",
          target.display()
        );
        tokio::fs::rename(&tmp, self.staged_path(&decl.name))
          .await
          .with_context(|| {
            format!("Failed to stage artifact for {}", decl.name)
          })
          .map_err(InstallError::Transient)?;
        true
      }
    };

    let record = ComponentRecord {
      name: decl.name.clone(),
      version: version.to_string(),
      path: target,
      size: package.size,
      modified_at: Utc::now(),
      url: package.url.clone(),
      declared: decl.clone(),
    };
    if !staged {
      record::write(&self.package_dir, &record)
        .await
        .map_err(InstallError::Transient)?;
      return Ok(InstallOutcome::Installed(version));
    }
    Ok(InstallOutcome::Staged(version))
  }

  /// Move a staged artifact into place. Returns whether a swap
  /// happened.
  pub async fn swap_staged(
    &self,
    decl: &ComponentDecl,
  ) -> anyhow::Result<bool> {
    let staged = self.staged_path(&decl.name);
    if !staged.exists() {
      return Ok(false);
    }
    let target = self.binary_path(&decl.name);
    let size = tokio::fs::metadata(&staged)
      .await
      .map(|meta| meta.len())
      .unwrap_or(0);
    tokio::fs::rename(&staged, &target)
      .await
      .with_context(|| {
        format!("Failed to swap staged {}", decl.name)
      })?;
    let version = probe_version_output(
      &command::run_probe(
        &target,
        ["--version"],
        VERSION_PROBE_TIMEOUT,
      )
      .await
      .combined(),
    )
    .unwrap_or_else(|| Version::new(0, 0, 0));
    let record = ComponentRecord {
      name: decl.name.clone(),
      version: version.to_string(),
      path: target,
      size,
      modified_at: Utc::now(),
      url: String::new(),
      declared: decl.clone(),
    };
    record::write(&self.package_dir, &record).await?;
    Ok(true)
  }

  /// Resolve the locally installed version: shell the binary with
  /// `--version`, fall back to the install record, else report
  /// [InstallError::NotInstalled].
  pub async fn local_version(
    &self,
    name: &str,
  ) -> Result<Version, InstallError> {
    let binary = self.binary_path(name);
    if binary.exists() {
      let out = command::run_probe(
        &binary,
        ["--version"],
        VERSION_PROBE_TIMEOUT,
      )
      .await;
      if out.success
        && let Some(version) =
          probe_version_output(&out.combined())
      {
        return Ok(version);
      }
    }
    match self.record(name).await {
      Some(rec) => rec
        .installed_version()
        .map_err(InstallError::Transient),
      None => Err(InstallError::NotInstalled(name.to_string())),
    }
  }

  /// Install record joined with the declaration, for `GET
  /// /components` and check aggregation.
  pub async fn detail(
    &self,
    decl: &ComponentDecl,
  ) -> ComponentDetail {
    let record = self.local_state(decl).await;
    let satisfied = match (&record, decl.version_req()) {
      (Some(record), Ok(req)) => record
        .installed_version()
        .map(|v| req.matches(&v))
        .unwrap_or(false),
      _ => false,
    };
    ComponentDetail {
      name: decl.name.clone(),
      declared_version: decl.version.clone(),
      installed_version: record
        .as_ref()
        .map(|r| r.version.clone()),
      installed: record.is_some(),
      satisfied,
      // Refined against the remote index by the reconciler; from
      // local state alone, unsatisfied means upgrade needed.
      upgrade_needed: record.is_some() && !satisfied,
      record,
    }
  }

  pub async fn uninstall(
    &self,
    name: &str,
  ) -> Result<(), InstallError> {
    let had_record = self.record(name).await.is_some();
    let binary = self.binary_path(name);
    let existed = binary.exists();
    if !existed && !had_record {
      return Err(InstallError::NotInstalled(name.to_string()));
    }
    if existed {
      tokio::fs::remove_file(&binary)
        .await
        .with_context(|| {
          format!("Failed to remove {}", binary.display())
        })
        .map_err(InstallError::Transient)?;
    }
    let _ =
      tokio::fs::remove_file(self.staged_path(name)).await;
    record::remove(&self.package_dir, name)
      .await
      .map_err(InstallError::Transient)?;
    Ok(())
  }

  pub async fn list_records(&self) -> Vec<ComponentRecord> {
    record::list(&self.package_dir).await
  }

  /// The install record, discarded when the recorded file is gone
  /// or its size changed underneath us.
  async fn local_state(
    &self,
    decl: &ComponentDecl,
  ) -> Option<ComponentRecord> {
    let record = self.record(&decl.name).await?;
    match tokio::fs::metadata(&record.path).await {
      Ok(meta) if meta.len() == record.size => Some(record),
      _ => {
        debug!(
          "Install record for {} no longer matches disk",
          decl.name
        );
        None
      }
    }
  }
}

/// Pick the newest version that satisfies the declared range and
/// the upgrade bounds, never downgrading below the local version
/// unless local sits under `lowest` (force-upgrade path). A manual
/// pin keeps the local version unless forced or under `lowest`.
fn select_version(
  index: &PackageIndex,
  decl: &ComponentDecl,
  local: Option<&ComponentRecord>,
  force: bool,
) -> Result<Selection, InstallError> {
  let req = decl.version_req().map_err(InstallError::Transient)?;
  let lowest = decl
    .upgrade
    .lowest_version()
    .map_err(InstallError::Transient)?;
  let highest = decl
    .upgrade
    .highest_version()
    .map_err(InstallError::Transient)?;

  let local_version =
    local.and_then(|record| record.installed_version().ok());

  let forced_up = match (&local_version, &lowest) {
    (Some(local), Some(lowest)) => local < lowest,
    _ => false,
  };

  // Manual mode pins whatever is installed, unless the pin sits
  // below the force-upgrade floor or the user asked explicitly.
  if decl.upgrade.mode == UpgradeMode::Manual
    && !force
    && !forced_up
    && let Some(local) = local_version.clone()
  {
    return Ok(Selection::Keep(local));
  }

  let mut best: Option<(Version, &PackageVersion)> = None;
  for package in &index.versions {
    let Ok(version) = package.parsed_version() else {
      debug!(
        "Skipping unparseable version '{}' of {}",
        package.version, decl.name
      );
      continue;
    };
    if !req.matches(&version) {
      continue;
    }
    if let Some(lowest) = &lowest
      && version < *lowest
    {
      continue;
    }
    if let Some(highest) = &highest
      && version > *highest
    {
      continue;
    }
    if let Some(local) = &local_version
      && version < *local
      && !forced_up
    {
      continue;
    }
    if best
      .as_ref()
      .is_none_or(|(best_version, _)| version > *best_version)
    {
      best = Some((version, package));
    }
  }

  let Some((version, package)) = best else {
    // A local install newer than anything published still
    // satisfies the declaration.
    if let Some(local) = local_version
      && req.matches(&local)
      && !forced_up
    {
      return Ok(Selection::Keep(local));
    }
    return Err(InstallError::NoMatchingVersion {
      name: decl.name.clone(),
      range: decl.version.clone(),
    });
  };

  match local_version {
    Some(local) if local >= version && !forced_up => {
      Ok(Selection::Keep(local))
    }
    _ => Ok(Selection::Install(package.clone())),
  }
}

/// Scrape a `MAJOR.MINOR.MICRO` triple out of version output.
fn probe_version_output(output: &str) -> Option<Version> {
  static VERSION_RE: std::sync::OnceLock<regex::Regex> =
    std::sync::OnceLock::new();
  let re = VERSION_RE.get_or_init(|| {
    regex::Regex::new(r"(\d+)\.(\d+)\.(\d+)")
      .expect("version regex is valid")
  });
  let caps = re.captures(output)?;
  Some(Version::new(
    caps[1].parse().ok()?,
    caps[2].parse().ok()?,
    caps[3].parse().ok()?,
  ))
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> anyhow::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  let meta =
    tokio::fs::metadata(path).await.with_context(|| {
      format!("Failed to stat {}", path.display())
    })?;
  let mut perms = meta.permissions();
  perms.set_mode(perms.mode() | 0o755);
  tokio::fs::set_permissions(path, perms)
    .await
    .with_context(|| {
      format!("Failed to chmod {}", path.display())
    })?;
  Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> anyhow::Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use keeper_client::entities::UpgradeSpec;

  fn decl(range: &str, upgrade: UpgradeSpec) -> ComponentDecl {
    ComponentDecl {
      name: String::from("svc-a"),
      version: range.to_string(),
      upgrade,
    }
  }

  fn index(versions: &[(&str, u64)]) -> PackageIndex {
    PackageIndex {
      newest: versions
        .first()
        .map(|(v, _)| v.to_string())
        .unwrap_or_default(),
      versions: versions
        .iter()
        .map(|(version, size)| PackageVersion {
          version: version.to_string(),
          url: format!("https://x/{version}"),
          size: *size,
          description: String::new(),
        })
        .collect(),
    }
  }

  fn local(version: &str) -> ComponentRecord {
    ComponentRecord {
      name: String::from("svc-a"),
      version: version.to_string(),
      path: PathBuf::from("/tmp/svc-a"),
      size: 1,
      modified_at: Utc::now(),
      url: String::new(),
      declared: decl("^1.0.0", Default::default()),
    }
  }

  fn bounds(
    lowest: Option<&str>,
    highest: Option<&str>,
    mode: UpgradeMode,
  ) -> UpgradeSpec {
    UpgradeSpec {
      mode,
      lowest: lowest.map(String::from),
      highest: highest.map(String::from),
    }
  }

  #[test]
  fn picks_newest_in_range() {
    let selection = select_version(
      &index(&[("1.0.3", 1), ("1.0.1", 1), ("2.0.0", 1)]),
      &decl("^1.0.0", Default::default()),
      None,
      false,
    )
    .unwrap();
    assert_eq!(
      selection,
      Selection::Install(PackageVersion {
        version: String::from("1.0.3"),
        url: String::from("https://x/1.0.3"),
        size: 1,
        description: String::new(),
      })
    );
  }

  #[test]
  fn keeps_local_when_newest() {
    let selection = select_version(
      &index(&[("1.0.3", 1)]),
      &decl("^1.0.0", Default::default()),
      Some(&local("1.0.3")),
      false,
    )
    .unwrap();
    assert_eq!(selection, Selection::Keep(Version::new(1, 0, 3)));
  }

  #[test]
  fn highest_bound_caps_selection() {
    let selection = select_version(
      &index(&[("1.0.5", 1), ("1.0.2", 1)]),
      &decl(
        "^1.0.0",
        bounds(None, Some("1.0.2"), UpgradeMode::Auto),
      ),
      None,
      false,
    )
    .unwrap();
    assert!(matches!(
      selection,
      Selection::Install(p) if p.version == "1.0.2"
    ));
  }

  #[test]
  fn manual_pin_keeps_local() {
    let selection = select_version(
      &index(&[("1.0.5", 1)]),
      &decl("^1.0.0", bounds(None, None, UpgradeMode::Manual)),
      Some(&local("1.0.1")),
      false,
    )
    .unwrap();
    assert_eq!(selection, Selection::Keep(Version::new(1, 0, 1)));
  }

  #[test]
  fn manual_pin_overridden_by_force() {
    let selection = select_version(
      &index(&[("1.0.5", 1)]),
      &decl("^1.0.0", bounds(None, None, UpgradeMode::Manual)),
      Some(&local("1.0.1")),
      true,
    )
    .unwrap();
    assert!(matches!(
      selection,
      Selection::Install(p) if p.version == "1.0.5"
    ));
  }

  #[test]
  fn local_below_lowest_is_force_upgraded() {
    let selection = select_version(
      &index(&[("1.2.0", 1)]),
      &decl(
        "^1.0.0",
        bounds(Some("1.1.0"), None, UpgradeMode::Manual),
      ),
      Some(&local("1.0.0")),
      false,
    )
    .unwrap();
    assert!(matches!(
      selection,
      Selection::Install(p) if p.version == "1.2.0"
    ));
  }

  #[test]
  fn nothing_matching_errors() {
    let err = select_version(
      &index(&[("2.0.0", 1)]),
      &decl("^1.0.0", Default::default()),
      None,
      false,
    )
    .unwrap_err();
    assert!(matches!(
      err,
      InstallError::NoMatchingVersion { .. }
    ));
  }

  #[test]
  fn version_probe_scrapes_triples() {
    assert_eq!(
      probe_version_output("svc-a version 1.2.3 (release)"),
      Some(Version::new(1, 2, 3))
    );
    assert_eq!(probe_version_output("no version here"), None);
  }
}
