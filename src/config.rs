use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::model::ProjectRef;
use crate::sync::{StatusLabelPolicy, SyncSettings};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub github: GithubConfig,
  /// Project opened at startup when `--project` is not given
  pub default_project: Option<String>,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Status label policy used by projects without an override
  #[serde(default)]
  pub status_labels: StatusLabelPolicy,
  /// Per-project overrides keyed by `owner/repo` (case-insensitive)
  #[serde(default, deserialize_with = "deserialize_lowercase_keys")]
  pub projects: BTreeMap<String, ProjectConfig>,
}

fn deserialize_lowercase_keys<'de, D>(
  deserializer: D,
) -> Result<BTreeMap<String, ProjectConfig>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let m: BTreeMap<String, ProjectConfig> = BTreeMap::deserialize(deserializer)?;
  Ok(m.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect())
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
  /// REST API root, change for GitHub Enterprise
  #[serde(default = "default_api_url")]
  pub api_url: String,
}

impl Default for GithubConfig {
  fn default() -> Self {
    Self {
      api_url: default_api_url(),
    }
  }
}

fn default_api_url() -> String {
  "https://api.github.com".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_poll_interval")]
  pub poll_interval_secs: u64,
  #[serde(default = "default_fetch_timeout")]
  pub fetch_timeout_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs: default_poll_interval(),
      fetch_timeout_secs: default_fetch_timeout(),
    }
  }
}

fn default_poll_interval() -> u64 {
  60
}

fn default_fetch_timeout() -> u64 {
  30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
  pub status_labels: Option<StatusLabelPolicy>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hubsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hubsync/config.yaml
  ///
  /// Without any file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("hubsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hubsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| {
      eyre!(
        "Failed to parse config file {}: {}\n\
                 See config.example.yaml for the format.",
        path.display(),
        e
      )
    })
  }

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Status label policy for a project: its override, else the global one.
  pub fn policy_for(&self, project: &ProjectRef) -> StatusLabelPolicy {
    self
      .projects
      .get(&project.to_string().to_lowercase())
      .and_then(|p| p.status_labels.clone())
      .unwrap_or_else(|| self.status_labels.clone())
  }

  /// Coordinator settings for a project session.
  pub fn sync_settings(&self, project: &ProjectRef) -> SyncSettings {
    SyncSettings {
      policy: self.policy_for(project),
      fetch_timeout: Duration::from_secs(self.sync.fetch_timeout_secs),
    }
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.sync.poll_interval_secs.max(1))
  }

  /// Get the GitHub API token from environment variables.
  ///
  /// Checks HUBSYNC_GITHUB_TOKEN first, then GITHUB_TOKEN as fallback.
  /// Without a token only public data can be read.
  pub fn get_api_token() -> Option<String> {
    std::env::var("HUBSYNC_GITHUB_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
