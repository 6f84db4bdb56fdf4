use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// On-disk configuration.
///
/// `version` names the cache bucket of this deployment. Bump it on every
/// deployable change: the next activation deletes every bucket with a
/// different name, which is the only way stale assets are ever evicted.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub version: String,
  /// Absolute URL that relative assets are resolved against
  pub scope: String,
  /// Page served to offline navigations (defaults to the first asset)
  pub root_document: Option<String>,
  /// Asset manifest pre-cached at install time
  #[serde(default)]
  pub assets: Vec<String>,
  /// How many manifest entries are fetched at once during install
  #[serde(default = "default_install_concurrency")]
  pub install_concurrency: usize,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite database path (defaults to $XDG_DATA_HOME/swcache/cache.db)
  pub path: Option<PathBuf>,
}

fn default_install_concurrency() -> usize {
  4
}

/// Resolved settings shared by the install, activate and fetch handlers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Name of the current bucket
  pub cache_name: String,
  pub scope: Url,
  pub root_document: Url,
  pub manifest: Vec<Url>,
  pub install_concurrency: usize,
}

impl WorkerConfig {
  pub fn in_scope(&self, url: &Url) -> bool {
    url.as_str().starts_with(self.scope.as_str())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/swcache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Validate and resolve into the form the worker runs on.
  pub fn worker_config(&self) -> Result<WorkerConfig> {
    let cache_name = self.version.trim();
    if cache_name.is_empty() {
      return Err(eyre!("`version` must not be empty"));
    }

    let scope = Url::parse(&self.scope)
      .map_err(|e| eyre!("Invalid scope URL '{}': {}", self.scope, e))?;
    if scope.cannot_be_a_base() {
      return Err(eyre!("Scope '{}' cannot be used as a base URL", self.scope));
    }

    let manifest = self
      .assets
      .iter()
      .map(|asset| resolve(&scope, asset))
      .collect::<Result<Vec<_>>>()?;

    let root_document = match &self.root_document {
      Some(doc) => resolve(&scope, doc)?,
      None => manifest.first().cloned().unwrap_or_else(|| scope.clone()),
    };

    Ok(WorkerConfig {
      cache_name: cache_name.to_string(),
      scope,
      root_document,
      manifest,
      install_concurrency: self.install_concurrency.max(1),
    })
  }
}

fn resolve(scope: &Url, asset: &str) -> Result<Url> {
  scope
    .join(asset)
    .map_err(|e| eyre!("Invalid asset URL '{}': {}", asset, e))
}
