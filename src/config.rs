use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::spatial::{Crs, Extent};
use crate::sync::IdempotencyPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  pub spatial: SpatialConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Override for the cache database path
  pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Base URL of the RPC endpoint
  pub url: String,
  /// Server database name, appended to the URL path
  pub database: String,
  pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpatialConfig {
  /// Base URL of the feature service
  pub url: String,
  /// Coordinate system the feature service expects, e.g. "EPSG:3857"
  #[serde(default = "default_service_crs")]
  pub crs: String,
}

fn default_service_crs() -> String {
  "EPSG:3857".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// What to do when a model is already cached
  #[serde(default)]
  pub policy: IdempotencyPolicy,
  /// Ceiling on paginated record/id queries
  #[serde(default = "default_results_limit")]
  pub results_limit: usize,
  /// Menu node the sync starts from
  #[serde(default = "default_root_menu_id")]
  pub root_menu_id: i64,
  /// Default extent as [minx, miny, maxx, maxy], used when --bbox is absent
  pub extent: Option<[f64; 4]>,
  /// Coordinate system of the default extent
  #[serde(default = "default_extent_crs")]
  pub extent_crs: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      policy: IdempotencyPolicy::default(),
      results_limit: default_results_limit(),
      root_menu_id: default_root_menu_id(),
      extent: None,
      extent_crs: default_extent_crs(),
    }
  }
}

fn default_results_limit() -> usize {
  crate::sync::DEFAULT_RESULTS_LIMIT
}

fn default_root_menu_id() -> i64 {
  132
}

fn default_extent_crs() -> String {
  "EPSG:4326".to_string()
}

impl SyncConfig {
  /// Build the configured default extent.
  pub fn default_extent(&self) -> Result<Extent> {
    let [min_x, min_y, max_x, max_y] = self
      .extent
      .ok_or_else(|| eyre!("No extent configured. Pass --bbox or set sync.extent."))?;
    Ok(Extent::new(
      min_x,
      min_y,
      max_x,
      max_y,
      Crs::parse(&self.extent_crs)?,
    ))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./geosync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/geosync/config.yaml
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
        "No configuration file found. Create one at ~/.config/geosync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("geosync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("geosync").join("config.yaml");
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

  /// Resolve the cache database path: explicit override or the platform
  /// data directory.
  pub fn cache_db_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache_path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("geosync").join("cache.db"))
  }

  /// Get the server password from the environment.
  pub fn get_password() -> Result<String> {
    std::env::var("GEOSYNC_PASSWORD")
      .map_err(|_| eyre!("Server password not found. Set GEOSYNC_PASSWORD environment variable."))
  }
}
