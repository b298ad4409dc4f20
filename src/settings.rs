//! Application settings storage
//!
//! Clustering radii, the database location and the log directory live in a
//! JSON file in the platform config directory. Every field has a default so
//! partial or missing files still load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::classify::ClusterParams;
use crate::error::Result;

/// Environment override for the database path
pub const DB_ENV_VAR: &str = "PARADB_DB";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_launch_radius")]
    pub launch_radius_km: f64,
    #[serde(default = "default_route_min_radius")]
    pub route_min_radius_km: f64,
    /// Route radius as a fraction of average triangle distance
    #[serde(default = "default_route_radius_scale")]
    pub route_radius_scale: f64,
    #[serde(default = "default_lat_margin")]
    pub lat_margin_deg: f64,
    #[serde(default = "default_lng_margin")]
    pub lng_margin_deg: f64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_launch_radius() -> f64 {
    ClusterParams::default().launch_radius_km
}

fn default_route_min_radius() -> f64 {
    ClusterParams::default().route_min_radius_km
}

fn default_route_radius_scale() -> f64 {
    ClusterParams::default().route_radius_scale
}

fn default_lat_margin() -> f64 {
    ClusterParams::default().lat_margin_deg
}

fn default_lng_margin() -> f64 {
    ClusterParams::default().lng_margin_deg
}

fn default_max_rounds() -> usize {
    ClusterParams::default().max_rounds
}

impl Default for Settings {
    fn default() -> Self {
        let params = ClusterParams::default();
        Self {
            db_path: None,
            launch_radius_km: params.launch_radius_km,
            route_min_radius_km: params.route_min_radius_km,
            route_radius_scale: params.route_radius_scale,
            lat_margin_deg: params.lat_margin_deg,
            lng_margin_deg: params.lng_margin_deg,
            max_rounds: params.max_rounds,
            log_dir: None,
        }
    }
}

impl Settings {
    /// Load settings from disk or fall back to defaults
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Settings::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                elog!("[Settings] Ignoring invalid {}: {}", path.display(), e);
                Settings::default()
            }),
            Err(e) => {
                elog!("[Settings] Cannot read {}: {}", path.display(), e);
                Settings::default()
            }
        }
    }

    /// Save settings to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn cluster_params(&self) -> ClusterParams {
        ClusterParams {
            launch_radius_km: self.launch_radius_km,
            route_min_radius_km: self.route_min_radius_km,
            route_radius_scale: self.route_radius_scale,
            lat_margin_deg: self.lat_margin_deg,
            lng_margin_deg: self.lng_margin_deg,
            max_rounds: self.max_rounds,
        }
    }

    /// Database location: `--db` flag, then `PARADB_DB`, then the settings
    /// file, then the platform data dir
    pub fn resolve_db_path(&self, cli_db: Option<&Path>) -> PathBuf {
        let env_db = std::env::var(DB_ENV_VAR).ok().filter(|v| !v.is_empty());
        self.resolve_db_path_with(cli_db, env_db.as_deref())
    }

    fn resolve_db_path_with(&self, cli_db: Option<&Path>, env_db: Option<&str>) -> PathBuf {
        if let Some(path) = cli_db {
            return path.to_path_buf();
        }
        if let Some(path) = env_db {
            return PathBuf::from(path);
        }
        if let Some(ref path) = self.db_path {
            return path.clone();
        }
        dirs::data_dir()
            .map(|p| p.join("paradb").join("paradb.db"))
            .unwrap_or_else(|| PathBuf::from("paradb.db"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(crate::logging::default_log_dir)
    }
}

/// `settings.json` in the platform config directory
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("paradb"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("settings.json")
}
