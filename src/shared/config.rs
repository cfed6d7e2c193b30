use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// Tool and service configuration. Loaded from a JSON file; every field has
/// a default so a missing file yields a usable config.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Session time-to-live in hours.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    /// Root directory holding one descriptor directory per session.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    /// Compose file driving the per-session runtime pair.
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    /// Name prefix for per-session containers and networks.
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    /// First candidate port for backend allocations.
    #[serde(default = "default_base_backend_port")]
    pub base_backend_port: u16,
    /// First candidate port for frontend allocations.
    #[serde(default = "default_base_frontend_port")]
    pub base_frontend_port: u16,
    /// Interval between expiry sweeps in the serving process.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Timeout for health reachability probes.
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    /// Secret for session bearer tokens. Overridable via RESBX_JWT_SECRET.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            sessions_dir: default_sessions_dir(),
            compose_file: default_compose_file(),
            container_prefix: default_container_prefix(),
            base_backend_port: default_base_backend_port(),
            base_frontend_port: default_base_frontend_port(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            jwt_secret: default_jwt_secret(),
            log_dir: default_log_dir(),
        }
    }
}

impl SandboxConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config at {}: {}", path.display(), e))?;
        let mut config: SandboxConfig = serde_json::from_str(&data)
            .map_err(|e| anyhow!("Failed to parse config JSON at {}: {}", path.display(), e))?;

        config.container_prefix = config.container_prefix.trim().to_string();
        if config.container_prefix.is_empty() {
            config.container_prefix = default_container_prefix();
        }
        config.apply_env_overrides();

        Ok(config)
    }

    /// Load the config at the resolved path, falling back to defaults when
    /// no file exists yet.
    pub fn load_or_default() -> Result<Self> {
        let path = resolve_config_path();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("RESBX_JWT_SECRET") {
            if !secret.trim().is_empty() {
                self.jwt_secret = secret;
            }
        }
        if let Ok(dir) = std::env::var("RESBX_SESSIONS_DIR") {
            if !dir.trim().is_empty() {
                self.sessions_dir = expand_path(dir);
            }
        }
    }

    /// Base container name for a session; the runtime pair appends
    /// `_backend` / `_frontend`.
    pub fn container_name(&self, session_id: &str) -> String {
        format!("{}_{}", self.container_prefix, session_id)
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }
}

fn default_ttl_hours() -> i64 {
    72
}

fn default_sessions_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".resbx")
        .join("sessions")
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_container_prefix() -> String {
    "resbx".to_string()
}

fn default_base_backend_port() -> u16 {
    8100
}

fn default_base_frontend_port() -> u16 {
    3100
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_health_timeout_secs() -> u64 {
    5
}

fn default_jwt_secret() -> String {
    "change-this-in-production".to_string()
}

fn default_log_dir() -> String {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".resbx")
        .join("logs")
        .to_string_lossy()
        .into_owned()
}

pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RESBX_CONFIG_PATH") {
        return expand_path(path);
    }
    default_config_path()
}

fn expand_path(input: String) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".resbx")
        .join("resbx.json")
}

fn home_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = SandboxConfig::default();
        assert_eq!(config.ttl_hours, 72);
        assert_eq!(config.container_prefix, "resbx");
        assert_eq!(config.container_name("abc"), "resbx_abc");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"ttl_hours": 24, "container_prefix": " lab "}"#)
                .expect("parse");
        assert_eq!(config.ttl_hours, 24);
        // Trimming happens in load_from_path, raw parse keeps the value.
        assert_eq!(config.container_prefix, " lab ");
        assert_eq!(config.base_backend_port, 8100);
    }
}
