//! Configuration loading for Orchestra.
//!
//! Reads `config.toml` from the data directory (`~/.orchestra/` by default)
//! and deserializes it into [`OrchestraConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::{Path, PathBuf};

use orchestra_types::config::OrchestraConfig;

pub const DATA_DIR_ENV: &str = "ORCHESTRA_DATA_DIR";

/// Resolve the data directory.
///
/// Priority:
/// 1. `ORCHESTRA_DATA_DIR` environment variable
/// 2. `~/.orchestra`
/// 3. `.orchestra` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".orchestra");
    }
    PathBuf::from(".orchestra")
}

/// Load `{data_dir}/config.toml`.
///
/// A missing file yields the defaults silently; an unreadable or invalid one
/// yields the defaults with a warning. Relative key paths in `[audit]` are
/// resolved against `data_dir`.
pub async fn load_config(data_dir: &Path) -> OrchestraConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return OrchestraConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return OrchestraConfig::default();
        }
    };

    let mut config = match toml::from_str::<OrchestraConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            return OrchestraConfig::default();
        }
    };

    for path in [
        &mut config.audit.signing_key_path,
        &mut config.audit.verify_key_path,
    ]
    .into_iter()
    .flatten()
    {
        if path.is_relative() {
            *path = data_dir.join(&*path);
        }
    }
    config
}
