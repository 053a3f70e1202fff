//! Centralized path utilities
//!
//! All application paths in one place for consistency

use std::path::PathBuf;

const CONFIG_DIR_NAME: &str = ".stratum";

/// Get the stratum config directory (~/.stratum)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Get the config file path (~/.stratum/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the logs directory (~/.stratum/logs)
pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}

/// Get the default plan database path (~/.stratum/plans.db)
pub fn default_database_path() -> PathBuf {
    config_dir().join("plans.db")
}

/// Ensure the parent directory of `path` exists, creating it if necessary
pub fn ensure_parent_dir(path: &std::path::Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
