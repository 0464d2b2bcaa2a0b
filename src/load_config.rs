use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use print_audit_core::config::Config;
use tracing::{error, info, warn};

/// Environment variable holding the Fernet key.
pub const FERNET_KEY_ENV: &str = "FERNET_KEY";
/// Environment variable holding the SFTP password (password login only).
pub const SFTP_PASSWORD_ENV: &str = "PRINT_AUDIT_SFTP_PASSWORD";

/// Loads a static YAML config file. Secrets are never read from it; see
/// [`fernet_key`] and [`sftp_password`].
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    // An empty file is a valid "all defaults" config.
    if config_content.trim().is_empty() {
        warn!(config_path = ?path_ref, "Config file is empty; using defaults");
        return Ok(Config::default());
    }

    let config: Config = serde_yaml::from_str(&config_content)
        .map_err(|e| {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            e
        })
        .with_context(|| format!("Failed to parse config YAML {:?}", path_ref))?;
    info!(config_path = ?path_ref, "Parsed config YAML successfully");
    Ok(config)
}

/// The file at `path` when given, otherwise built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            info!("No config file given; using defaults");
            Ok(Config::default())
        }
    }
}

/// The Fernet key from `--fernet-key`, else from the environment. There is no
/// fallback: decrypting with a wrong key would only produce a run of failures.
pub fn fernet_key(flag: Option<&str>) -> Result<String> {
    if let Some(key) = flag.filter(|k| !k.trim().is_empty()) {
        info!("Fernet key taken from command line");
        return Ok(key.trim().to_string());
    }
    match std::env::var(FERNET_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => {
            info!("{} found in env", FERNET_KEY_ENV);
            Ok(key.trim().to_string())
        }
        _ => {
            error!("{} environment variable not set", FERNET_KEY_ENV);
            anyhow::bail!(
                "No decryption key: set {} (or a .env file) or pass --fernet-key",
                FERNET_KEY_ENV
            )
        }
    }
}

pub fn sftp_password() -> Option<String> {
    std::env::var(SFTP_PASSWORD_ENV).ok().filter(|p| !p.is_empty())
}
