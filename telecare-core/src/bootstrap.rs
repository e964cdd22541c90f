//! Configuration loading

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `explicit_path`, else the TELECARE_CONFIG_PATH environment variable
/// 2. ./telecare.yaml (current working directory)
/// 3. Fall back to environment variables only
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let requested = explicit_path
        .map(str::to_string)
        .or_else(|| std::env::var("TELECARE_CONFIG_PATH").ok());
    let config_path = resolve_config_path(requested);

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        match Config::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load {path}: {e}");
                eprintln!("Falling back to environment variables");
                Config::from_env().unwrap_or_default()
            }
        }
    } else {
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!("Configuration loaded and validated");
    Ok(config)
}

/// Requested path if it exists, otherwise `./telecare.yaml` if present.
/// A requested path that is missing is reported, never silently skipped.
fn resolve_config_path(requested: Option<String>) -> Option<String> {
    if let Some(path) = requested {
        if Path::new(&path).exists() {
            return Some(path);
        }
        eprintln!("Config file {path} does not exist, falling back");
        warn!(path = %path, "Requested config file does not exist");
    }

    let cwd = "telecare.yaml";
    Path::new(cwd).exists().then(|| cwd.to_string())
}
