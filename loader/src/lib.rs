//! Startup helpers for the `logloader` binary.

use anyhow::{bail, Context, Result};
use logloader_registry::LogRegistry;
use logloader_sync::LoaderConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Config file name looked up in the working directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Returns the config paths to try, in order.
///
/// An explicit path wins outright. Otherwise `./config.toml` is tried, then
/// `<home>/logloader/config.toml`.
pub fn config_candidates(explicit: Option<&Path>, home: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    let mut candidates = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(home) = home {
        candidates.push(home.join("logloader").join(CONFIG_FILE));
    }
    candidates
}

/// Picks the first candidate for which `exists` holds.
pub fn resolve_config_path<F>(
    explicit: Option<&Path>,
    home: Option<&Path>,
    exists: F,
) -> Result<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    let candidates = config_candidates(explicit, home);
    match candidates.iter().find(|path| exists(path)) {
        Some(path) => Ok(path.clone()),
        None => {
            let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
            bail!("no configuration file found (tried {})", tried.join(", "))
        }
    }
}

/// Loads the configuration from the resolved path.
pub fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, LoaderConfig)> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let path = resolve_config_path(explicit, home.as_deref(), Path::exists)?;
    let config = LoaderConfig::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    Ok((path, config))
}

/// Creates the application directories and opens the registry.
pub fn prepare_storage(config: &LoaderConfig) -> Result<LogRegistry> {
    let logs_dir = config.logs_directory();
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("failed to create {}", logs_dir.display()))?;

    let db_path = config.registry_path();
    let registry = LogRegistry::open(&db_path)
        .with_context(|| format!("failed to open registry {}", db_path.display()))?;
    info!("Registry: {}", db_path.display());
    Ok(registry)
}
