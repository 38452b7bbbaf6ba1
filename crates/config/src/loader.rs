use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::BeaconConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["beacon.toml", "beacon.yaml", "beacon.yml", "beacon.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<BeaconConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply
/// environment overrides.
///
/// Search order:
/// 1. `./beacon.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/beacon/beacon.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `BeaconConfig::default()` if nothing is found or the file
/// fails to parse.
pub fn discover_and_load() -> BeaconConfig {
    let mut config = discover_in(&search_dirs());
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Load the first config file found in `dirs`, or defaults.
pub fn discover_in(dirs: &[PathBuf]) -> BeaconConfig {
    let Some(path) = find_config_file(dirs) else {
        debug!("no config file found, using defaults");
        return BeaconConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            BeaconConfig::default()
        },
    }
}

/// Apply the deployment environment on top of file config:
/// `PORT`, `REDIS_URL` and `ALLOWED_ORIGIN` (appended to the allow-list).
pub fn apply_env_overrides(config: &mut BeaconConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(port) = lookup("PORT").filter(|v| !v.is_empty()) {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => warn!(value = %port, "ignoring invalid PORT"),
        }
    }
    if let Some(url) = lookup("REDIS_URL").filter(|v| !v.is_empty()) {
        config.store.url = url;
    }
    if let Some(origin) = lookup("ALLOWED_ORIGIN").filter(|v| !v.is_empty())
        && !config.server.allowed_origins.contains(&origin)
    {
        config.server.allowed_origins.push(origin);
    }
}

fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(".")];
    if let Some(dir) = config_dir() {
        dirs.push(dir);
    }
    dirs
}

fn find_config_file(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)))
        .find(|p| p.exists())
}

/// Returns the user-global config directory: `~/.config/beacon/`.
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("beacon"))
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<BeaconConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Render config as TOML (for `beacon config show`).
pub fn to_toml(config: &BeaconConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))
}
