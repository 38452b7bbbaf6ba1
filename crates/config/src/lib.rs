//! Configuration loading: file discovery, `${ENV}` substitution and
//! deployment environment overrides.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{apply_env_overrides, config_dir, discover_and_load, discover_in, load_config, to_toml},
    schema::{BeaconConfig, GatewayConfig, ServerConfig, StoreConfig},
};
