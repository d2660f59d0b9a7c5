//! Configuration loading and service bootstrap for the mnemo memory store.

pub mod bootstrap;
pub mod config;

pub use bootstrap::{open_service, resolve_config_path};
pub use config::Config;
