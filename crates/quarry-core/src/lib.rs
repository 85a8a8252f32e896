//! Configuration loading and component wiring for the quarry binary.

pub mod bootstrap;
pub mod config;

pub use bootstrap::{App, create_embedder, resolve_config_path};
pub use config::Config;
