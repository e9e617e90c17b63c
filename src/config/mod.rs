pub mod loader;
pub mod models;

pub use loader::ConfigLoader;
pub use models::{Config, EngineConfig, ServerConfig};
