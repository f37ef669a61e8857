pub mod schema;

pub use schema::{Config, RemoteConfig, StorageConfig, CONFIG_DIR_ENV};
