//! Configuration: YAML schema, loading and validation.

pub mod loader;
pub mod schema;

pub use loader::{ConfigLoader, LoadResult, LoadWarning, MAX_CONFIG_SIZE};
pub use schema::{LiveConfig, ServerSection, TapedeckConfig, TapesConfig};
