//! Configuration module: `HarvestConfig` and its type-safe builder.

pub mod builder;
pub mod types;

pub use builder::{Complete, HarvestConfigBuilder, WithCatalog, WithStorageRoot};
pub use types::{BrowserOptions, HarvestConfig};
