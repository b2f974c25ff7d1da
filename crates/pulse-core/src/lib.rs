pub mod config;
pub mod types;

pub use config::{ConfigError, PulseConfig};
pub use types::*;
