pub mod parse;
pub mod types;

pub use parse::{load_config, load_config_str, ConfigError};
pub use types::*;
