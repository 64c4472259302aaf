mod clover_config;
mod constants;

pub use clover_config::*;
pub use constants::*;
