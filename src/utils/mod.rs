//! 工具模块

pub mod backoff;
pub mod config;

pub use backoff::{ExponentialBackoff, FixedInterval, IntervalProvider};
pub use config::{CliArgs, ConfigError, MeshgateConfig};
