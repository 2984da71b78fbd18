//! Configuration, paths, and logging for the Broadmail relay.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, LogFormat, OperatorConfig, DEFAULT_API_BASE_URL, DEFAULT_LOG_LEVEL,
    DEFAULT_MAX_RETRY_COUNT, DEFAULT_OPERATOR_SUBJECT,
};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;
