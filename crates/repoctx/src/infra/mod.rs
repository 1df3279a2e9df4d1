//! Infrastructure adapters for configuration, credentials, HTTP, and logging.

pub mod config;
pub mod credentials;
pub mod http;
pub mod logging;
