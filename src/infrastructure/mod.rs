//! Infrastructure: configuration, logging, and the gateway connection.

pub mod config;
pub mod gateway;
pub mod logging;
