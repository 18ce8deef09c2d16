//! Domain layer: models, ports, and the core error taxonomy.

pub mod errors;
pub mod models;
pub mod ports;
