/// Server operations consumed by the engine and their error taxonomy.
pub mod api;
/// HTTP implementation of the server operations.
#[cfg(feature = "http-api")]
pub mod http;
/// Simulated in-process server.
pub mod memory;
/// Wire model definitions.
pub mod models;
