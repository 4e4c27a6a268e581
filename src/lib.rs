// Library root. Exposes the pipeline to the binary and integration tests.
// The binary entry point is src/main.rs.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod subsystems;
