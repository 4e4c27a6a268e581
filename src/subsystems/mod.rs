//! Pipeline subsystems.

pub mod backup;
pub mod ingest;
pub mod registry;
pub mod runtime;
pub mod sources;
