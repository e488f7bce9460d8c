//! SQLite persistence for the runtime engine.
//!
//! A single store backs every repository interface the pipeline
//! consumes. Page transactions are plain `BEGIN IMMEDIATE .. COMMIT`
//! scopes; the single-writer-per-user contract makes that sound.

pub mod schema;
pub mod store;

pub use schema::{initialize_schema, SCHEMA_VERSION};
pub use store::SqliteRuntimeStore;
