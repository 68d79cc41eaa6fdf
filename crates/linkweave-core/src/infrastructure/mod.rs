//! Infrastructure layer
//!
//! SQLite implementations of the graph repository traits and the HTTP
//! narrative generator.

pub mod graph;
pub mod narrative;

pub use graph::SqliteGraphRepository;
