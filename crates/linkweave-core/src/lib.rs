//! Linkweave Core Library
//!
//! This crate provides the core functionality for Linkweave, including:
//! - Link rules and the rule engine (keyword, anchor, shared identifier, tag, metadata, embedding)
//! - Confidence scoring and the human review queue
//! - Batch enrichment with per-rule run records
//! - Related-items queries with a TTL cache
//! - Event propagation into timeline events and sector signals
//! - Graph health snapshots
//! - Narrative stories backed by an external generator
//! - Storage (SQLite)

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::graph::{
        GraphService, Link, LinkStatus, LinkType, NodeRecord, NodeRef, NodeType,
    };
    pub use crate::error::{Error, Result};
    pub use crate::infrastructure::SqliteGraphRepository;
    pub use crate::storage::Database;
}
