//! Link graph domain module
//!
//! Records produced by upstream systems (documents, entities, series, events,
//! and so on) are registered as nodes, then enriched with typed, scored,
//! evidenced links:
//!
//! - **Rule engine**: configurable match rules propose candidate links
//! - **Scoring**: strength is banded into confidence; writes are deduplicated
//! - **Review queue**: low-confidence or non-auto rules wait for a reviewer
//! - **Propagation**: new links and records fan out into timeline events and
//!   sector signals
//! - **Related items**: cached "what is this connected to" reads
//! - **Health**: coverage and distribution snapshots of the graph
//! - **Stories**: generated narratives over a node's neighbourhood
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Enrichment pipeline                      │
//! │  NodeRecord → RuleEngine → LinkWriter → [Link | ReviewEntry]  │
//! └──────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Fan-out                              │
//! │  Link created → EventPropagator → TimelineEvent → SectorSignal│
//! │             → related-items cache invalidation                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use linkweave_core::domain::graph::{GraphService, NodeRecord, NodeType};
//!
//! let service = GraphService::new(repository, &config, generator);
//! service.seed_default_rules().await?;
//!
//! let record = NodeRecord::new(NodeType::Document, "q3-report")
//!     .with_label("Q3 Report")
//!     .with_tags(["banking"]);
//! let summary = service.ingest_record(record).await?;
//! println!("{} links created", summary.enrichment.links_created);
//! ```

mod event;
mod health;
mod link;
mod locks;
mod matcher;
mod node;
mod orchestrator;
mod propagation;
mod related;
mod repository;
mod review;
mod review_queue;
mod rule;
mod rule_engine;
mod scoring;
mod service;
mod signal;
mod story;
mod vocab;

pub use event::{DEFAULT_EVENT_CAPACITY, EventBuffer, GraphEvent};
pub use health::{HealthMetrics, HealthSnapshot, NodeCoverage, PublicHealthSummary};
pub use link::{
    CandidateLink, ConfidenceBands, Evidence, Link, LinkFilter, LinkKey, LinkStats, LinkWrite,
    clamp_strength,
};
pub use matcher::{MatchEvidence, MatchOutcome};
pub use node::{CitationAnchor, NodeRecord, NodeRef, SimilarityScore};
pub use orchestrator::{
    BatchFilter, BatchSummary, EnrichOptions, EnrichmentOrchestrator, EnrichmentSummary,
    RecordError, StopReason,
};
pub use propagation::{EventPropagator, PropagationOutcome, PropagationStage};
pub use related::{LinkDirection, RelatedItem, RelatedItems, RelatedItemsService, RelatedQuery};
pub use repository::{
    CacheRepository, CandidateFilter, CandidateQuery, GraphRepository, LinkRepository,
    MetricsRepository, NodeRepository, ReviewRepository, RuleRepository, SignalRepository,
    StoryRepository,
};
pub use review::{ReviewEntry, ReviewResolution};
pub use review_queue::ReviewQueue;
pub use rule::{
    FieldSpec, LinkRule, MatchLogic, NewRule, RuleRun, RuleStats, RunError, StrengthFormula,
    default_rules,
};
pub use rule_engine::{Proposal, RuleEngine, RuleEvaluation};
pub use scoring::{DiscardReason, LinkWriter, WriteOutcome, WritePolicy};
pub use service::{GraphService, IngestSummary};
pub use signal::{PropagationStats, SectorSignal, SignalFilter, TimelineEvent, TimelineKind};
pub use story::{
    Narrative, NarrativeGenerator, NarrativePrompt, Story, StoryFilter, StoryRequest, StoryService,
};
pub use vocab::{
    Audience, ConfidenceLevel, LinkMethod, LinkStatus, LinkType, NodeOrigin, NodeType, RegimeTag,
    ReviewPriority, ReviewReason, ReviewStatus, RuleDirection, RunStatus, RunTrigger, Severity,
    StoryStatus,
};
