//! Repository traits for graph persistence
//!
//! The traits abstract over the storage backend. Every method addresses nodes
//! by `(node_type, node_id)`; nothing here holds references between records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

use super::health::HealthSnapshot;
use super::link::{Link, LinkFilter, LinkKey, LinkStats, LinkWrite};
use super::node::{NodeRecord, NodeRef};
use super::related::RelatedItems;
use super::review::ReviewEntry;
use super::rule::{LinkRule, RuleRun};
use super::signal::{PropagationStats, SectorSignal, SignalFilter, TimelineEvent};
use super::story::{Story, StoryFilter};
use super::vocab::{Audience, NodeType, ReviewPriority};

/// Store-side pre-filter applied before full matching
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateFilter {
    /// Label or body contains any keyword (case-insensitive)
    Keywords(Vec<String>),
    /// Shares at least one tag
    AnyTag(Vec<String>),
    /// Shares a value in any of the identifier fields
    Identifiers(Vec<(String, Vec<String>)>),
    /// Metadata field equals the given JSON value, for every pair
    MetadataEquals(Vec<(String, Value)>),
    /// Carries an anchor of a listed type targeting `target`, or is one of
    /// `referenced` (nodes the record itself anchors to)
    Anchored {
        anchor_types: Vec<String>,
        target: NodeRef,
        referenced: Vec<NodeRef>,
    },
    /// Exactly these nodes
    Nodes(Vec<NodeRef>),
}

/// Bounded candidate lookup for one rule and one record
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub node_types: Vec<NodeType>,
    /// The record being enriched
    pub exclude: NodeRef,
    pub filter: CandidateFilter,
    pub limit: u32,
}

/// Repository for producer records
#[async_trait]
pub trait NodeRepository: Send + Sync {
    // ========== Node Operations ==========

    /// Insert or replace a node record; returns true when it was new
    async fn upsert_node(&self, record: &NodeRecord) -> Result<bool>;

    async fn get_node(&self, node: &NodeRef) -> Result<Option<NodeRecord>>;

    /// List nodes, optionally of one type, most recently updated first
    async fn list_nodes(&self, node_type: Option<NodeType>, limit: u32) -> Result<Vec<NodeRecord>>;

    /// Candidate records for a rule, pre-filtered in the store
    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<NodeRecord>>;

    /// References of records changed at or after `since`, oldest first
    ///
    /// Returns refs only so a corrupt row fails its own enrichment rather
    /// than the listing.
    async fn list_changed_since(
        &self,
        node_types: &[NodeType],
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<NodeRef>>;

    async fn count_nodes_by_type(&self) -> Result<Vec<(NodeType, i64)>>;
}

/// Repository for links
#[async_trait]
pub trait LinkRepository: Send + Sync {
    // ========== Link Operations ==========

    /// Insert a link; a unique-index violation surfaces as a database error
    async fn insert_link(&self, link: &Link) -> Result<()>;

    async fn update_link(&self, link: &Link) -> Result<()>;

    async fn get_link(&self, id: &str) -> Result<Option<Link>>;

    /// Every link stored for the tuple, in any status
    ///
    /// With `either_direction`, rows for the reversed tuple are included.
    async fn find_links_for_tuple(&self, key: &LinkKey, either_direction: bool) -> Result<Vec<Link>>;

    /// Links with `node` as either endpoint
    async fn list_links_for_node(&self, node: &NodeRef, filter: &LinkFilter) -> Result<Vec<Link>>;

    async fn link_stats(&self) -> Result<LinkStats>;

    /// Registered nodes per type having at least one active link
    async fn linked_node_counts(&self) -> Result<Vec<(NodeType, i64)>>;

    /// Nodes of type `from` with an active link to or from any node of type `to`
    async fn count_nodes_linked_to(&self, from: NodeType, to: NodeType) -> Result<i64>;
}

/// Repository for rules and their run audit
#[async_trait]
pub trait RuleRepository: Send + Sync {
    // ========== Rule Operations ==========

    /// Insert or update a rule by id
    async fn save_rule(&self, rule: &LinkRule) -> Result<()>;

    async fn get_rule(&self, id: &str) -> Result<Option<LinkRule>>;

    async fn get_rule_by_key(&self, key: &str) -> Result<Option<LinkRule>>;

    /// Rules ordered by priority, highest first
    async fn list_rules(&self, enabled_only: bool) -> Result<Vec<LinkRule>>;

    // ========== Rule Run Operations ==========

    async fn record_rule_run(&self, run: &RuleRun) -> Result<()>;

    /// Most recent runs first
    async fn list_rule_runs(&self, rule_id: Option<&str>, limit: u32) -> Result<Vec<RuleRun>>;
}

/// Repository for the review queue
#[async_trait]
pub trait ReviewRepository: Send + Sync {
    // ========== Review Operations ==========

    async fn insert_review(&self, entry: &ReviewEntry) -> Result<()>;

    async fn update_review(&self, entry: &ReviewEntry) -> Result<()>;

    async fn get_review(&self, id: &str) -> Result<Option<ReviewEntry>>;

    /// Every entry for the exact tuple, in any status
    async fn find_reviews_for_tuple(&self, key: &LinkKey) -> Result<Vec<ReviewEntry>>;

    /// Pending entries, high priority first, then oldest first
    async fn list_pending_reviews(
        &self,
        priority: Option<ReviewPriority>,
        limit: u32,
    ) -> Result<Vec<ReviewEntry>>;

    /// Write the link and mark the entry approved in one transaction
    async fn commit_approval(&self, entry: &ReviewEntry, write: &LinkWrite) -> Result<()>;

    async fn count_pending_reviews(&self) -> Result<i64>;
}

/// Repository for the related-items cache
#[async_trait]
pub trait CacheRepository: Send + Sync {
    // ========== Cache Operations ==========

    /// Cached entry that has not expired at `now`
    async fn get_cached_related(
        &self,
        node: &NodeRef,
        audience: Audience,
        now: DateTime<Utc>,
    ) -> Result<Option<RelatedItems>>;

    async fn put_cached_related(
        &self,
        items: &RelatedItems,
        audience: Audience,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Drop every audience's entry for each node
    async fn invalidate_related(&self, nodes: &[NodeRef]) -> Result<u64>;
}

/// Repository for health snapshots
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    // ========== Snapshot Operations ==========

    async fn append_snapshot(&self, snapshot: &HealthSnapshot) -> Result<()>;

    async fn latest_snapshot(&self) -> Result<Option<HealthSnapshot>>;

    /// Most recent first
    async fn list_snapshots(&self, limit: u32) -> Result<Vec<HealthSnapshot>>;
}

/// Repository for propagation output
#[async_trait]
pub trait SignalRepository: Send + Sync {
    // ========== Timeline Operations ==========

    /// Insert unless one exists for the same origin and subject
    ///
    /// Returns true when a row was written.
    async fn insert_timeline_event(&self, event: &TimelineEvent) -> Result<bool>;

    async fn find_timeline_event(
        &self,
        origin_key: &str,
        subject: &NodeRef,
    ) -> Result<Option<TimelineEvent>>;

    /// Most recent first
    async fn list_timeline_events(
        &self,
        subject: Option<&NodeRef>,
        limit: u32,
    ) -> Result<Vec<TimelineEvent>>;

    // ========== Sector Signal Operations ==========

    /// Insert unless one exists for the same event and sector
    async fn insert_sector_signal(&self, signal: &SectorSignal) -> Result<bool>;

    /// Signals matching `filter`, most recent first
    async fn list_sector_signals(&self, filter: &SignalFilter) -> Result<Vec<SectorSignal>>;

    /// Mark unread signals created before `before` as read; returns how many changed
    async fn expire_sector_signals(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn propagation_stats(&self) -> Result<PropagationStats>;
}

/// Repository for narrative stories
#[async_trait]
pub trait StoryRepository: Send + Sync {
    // ========== Story Operations ==========

    /// Insert or update a story by id
    async fn save_story(&self, story: &Story) -> Result<()>;

    async fn get_story(&self, id: &str) -> Result<Option<Story>>;

    async fn list_stories(&self, filter: &StoryFilter) -> Result<Vec<Story>>;
}

/// Everything the engine needs from one backing store
pub trait GraphRepository:
    NodeRepository
    + LinkRepository
    + RuleRepository
    + ReviewRepository
    + CacheRepository
    + MetricsRepository
    + SignalRepository
    + StoryRepository
{
}

impl<T> GraphRepository for T where
    T: NodeRepository
        + LinkRepository
        + RuleRepository
        + ReviewRepository
        + CacheRepository
        + MetricsRepository
        + SignalRepository
        + StoryRepository
{
}
