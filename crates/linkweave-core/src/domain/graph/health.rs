//! Health metrics over the link store
//!
//! Snapshots are append-only; `latest()` never recomputes.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::link::LinkStats;
use super::repository::GraphRepository;
use super::vocab::NodeType;
use crate::error::Result;

/// Coverage of one node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCoverage {
    pub node_type: NodeType,
    pub total_nodes: i64,
    /// Nodes with at least one active link
    pub linked_nodes: i64,
    pub coverage_pct: f64,
    pub orphan_nodes: i64,
}

impl NodeCoverage {
    pub fn new(node_type: NodeType, total_nodes: i64, linked_nodes: i64) -> Self {
        Self {
            node_type,
            total_nodes,
            linked_nodes,
            coverage_pct: percent(linked_nodes, total_nodes),
            orphan_nodes: (total_nodes - linked_nodes).max(0),
        }
    }
}

/// `part / whole` as a percentage; zero when `whole` is zero
pub fn percent(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

/// Timestamped aggregate over the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub id: String,
    pub calculated_at: DateTime<Utc>,
    pub total_links: i64,
    pub active_links: i64,
    pub needs_review_links: i64,
    pub deprecated_links: i64,
    pub pending_reviews: i64,
    pub links_with_evidence_pct: f64,
    /// Share of active links extracted from citation anchors
    #[serde(default)]
    pub links_with_anchors_pct: f64,
    /// Share of documents with an active link to a sector
    #[serde(default)]
    pub docs_linked_to_sectors_pct: f64,
    pub average_strength: f64,
    pub link_type_distribution: BTreeMap<String, i64>,
    pub coverage: Vec<NodeCoverage>,
}

impl HealthSnapshot {
    /// Assemble a snapshot from raw counts
    pub fn from_counts(
        stats: &LinkStats,
        pending_reviews: i64,
        node_counts: &BTreeMap<NodeType, (i64, i64)>,
    ) -> Self {
        let average_strength = if stats.active > 0 && stats.average_active_strength.is_finite() {
            stats.average_active_strength
        } else {
            0.0
        };
        let coverage = NodeType::all()
            .iter()
            .map(|node_type| {
                let (total, linked) = node_counts.get(node_type).copied().unwrap_or((0, 0));
                NodeCoverage::new(*node_type, total, linked)
            })
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            calculated_at: Utc::now(),
            total_links: stats.total,
            active_links: stats.active,
            needs_review_links: stats.needs_review,
            deprecated_links: stats.deprecated,
            pending_reviews,
            links_with_evidence_pct: percent(stats.active_with_evidence, stats.active),
            links_with_anchors_pct: percent(stats.active_from_anchor, stats.active),
            docs_linked_to_sectors_pct: 0.0,
            average_strength,
            link_type_distribution: stats
                .type_distribution
                .iter()
                .map(|(t, n)| (t.to_string(), *n))
                .collect(),
            coverage,
        }
    }

    /// Record how many documents link to a sector
    pub fn with_docs_linked_to_sectors(mut self, linked_docs: i64) -> Self {
        let total_docs = self
            .coverage_for(NodeType::Document)
            .map(|c| c.total_nodes)
            .unwrap_or(0);
        self.docs_linked_to_sectors_pct = percent(linked_docs, total_docs);
        self
    }

    pub fn coverage_for(&self, node_type: NodeType) -> Option<&NodeCoverage> {
        self.coverage.iter().find(|c| c.node_type == node_type)
    }

    /// Coverage across all node types together
    pub fn overall_coverage_pct(&self) -> f64 {
        let total: i64 = self.coverage.iter().map(|c| c.total_nodes).sum();
        let linked: i64 = self.coverage.iter().map(|c| c.linked_nodes).sum();
        percent(linked, total)
    }
}

/// Public view: coverage numbers only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicHealthSummary {
    pub calculated_at: DateTime<Utc>,
    pub active_links: i64,
    pub overall_coverage_pct: f64,
    pub coverage: BTreeMap<String, f64>,
}

impl From<&HealthSnapshot> for PublicHealthSummary {
    fn from(snapshot: &HealthSnapshot) -> Self {
        Self {
            calculated_at: snapshot.calculated_at,
            active_links: snapshot.active_links,
            overall_coverage_pct: snapshot.overall_coverage_pct(),
            coverage: snapshot
                .coverage
                .iter()
                .map(|c| (c.node_type.to_string(), c.coverage_pct))
                .collect(),
        }
    }
}

/// Aggregation service
pub struct HealthMetrics<R: GraphRepository + ?Sized> {
    repository: Arc<R>,
}

impl<R: GraphRepository + ?Sized> HealthMetrics<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// One full aggregation pass, appended as a new snapshot
    pub async fn calculate(&self) -> Result<HealthSnapshot> {
        let stats = self.repository.link_stats().await?;
        let pending = self.repository.count_pending_reviews().await?;
        let totals = self.repository.count_nodes_by_type().await?;
        let linked = self.repository.linked_node_counts().await?;
        let docs_to_sectors = self
            .repository
            .count_nodes_linked_to(NodeType::Document, NodeType::Sector)
            .await?;

        let mut node_counts: BTreeMap<NodeType, (i64, i64)> = BTreeMap::new();
        for (node_type, total) in totals {
            node_counts.entry(node_type).or_default().0 = total;
        }
        for (node_type, count) in linked {
            node_counts.entry(node_type).or_default().1 = count;
        }

        let snapshot = HealthSnapshot::from_counts(&stats, pending, &node_counts)
            .with_docs_linked_to_sectors(docs_to_sectors);
        self.repository.append_snapshot(&snapshot).await?;

        info!(
            snapshot_id = %snapshot.id,
            active_links = snapshot.active_links,
            pending_reviews = snapshot.pending_reviews,
            "Health snapshot recorded"
        );
        Ok(snapshot)
    }

    pub async fn latest(&self) -> Result<Option<HealthSnapshot>> {
        self.repository.latest_snapshot().await
    }

    pub async fn history(&self, limit: u32) -> Result<Vec<HealthSnapshot>> {
        self.repository.list_snapshots(limit).await
    }

    /// Latest snapshot reduced to public coverage numbers
    pub async fn public_summary(&self) -> Result<Option<PublicHealthSummary>> {
        Ok(self
            .latest()
            .await?
            .as_ref()
            .map(PublicHealthSummary::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::vocab::LinkType;

    #[test]
    fn test_percent_never_divides_by_zero() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }

    #[test]
    fn test_empty_graph_snapshot() {
        let snapshot = HealthSnapshot::from_counts(&LinkStats::default(), 0, &BTreeMap::new());
        assert_eq!(snapshot.total_links, 0);
        assert_eq!(snapshot.links_with_evidence_pct, 0.0);
        assert_eq!(snapshot.links_with_anchors_pct, 0.0);
        assert_eq!(snapshot.average_strength, 0.0);
        let snapshot = snapshot.with_docs_linked_to_sectors(0);
        assert_eq!(snapshot.docs_linked_to_sectors_pct, 0.0);
        assert_eq!(snapshot.coverage.len(), NodeType::all().len());
        for coverage in &snapshot.coverage {
            assert_eq!(coverage.coverage_pct, 0.0);
            assert!(!coverage.coverage_pct.is_nan());
        }
        assert_eq!(snapshot.overall_coverage_pct(), 0.0);
    }

    #[test]
    fn test_snapshot_from_counts() {
        let stats = LinkStats {
            total: 10,
            active: 8,
            needs_review: 1,
            deprecated: 1,
            rejected: 0,
            active_with_evidence: 2,
            active_from_anchor: 4,
            average_active_strength: 0.7,
            type_distribution: vec![(LinkType::Mentions, 6), (LinkType::RelatedTo, 2)],
        };
        let mut counts = BTreeMap::new();
        counts.insert(NodeType::Document, (4, 3));
        counts.insert(NodeType::Entity, (2, 2));

        let snapshot = HealthSnapshot::from_counts(&stats, 3, &counts).with_docs_linked_to_sectors(1);
        assert_eq!(snapshot.links_with_evidence_pct, 25.0);
        assert_eq!(snapshot.links_with_anchors_pct, 50.0);
        assert_eq!(snapshot.docs_linked_to_sectors_pct, 25.0);
        assert_eq!(snapshot.link_type_distribution["mentions"], 6);

        let docs = snapshot.coverage_for(NodeType::Document).unwrap();
        assert_eq!(docs.coverage_pct, 75.0);
        assert_eq!(docs.orphan_nodes, 1);
        assert!((snapshot.overall_coverage_pct() - 500.0 / 6.0).abs() < 1e-9);

        let public = PublicHealthSummary::from(&snapshot);
        assert_eq!(public.coverage["entity"], 100.0);
        assert_eq!(public.active_links, 8);
    }
}
