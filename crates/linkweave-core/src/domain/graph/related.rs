//! Related-items views and their "why linked" explanations

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::link::{Link, LinkFilter};
use super::node::NodeRef;
use super::repository::GraphRepository;
use super::vocab::{Audience, ConfidenceLevel, LinkMethod, LinkType, NodeType};
use crate::error::Result;

/// Direction of a related item's link relative to the queried node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDirection {
    Outgoing,
    Incoming,
}

/// One item in a related-items group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedItem {
    pub node: NodeRef,
    pub label: String,
    pub link_id: String,
    pub link_type: LinkType,
    pub strength: f64,
    pub confidence: ConfidenceLevel,
    pub direction: LinkDirection,
    pub why_linked: String,
}

impl RelatedItem {
    /// Build the item describing `link` as seen from `from`
    pub fn from_link(link: &Link, from: &NodeRef) -> Option<Self> {
        let (other, label) = link.other_end(from)?;
        let direction = if &link.src == from {
            LinkDirection::Outgoing
        } else {
            LinkDirection::Incoming
        };
        Some(Self {
            node: other.clone(),
            label: label
                .map(str::to_string)
                .unwrap_or_else(|| other.default_label()),
            link_id: link.id.clone(),
            link_type: link.link_type,
            strength: link.strength,
            confidence: link.confidence,
            direction,
            why_linked: why_linked(link.link_type, link.method, link.confidence),
        })
    }
}

/// Top related items for a node, grouped by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedItems {
    pub node: NodeRef,
    pub documents: Vec<RelatedItem>,
    pub entities: Vec<RelatedItem>,
    /// Series, datasets and indicators
    pub datasets: Vec<RelatedItem>,
    /// Events and updates
    pub events: Vec<RelatedItem>,
    /// Projects, sectors and geographies
    pub other: Vec<RelatedItem>,
    pub contradictions: Vec<RelatedItem>,
    pub computed_at: DateTime<Utc>,
    #[serde(default)]
    pub from_cache: bool,
}

impl RelatedItems {
    /// Group links around `node`, strongest first, capped per group
    pub fn build(node: &NodeRef, links: &[Link], max_items: usize) -> Self {
        let mut items = Self {
            node: node.clone(),
            documents: Vec::new(),
            entities: Vec::new(),
            datasets: Vec::new(),
            events: Vec::new(),
            other: Vec::new(),
            contradictions: Vec::new(),
            computed_at: Utc::now(),
            from_cache: false,
        };

        for link in links {
            let Some(item) = RelatedItem::from_link(link, node) else {
                continue;
            };
            if link.link_type == LinkType::Contradicts {
                items.contradictions.push(item);
                continue;
            }
            match item.node.node_type {
                NodeType::Document => items.documents.push(item),
                NodeType::Entity => items.entities.push(item),
                NodeType::Series | NodeType::Dataset | NodeType::Indicator => {
                    items.datasets.push(item)
                }
                NodeType::Event | NodeType::Update => items.events.push(item),
                NodeType::Project | NodeType::Sector | NodeType::Geography => {
                    items.other.push(item)
                }
            }
        }

        for group in items.groups_mut() {
            group.sort_by(|a, b| {
                b.strength
                    .partial_cmp(&a.strength)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.node.cmp(&b.node))
            });
        }
        items.truncate(max_items);
        items
    }

    /// Cap every group at `max_items`, keeping the strongest
    pub fn truncate(&mut self, max_items: usize) {
        for group in self.groups_mut() {
            group.truncate(max_items);
        }
    }

    fn groups_mut(&mut self) -> [&mut Vec<RelatedItem>; 6] {
        [
            &mut self.documents,
            &mut self.entities,
            &mut self.datasets,
            &mut self.events,
            &mut self.other,
            &mut self.contradictions,
        ]
    }

    pub fn total(&self) -> usize {
        self.documents.len()
            + self.entities.len()
            + self.datasets.len()
            + self.events.len()
            + self.other.len()
            + self.contradictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Whether any group contains `node`
    pub fn contains(&self, node: &NodeRef) -> bool {
        [
            &self.documents,
            &self.entities,
            &self.datasets,
            &self.events,
            &self.other,
            &self.contradictions,
        ]
        .iter()
        .any(|group| group.iter().any(|item| &item.node == node))
    }
}

/// Human-readable justification for a link
pub fn why_linked(link_type: LinkType, method: LinkMethod, confidence: ConfidenceLevel) -> String {
    let base = match link_type {
        LinkType::Publishes => "Published by this organization",
        LinkType::Mentions => "Mentioned in this document",
        LinkType::Funds => "Funded by this donor",
        LinkType::Measures => "Measures this indicator",
        LinkType::Affects => "Affected by this event",
        LinkType::RelatedTo => "Related to this topic",
        LinkType::Contradicts => "Contradicts this source",
        LinkType::Supersedes => "Supersedes previous version",
        LinkType::UpdateSignal => "Triggered by this update",
        LinkType::SuspectedLink => "Potentially related (unverified)",
        LinkType::TemporalCooccurrence => "Occurred around the same time",
        LinkType::Cites => "Cites this source",
        LinkType::DerivedFrom => "Derived from this data",
        LinkType::PartOf => "Part of this organization",
        LinkType::Regulates => "Regulates this entity",
        LinkType::OperatesIn => "Operates in this area",
        LinkType::Implements => "Implemented by this organization",
        LinkType::LocatedIn => "Located in this area",
    };

    let mut text = base.to_string();
    match method {
        LinkMethod::ExtractedFromAnchor => text.push_str(" (extracted from document)"),
        LinkMethod::StructuredData => text.push_str(" (from official records)"),
        LinkMethod::EmbeddingSimilarity => text.push_str(" (semantic similarity)"),
        _ => {}
    }
    match confidence {
        ConfidenceLevel::High => text.push_str(" • High confidence"),
        ConfidenceLevel::Low | ConfidenceLevel::Uncertain => {
            text.push_str(" • Needs verification")
        }
        ConfidenceLevel::Medium => {}
    }
    text
}

/// Options for a related-items read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedQuery {
    pub audience: Audience,
    /// Bypass and refresh the cache
    pub skip_cache: bool,
    pub max_items: usize,
}

impl Default for RelatedQuery {
    fn default() -> Self {
        Self {
            audience: Audience::Public,
            skip_cache: false,
            max_items: 10,
        }
    }
}

/// Cached "top related items" reads
///
/// Populate on miss, invalidate on write, expire on TTL.
pub struct RelatedItemsService<R: GraphRepository + ?Sized> {
    repository: Arc<R>,
    ttl: Duration,
}

impl<R: GraphRepository + ?Sized> RelatedItemsService<R> {
    pub fn new(repository: Arc<R>, ttl_secs: i64) -> Self {
        Self {
            repository,
            ttl: Duration::seconds(ttl_secs.max(0)),
        }
    }

    pub async fn get(&self, node: &NodeRef, query: RelatedQuery) -> Result<RelatedItems> {
        let now = Utc::now();
        if !query.skip_cache {
            match self.repository.get_cached_related(node, query.audience, now).await {
                Ok(Some(mut cached)) => {
                    debug!(node = %node, audience = %query.audience, "Related items served from cache");
                    cached.truncate(query.max_items);
                    cached.from_cache = true;
                    return Ok(cached);
                }
                Ok(None) => {}
                Err(e) => warn!(node = %node, error = %e, "Related-items cache read failed"),
            }
        }

        let mut links = self
            .repository
            .list_links_for_node(node, &LinkFilter::active())
            .await?;
        if query.audience == Audience::Public {
            links.retain(|l| l.public_safe);
        }
        // The cache holds every group in full; callers differ in max_items
        let mut items = RelatedItems::build(node, &links, usize::MAX);

        if self.ttl > Duration::zero()
            && let Err(e) = self
                .repository
                .put_cached_related(&items, query.audience, now + self.ttl)
                .await
        {
            warn!(node = %node, error = %e, "Related-items cache write failed");
        }
        items.truncate(query.max_items);
        Ok(items)
    }

    pub async fn invalidate(&self, nodes: &[NodeRef]) -> Result<u64> {
        self.repository.invalidate_related(nodes).await
    }
}
