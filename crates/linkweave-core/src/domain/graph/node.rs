//! Node references and the producer-supplied record surface
//!
//! The engine never holds object references between nodes. Everything is
//! addressed by `(node_type, node_id)` and resolved through the store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::vocab::{NodeOrigin, NodeType};

/// Identity of any addressable record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub node_type: NodeType,
    pub node_id: String,
}

impl NodeRef {
    pub fn new(node_type: NodeType, node_id: impl Into<String>) -> Self {
        Self {
            node_type,
            node_id: node_id.into(),
        }
    }

    /// Sector nodes use the sector code as their id
    pub fn sector(code: impl Into<String>) -> Self {
        Self::new(NodeType::Sector, code)
    }

    /// Parse the `type:id` form used on the command line
    pub fn parse(s: &str) -> Option<Self> {
        let (node_type, node_id) = s.split_once(':')?;
        let node_type = NodeType::parse(node_type)?;
        if node_id.is_empty() {
            return None;
        }
        Some(Self::new(node_type, node_id))
    }

    /// Fallback label when no display label is known
    pub fn default_label(&self) -> String {
        format!("{} #{}", self.node_type, self.node_id)
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node_type, self.node_id)
    }
}

/// A citation anchor extracted from a record, pointing at another node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationAnchor {
    /// Anchor kind, e.g. `entity_mention` or `table_reference`
    pub anchor_type: String,
    pub target: NodeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Similarity to another node, computed outside the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScore {
    pub node: NodeRef,
    pub score: f64,
}

/// A record as registered by a producer
///
/// This is the matching surface: text, tags, metadata, identifiers, anchors
/// and optional precomputed similarities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(flatten)]
    pub node: NodeRef,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub sectors: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub identifiers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub anchors: Vec<CitationAnchor>,
    #[serde(default)]
    pub similarities: Vec<SimilarityScore>,
    /// Additional node types this record also acts as
    #[serde(default)]
    pub roles: Vec<NodeType>,
    #[serde(default)]
    pub origin: NodeOrigin,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(node_type: NodeType, node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node: NodeRef::new(node_type, node_id),
            label: None,
            body: None,
            tags: Vec::new(),
            sectors: Vec::new(),
            metadata: serde_json::Map::new(),
            identifiers: BTreeMap::new(),
            anchors: Vec::new(),
            similarities: Vec::new(),
            roles: Vec::new(),
            origin: NodeOrigin::Producer,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sectors<I, S>(mut self, sectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sectors = sectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_identifier(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers
            .entry(field.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_anchor(mut self, anchor_type: impl Into<String>, target: NodeRef) -> Self {
        self.anchors.push(CitationAnchor {
            anchor_type: anchor_type.into(),
            target,
            snippet: None,
        });
        self
    }

    pub fn with_similarity(mut self, node: NodeRef, score: f64) -> Self {
        self.similarities.push(SimilarityScore { node, score });
        self
    }

    pub fn with_role(mut self, role: NodeType) -> Self {
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
        self
    }

    pub fn with_origin(mut self, origin: NodeOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Display label, falling back to `type #id`
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.node.default_label())
    }

    /// Every node type the record acts as
    ///
    /// A document quoting numeric claims also acts as a dataset.
    pub fn applicable_types(&self) -> Vec<NodeType> {
        let mut types = vec![self.node.node_type];
        for role in &self.roles {
            if !types.contains(role) {
                types.push(*role);
            }
        }
        let quotes_numbers = self
            .metadata
            .get("numeric_claims")
            .and_then(Value::as_array)
            .is_some_and(|claims| !claims.is_empty());
        if self.node.node_type == NodeType::Document
            && quotes_numbers
            && !types.contains(&NodeType::Dataset)
        {
            types.push(NodeType::Dataset);
        }
        types
    }

    /// Whether the record has any text to match against
    pub fn has_text(&self) -> bool {
        self.label.as_deref().is_some_and(|s| !s.trim().is_empty())
            || self.body.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    /// Lowercased label and body joined for containment checks
    pub fn searchable_text(&self) -> String {
        let mut text = String::new();
        if let Some(label) = &self.label {
            text.push_str(&label.to_lowercase());
        }
        if let Some(body) = &self.body {
            text.push('\n');
            text.push_str(&body.to_lowercase());
        }
        text
    }

    /// Normalized tags, sectors and, for sector nodes, the sector code itself
    pub fn tag_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self
            .tags
            .iter()
            .chain(self.sectors.iter())
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if self.node.node_type == NodeType::Sector {
            keys.insert(self.node.node_id.trim().to_lowercase());
        }
        keys
    }

    /// Precomputed similarity to another node, if the producer supplied one
    pub fn similarity_to(&self, other: &NodeRef) -> Option<f64> {
        self.similarities
            .iter()
            .find(|s| &s.node == other)
            .map(|s| s.score)
    }

    /// Metadata value as a trimmed string, if present
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        match self.metadata.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}
