//! Links: typed, directed, scored relationships between nodes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeRef;
use super::vocab::{ConfidenceLevel, LinkMethod, LinkStatus, LinkType, RegimeTag};

/// Strength thresholds for each confidence level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBands {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for ConfidenceBands {
    fn default() -> Self {
        Self {
            high: 0.8,
            medium: 0.5,
            low: 0.3,
        }
    }
}

impl ConfidenceBands {
    /// Map a strength score onto a confidence level
    pub fn classify(&self, strength: f64) -> ConfidenceLevel {
        if strength >= self.high {
            ConfidenceLevel::High
        } else if strength >= self.medium {
            ConfidenceLevel::Medium
        } else if strength >= self.low {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::Uncertain
        }
    }
}

/// Clamp a strength score into `[0, 1]`, mapping NaN to zero
pub fn clamp_strength(strength: f64) -> f64 {
    if strength.is_nan() {
        0.0
    } else {
        strength.clamp(0.0, 1.0)
    }
}

/// Supporting evidence for a link
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Evidence {
    pub fn snippet(snippet: impl Into<String>) -> Self {
        Self {
            snippet: Some(snippet.into()),
            url: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        non_empty(&self.snippet).is_none() && non_empty(&self.url).is_none()
    }

    /// Fold newer evidence in; non-empty newer values win
    ///
    /// Returns true when anything changed.
    pub fn merge(&mut self, newer: &Evidence) -> bool {
        let mut changed = false;
        if let Some(snippet) = non_empty(&newer.snippet)
            && self.snippet.as_deref() != Some(snippet)
        {
            self.snippet = Some(snippet.to_string());
            changed = true;
        }
        if let Some(url) = non_empty(&newer.url)
            && self.url.as_deref() != Some(url)
        {
            self.url = Some(url.to_string());
            changed = true;
        }
        changed
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// The relationship tuple that identifies a link for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    pub link_type: LinkType,
    pub src: NodeRef,
    pub dst: NodeRef,
}

impl LinkKey {
    pub fn new(link_type: LinkType, src: NodeRef, dst: NodeRef) -> Self {
        Self { link_type, src, dst }
    }

    pub fn reversed(&self) -> Self {
        Self {
            link_type: self.link_type,
            src: self.dst.clone(),
            dst: self.src.clone(),
        }
    }

    pub fn is_self_link(&self) -> bool {
        self.src == self.dst
    }

    /// Direction-independent key used to serialize writers
    ///
    /// Both directions of a pair share one lock so bidirectional lookups
    /// cannot race a forward insert.
    pub fn lock_key(&self) -> String {
        let (a, b) = if self.src <= self.dst {
            (&self.src, &self.dst)
        } else {
            (&self.dst, &self.src)
        };
        format!("{}|{}|{}", self.link_type, a, b)
    }
}

impl std::fmt::Display for LinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -[{}]-> {}", self.src, self.link_type, self.dst)
    }
}

/// A proposed link that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateLink {
    pub link_type: LinkType,
    pub src: NodeRef,
    #[serde(default)]
    pub src_label: Option<String>,
    pub dst: NodeRef,
    #[serde(default)]
    pub dst_label: Option<String>,
    pub strength: f64,
    pub method: LinkMethod,
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub evidence: Evidence,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default = "default_public_safe")]
    pub public_safe: bool,
    #[serde(default)]
    pub regime_tag: Option<RegimeTag>,
    #[serde(default)]
    pub created_by: Option<String>,
}

fn default_public_safe() -> bool {
    true
}

impl CandidateLink {
    pub fn new(link_type: LinkType, src: NodeRef, dst: NodeRef, strength: f64) -> Self {
        Self {
            link_type,
            src,
            src_label: None,
            dst,
            dst_label: None,
            strength: clamp_strength(strength),
            method: LinkMethod::RuleBased,
            rule_id: None,
            evidence: Evidence::default(),
            bidirectional: false,
            public_safe: true,
            regime_tag: None,
            created_by: None,
        }
    }

    pub fn with_method(mut self, method: LinkMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_labels(mut self, src_label: Option<String>, dst_label: Option<String>) -> Self {
        self.src_label = src_label;
        self.dst_label = dst_label;
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    pub fn public_safe(mut self, public_safe: bool) -> Self {
        self.public_safe = public_safe;
        self
    }

    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = Some(who.into());
        self
    }

    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.link_type, self.src.clone(), self.dst.clone())
    }

    pub fn is_self_link(&self) -> bool {
        self.src == self.dst
    }

    /// Materialize as a new link row
    pub fn into_link(self, confidence: ConfidenceLevel, status: LinkStatus) -> Link {
        let now = Utc::now();
        Link {
            id: Uuid::new_v4().to_string(),
            link_type: self.link_type,
            src: self.src,
            src_label: self.src_label,
            dst: self.dst,
            dst_label: self.dst_label,
            strength: clamp_strength(self.strength),
            confidence,
            method: self.method,
            status,
            evidence: self.evidence,
            rule_id: self.rule_id,
            bidirectional: self.bidirectional,
            public_safe: self.public_safe,
            regime_tag: self.regime_tag,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub link_type: LinkType,
    pub src: NodeRef,
    pub src_label: Option<String>,
    pub dst: NodeRef,
    pub dst_label: Option<String>,
    pub strength: f64,
    pub confidence: ConfidenceLevel,
    pub method: LinkMethod,
    pub status: LinkStatus,
    pub evidence: Evidence,
    pub rule_id: Option<String>,
    pub bidirectional: bool,
    pub public_safe: bool,
    pub regime_tag: Option<RegimeTag>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Link {
    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.link_type, self.src.clone(), self.dst.clone())
    }

    /// Whether this link satisfies a lookup for `key`
    ///
    /// Bidirectional links also answer the reverse tuple.
    pub fn answers(&self, key: &LinkKey) -> bool {
        if self.link_type != key.link_type {
            return false;
        }
        let forward = self.src == key.src && self.dst == key.dst;
        let reverse = self.src == key.dst && self.dst == key.src;
        forward || (self.bidirectional && reverse)
    }

    /// The endpoint opposite to `node`, if `node` is an endpoint
    pub fn other_end(&self, node: &NodeRef) -> Option<(&NodeRef, Option<&str>)> {
        if &self.src == node {
            Some((&self.dst, self.dst_label.as_deref()))
        } else if &self.dst == node {
            Some((&self.src, self.src_label.as_deref()))
        } else {
            None
        }
    }

    /// Fold a re-discovered candidate into this link
    ///
    /// Strength takes the maximum of old and new; evidence keeps the most
    /// recent non-empty values. Returns true when any field changed.
    pub fn absorb(&mut self, candidate: &CandidateLink, bands: &ConfidenceBands) -> bool {
        let mut changed = false;
        let strength = clamp_strength(candidate.strength);
        if strength > self.strength {
            self.strength = strength;
            self.confidence = bands.classify(strength);
            changed = true;
        }
        changed |= self.evidence.merge(&candidate.evidence);
        if self.src_label.is_none() && candidate.src_label.is_some() && self.src == candidate.src {
            self.src_label = candidate.src_label.clone();
            changed = true;
        }
        if self.dst_label.is_none() && candidate.dst_label.is_some() && self.dst == candidate.dst {
            self.dst_label = candidate.dst_label.clone();
            changed = true;
        }
        self.updated_at = Utc::now();
        changed
    }

    pub fn nodes(&self) -> [NodeRef; 2] {
        [self.src.clone(), self.dst.clone()]
    }
}

/// Filter for "links for node" queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkFilter {
    /// Empty means every type
    #[serde(default)]
    pub link_types: Vec<LinkType>,
    /// Empty means active only
    #[serde(default)]
    pub statuses: Vec<LinkStatus>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl LinkFilter {
    pub fn active() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, link_types: Vec<LinkType>) -> Self {
        self.link_types = link_types;
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<LinkStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn effective_statuses(&self) -> Vec<LinkStatus> {
        if self.statuses.is_empty() {
            vec![LinkStatus::Active]
        } else {
            self.statuses.clone()
        }
    }
}

/// A link row write applied as one unit
#[derive(Debug, Clone)]
pub enum LinkWrite {
    Insert(Link),
    Update(Link),
}

impl LinkWrite {
    pub fn link(&self) -> &Link {
        match self {
            Self::Insert(link) | Self::Update(link) => link,
        }
    }
}

/// Aggregate counts over the link store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkStats {
    pub total: i64,
    pub active: i64,
    pub needs_review: i64,
    pub deprecated: i64,
    pub rejected: i64,
    pub active_with_evidence: i64,
    /// Active links extracted from citation anchors
    pub active_from_anchor: i64,
    pub average_active_strength: f64,
    pub type_distribution: Vec<(LinkType, i64)>,
}
