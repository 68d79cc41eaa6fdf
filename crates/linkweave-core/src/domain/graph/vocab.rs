//! Closed vocabularies used across the graph
//!
//! Every vocabulary is stored as its snake_case string form in SQLite and
//! serialized the same way over JSON.

use serde::{Deserialize, Serialize};

/// Declares a string-backed enum with `as_str`, `parse`, `all` and `Display`
macro_rules! vocabulary {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// Get the string representation
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }

            /// Parse from string
            pub fn parse(s: &str) -> Option<Self> {
                match s.trim().to_lowercase().as_str() {
                    $( $text => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Every value, in declaration order
            pub fn all() -> &'static [$name] {
                &[ $( Self::$variant ),+ ]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

vocabulary! {
    /// Kinds of addressable records
    pub enum NodeType {
        Entity => "entity",
        Document => "document",
        Series => "series",
        Event => "event",
        Project => "project",
        Update => "update",
        Sector => "sector",
        Indicator => "indicator",
        Dataset => "dataset",
        Geography => "geography",
    }
}

impl NodeType {
    /// Whether records of this type carry numeric data
    pub fn is_data_bearing(&self) -> bool {
        matches!(self, Self::Series | Self::Dataset | Self::Indicator)
    }
}

vocabulary! {
    /// Relationship vocabulary
    pub enum LinkType {
        Publishes => "publishes",
        Funds => "funds",
        Implements => "implements",
        LocatedIn => "located_in",
        Mentions => "mentions",
        Measures => "measures",
        Affects => "affects",
        RelatedTo => "related_to",
        Contradicts => "contradicts",
        Supersedes => "supersedes",
        /// Provisional: an update touching a topic
        UpdateSignal => "update_signal",
        /// Provisional: unverified association
        SuspectedLink => "suspected_link",
        /// Provisional: co-occurrence in time
        TemporalCooccurrence => "temporal_cooccurrence",
        Cites => "cites",
        DerivedFrom => "derived_from",
        PartOf => "part_of",
        Regulates => "regulates",
        OperatesIn => "operates_in",
    }
}

impl LinkType {
    /// Provisional types describe inferred rather than asserted relationships
    pub fn is_provisional(&self) -> bool {
        matches!(
            self,
            Self::UpdateSignal | Self::SuspectedLink | Self::TemporalCooccurrence
        )
    }
}

vocabulary! {
    /// How a link was discovered
    pub enum LinkMethod {
        RuleBased => "rule_based",
        ExtractedFromAnchor => "extracted_from_anchor",
        StructuredData => "structured_data",
        TagBased => "tag_based",
        EmbeddingSimilarity => "embedding_similarity",
        Manual => "manual",
        Imported => "imported",
    }
}

vocabulary! {
    /// Link lifecycle status
    pub enum LinkStatus {
        Active => "active",
        NeedsReview => "needs_review",
        Deprecated => "deprecated",
        Rejected => "rejected",
    }
}

impl LinkStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deprecated | Self::Rejected)
    }

    /// Whether an admin may move a link from `self` to `to`
    pub fn can_transition_to(&self, to: LinkStatus) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Deprecated)
                | (Self::Active, Self::NeedsReview)
                | (Self::NeedsReview, Self::Active)
                | (Self::NeedsReview, Self::Rejected)
                | (Self::NeedsReview, Self::Deprecated)
        )
    }
}

vocabulary! {
    /// Discrete confidence derived from strength, ordered lowest first
    pub enum ConfidenceLevel {
        Uncertain => "uncertain",
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

vocabulary! {
    /// Political/administrative regime a link applies to
    pub enum RegimeTag {
        Aden => "aden",
        Sanaa => "sanaa",
        Unified => "unified",
        PreSplit => "pre_split",
    }
}

vocabulary! {
    /// Where a node record came from
    pub enum NodeOrigin {
        Producer => "producer",
        Propagation => "propagation",
        Narrative => "narrative",
    }
}

impl Default for NodeOrigin {
    fn default() -> Self {
        Self::Producer
    }
}

impl NodeOrigin {
    /// Records created inside the engine rather than by producers
    pub fn is_derived(&self) -> bool {
        !matches!(self, Self::Producer)
    }
}

vocabulary! {
    /// Direction of a rule's output link relative to the enriched record
    pub enum RuleDirection {
        /// record -> candidate
        Forward => "forward",
        /// candidate -> record
        Reverse => "reverse",
    }
}

impl Default for RuleDirection {
    fn default() -> Self {
        Self::Forward
    }
}

vocabulary! {
    /// Why a candidate was queued for review
    pub enum ReviewReason {
        BelowThreshold => "below_threshold",
        RuleNotAutoApproving => "rule_not_auto_approving",
        ConflictsWithExisting => "conflicts_with_existing",
    }
}

vocabulary! {
    /// Review priority, ordered lowest first
    pub enum ReviewPriority {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

impl ReviewPriority {
    /// Priority derived from confidence
    pub fn from_confidence(confidence: ConfidenceLevel) -> Self {
        match confidence {
            ConfidenceLevel::High => Self::High,
            ConfidenceLevel::Medium => Self::Medium,
            ConfidenceLevel::Low | ConfidenceLevel::Uncertain => Self::Low,
        }
    }
}

vocabulary! {
    /// Resolution state of a review entry
    pub enum ReviewStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

vocabulary! {
    /// Severity of derived signals, ordered lowest first
    pub enum Severity {
        Info => "info",
        Warning => "warning",
        Critical => "critical",
    }
}

vocabulary! {
    /// What started a rule execution
    pub enum RunTrigger {
        Batch => "batch",
        Manual => "manual",
        OnIngest => "on_ingest",
    }
}

vocabulary! {
    /// Outcome of a rule execution
    pub enum RunStatus {
        Completed => "completed",
        /// Stopped early by deadline, record cap or cancellation
        Partial => "partial",
        Failed => "failed",
    }
}

vocabulary! {
    /// Who is reading related items
    pub enum Audience {
        Public => "public",
        Admin => "admin",
    }
}

vocabulary! {
    pub enum StoryStatus {
        Pending => "pending",
        Ready => "ready",
        Failed => "failed",
    }
}
