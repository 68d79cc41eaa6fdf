//! Derived signals: timeline events and sector signals

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeRef;
use super::vocab::{LinkType, NodeType, Severity};

/// What caused a timeline event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    LinkDiscovered,
    DataUpdate,
    Publication,
    EntityAction,
}

impl TimelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinkDiscovered => "link_discovered",
            Self::DataUpdate => "data_update",
            Self::Publication => "publication",
            Self::EntityAction => "entity_action",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "link_discovered" => Some(Self::LinkDiscovered),
            "data_update" => Some(Self::DataUpdate),
            "publication" => Some(Self::Publication),
            "entity_action" => Some(Self::EntityAction),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timeline event derived from a new link or a newly observed record
///
/// At most one exists per (origin, subject); the store enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    /// Link id or record ref that produced the event
    pub origin_key: String,
    pub kind: TimelineKind,
    pub subject: NodeRef,
    pub subject_label: Option<String>,
    pub link_type: Option<LinkType>,
    pub evidence: Option<String>,
    pub severity: Severity,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl TimelineEvent {
    pub fn new(
        origin_key: impl Into<String>,
        kind: TimelineKind,
        subject: NodeRef,
        severity: Severity,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin_key: origin_key.into(),
            kind,
            subject,
            subject_label: None,
            link_type: None,
            evidence: None,
            severity,
            title: title.into(),
            created_at: Utc::now(),
        }
    }

    /// The event's own node identity, so it can be linked like any record
    pub fn node(&self) -> NodeRef {
        NodeRef::new(NodeType::Event, self.id.clone())
    }
}

/// A sector-level alert raised by a severe timeline event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorSignal {
    pub id: String,
    pub timeline_event_id: String,
    pub sector: String,
    pub severity: Severity,
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// Read or expired; unread signals are the active ones
    #[serde(default)]
    pub is_read: bool,
}

impl SectorSignal {
    pub fn new(event: &TimelineEvent, sector: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timeline_event_id: event.id.clone(),
            sector: sector.into(),
            severity: event.severity,
            title: event.title.clone(),
            created_at: Utc::now(),
            is_read: false,
        }
    }

    pub fn node(&self) -> NodeRef {
        NodeRef::new(NodeType::Update, self.id.clone())
    }
}

/// Which sector signals to list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalFilter {
    /// Sector codes to keep; empty means every sector
    pub sectors: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub unread_only: bool,
    pub limit: Option<u32>,
}

impl SignalFilter {
    /// Unread signals created at or after `since`
    pub fn active_since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            unread_only: true,
            ..Self::default()
        }
    }

    pub fn sectors<I, S>(mut self, sectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sectors = sectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Totals over propagation output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropagationStats {
    pub total_events: i64,
    pub total_signals: i64,
    /// Unread signals
    pub active_signals: i64,
    pub events_by_kind: BTreeMap<String, i64>,
    /// Unread signals per sector
    pub signals_by_sector: BTreeMap<String, i64>,
}

/// Sectors implied by an entity's `entity_type` metadata
pub fn sectors_for_entity_type(entity_type: &str) -> &'static [&'static str] {
    match entity_type.trim().to_lowercase().as_str() {
        "bank" => &["banking", "finance"],
        "government" => &["governance", "fiscal"],
        "ngo" => &["humanitarian", "aid_flows"],
        "international_org" => &["aid_flows", "humanitarian"],
        "private_sector" => &["trade", "private_sector"],
        _ => &[],
    }
}
