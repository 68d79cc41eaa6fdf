//! Domain events for the link graph
//!
//! Events are collected by the graph service so the host can drain them for
//! audit trails or notifications. The buffer is bounded; past capacity the
//! oldest events are dropped.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::link::Link;
use super::node::NodeRef;
use super::review::ReviewEntry;
use super::signal::{SectorSignal, TimelineEvent};
use super::story::Story;
use super::vocab::{
    ConfidenceLevel, LinkStatus, LinkType, ReviewPriority, ReviewReason, ReviewStatus, Severity,
    StoryStatus,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GraphEvent {
    /// A new active link was written
    LinkCreated {
        link_id: String,
        link_type: LinkType,
        src: NodeRef,
        dst: NodeRef,
        confidence: ConfidenceLevel,
        rule_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Re-discovery refreshed an existing link
    LinkUpdated {
        link_id: String,
        strength: f64,
        timestamp: DateTime<Utc>,
    },
    LinkQueued {
        review_id: String,
        link_type: LinkType,
        src: NodeRef,
        dst: NodeRef,
        reason: ReviewReason,
        priority: ReviewPriority,
        timestamp: DateTime<Utc>,
    },
    LinkStatusChanged {
        link_id: String,
        from: LinkStatus,
        to: LinkStatus,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    ReviewResolved {
        review_id: String,
        status: ReviewStatus,
        reviewer: String,
        link_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    RuleCreated {
        rule_id: String,
        rule_key: String,
        timestamp: DateTime<Utc>,
    },
    TimelineEventCreated {
        event_id: String,
        subject: NodeRef,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },
    SectorSignalCreated {
        signal_id: String,
        sector: String,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },
    StoryGenerated {
        story_id: String,
        status: StoryStatus,
        timestamp: DateTime<Utc>,
    },
}

impl GraphEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::LinkCreated { timestamp, .. }
            | Self::LinkUpdated { timestamp, .. }
            | Self::LinkQueued { timestamp, .. }
            | Self::LinkStatusChanged { timestamp, .. }
            | Self::ReviewResolved { timestamp, .. }
            | Self::RuleCreated { timestamp, .. }
            | Self::TimelineEventCreated { timestamp, .. }
            | Self::SectorSignalCreated { timestamp, .. }
            | Self::StoryGenerated { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type_name(&self) -> &'static str {
        match self {
            Self::LinkCreated { .. } => "link_created",
            Self::LinkUpdated { .. } => "link_updated",
            Self::LinkQueued { .. } => "link_queued",
            Self::LinkStatusChanged { .. } => "link_status_changed",
            Self::ReviewResolved { .. } => "review_resolved",
            Self::RuleCreated { .. } => "rule_created",
            Self::TimelineEventCreated { .. } => "timeline_event_created",
            Self::SectorSignalCreated { .. } => "sector_signal_created",
            Self::StoryGenerated { .. } => "story_generated",
        }
    }

    /// Id of the record the event is about
    pub fn aggregate_id(&self) -> &str {
        match self {
            Self::LinkCreated { link_id, .. }
            | Self::LinkUpdated { link_id, .. }
            | Self::LinkStatusChanged { link_id, .. } => link_id,
            Self::LinkQueued { review_id, .. } | Self::ReviewResolved { review_id, .. } => review_id,
            Self::RuleCreated { rule_id, .. } => rule_id,
            Self::TimelineEventCreated { event_id, .. } => event_id,
            Self::SectorSignalCreated { signal_id, .. } => signal_id,
            Self::StoryGenerated { story_id, .. } => story_id,
        }
    }

    pub fn link_created(link: &Link) -> Self {
        Self::LinkCreated {
            link_id: link.id.clone(),
            link_type: link.link_type,
            src: link.src.clone(),
            dst: link.dst.clone(),
            confidence: link.confidence,
            rule_id: link.rule_id.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn link_updated(link: &Link) -> Self {
        Self::LinkUpdated {
            link_id: link.id.clone(),
            strength: link.strength,
            timestamp: Utc::now(),
        }
    }

    pub fn link_queued(entry: &ReviewEntry) -> Self {
        Self::LinkQueued {
            review_id: entry.id.clone(),
            link_type: entry.candidate.link_type,
            src: entry.candidate.src.clone(),
            dst: entry.candidate.dst.clone(),
            reason: entry.reason,
            priority: entry.priority,
            timestamp: Utc::now(),
        }
    }

    pub fn review_resolved(entry: &ReviewEntry) -> Self {
        Self::ReviewResolved {
            review_id: entry.id.clone(),
            status: entry.status,
            reviewer: entry.resolved_by.clone().unwrap_or_default(),
            link_id: entry.link_id.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn timeline_event_created(event: &TimelineEvent) -> Self {
        Self::TimelineEventCreated {
            event_id: event.id.clone(),
            subject: event.subject.clone(),
            severity: event.severity,
            timestamp: Utc::now(),
        }
    }

    pub fn sector_signal_created(signal: &SectorSignal) -> Self {
        Self::SectorSignalCreated {
            signal_id: signal.id.clone(),
            sector: signal.sector.clone(),
            severity: signal.severity,
            timestamp: Utc::now(),
        }
    }

    pub fn story_generated(story: &Story) -> Self {
        Self::StoryGenerated {
            story_id: story.id.clone(),
            status: story.status,
            timestamp: Utc::now(),
        }
    }
}

/// Events kept for the host when none is given
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// Bounded, thread-safe queue of undrained events
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    events: Mutex<VecDeque<GraphEvent>>,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Append events, dropping the oldest past capacity
    pub fn extend(&self, new_events: impl IntoIterator<Item = GraphEvent>) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.extend(new_events);
        let overflow = events.len().saturating_sub(self.capacity);
        if overflow > 0 {
            events.drain(..overflow);
            warn!(dropped = overflow, capacity = self.capacity, "Event buffer full; oldest events dropped");
        }
    }

    /// Take every buffered event, oldest first
    pub fn drain(&self) -> Vec<GraphEvent> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::link::CandidateLink;
    use crate::domain::graph::vocab::NodeType;

    #[test]
    fn test_link_created_event() {
        let link = CandidateLink::new(
            LinkType::Mentions,
            NodeRef::new(NodeType::Document, "1"),
            NodeRef::new(NodeType::Entity, "2"),
            0.9,
        )
        .into_link(ConfidenceLevel::High, LinkStatus::Active);
        let event = GraphEvent::link_created(&link);
        assert_eq!(event.event_type_name(), "link_created");
        assert_eq!(event.aggregate_id(), link.id);
    }

    #[test]
    fn test_events_are_tagged() {
        let event = GraphEvent::RuleCreated {
            rule_id: "r1".into(),
            rule_key: "doc_sector_tag".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "rule_created");
        assert_eq!(json["rule_key"], "doc_sector_tag");
    }

    fn rule_created(key: &str) -> GraphEvent {
        GraphEvent::RuleCreated {
            rule_id: key.into(),
            rule_key: key.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_buffer_drops_oldest_past_capacity() {
        let buffer = EventBuffer::with_capacity(3);
        buffer.extend((0..5).map(|i| rule_created(&format!("r{}", i))));
        assert_eq!(buffer.len(), 3);

        let drained = buffer.drain();
        let ids: Vec<&str> = drained.iter().map(|e| e.aggregate_id()).collect();
        assert_eq!(ids, vec!["r2", "r3", "r4"]);
        assert!(buffer.is_empty());
    }
}
