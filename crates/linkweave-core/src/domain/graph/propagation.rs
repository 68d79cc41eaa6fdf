//! Event propagation
//!
//! Derives timeline events and sector signals from newly created links and
//! newly observed producer records. Propagation is best-effort: failures are
//! logged and reported in the outcome, never returned as errors, and never
//! undo the link that triggered them.
//!
//! Records created here carry origin `propagation`. They are never handed
//! back to the enrichment orchestrator by this module.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::link::{CandidateLink, Evidence, Link};
use super::node::{NodeRecord, NodeRef};
use super::repository::GraphRepository;
use super::scoring::{LinkWriter, WritePolicy};
use super::signal::{
    PropagationStats, SectorSignal, SignalFilter, TimelineEvent, TimelineKind, sectors_for_entity_type,
};
use super::vocab::{ConfidenceLevel, LinkMethod, LinkType, NodeOrigin, NodeType, Severity};
use crate::config::PropagationConfig;
use crate::error::Result;

/// Actor recorded on links written by propagation
pub const PROPAGATION_ACTOR: &str = "propagation";

/// Change (in percent) above which a data update is significant
const SIGNIFICANT_CHANGE_PCT: f64 = 5.0;
/// Change (in percent) at or above which a data update is critical
const CRITICAL_CHANGE_PCT: f64 = 20.0;

/// Progress of one originating event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationStage {
    Observed,
    EventCreated,
    SignalCreated,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationOutcome {
    /// Furthest stage reached before finishing
    pub stage: PropagationStage,
    pub timeline_events: Vec<TimelineEvent>,
    pub sector_signals: Vec<SectorSignal>,
    pub errors: Vec<String>,
}

impl PropagationOutcome {
    fn observed() -> Self {
        Self {
            stage: PropagationStage::Observed,
            timeline_events: Vec::new(),
            sector_signals: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn finish(mut self) -> Self {
        self.stage = PropagationStage::Done;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.timeline_events.is_empty() && self.sector_signals.is_empty()
    }
}

/// Severity of the timeline event for a new link
pub fn link_severity(link_type: LinkType, confidence: ConfidenceLevel) -> Severity {
    if confidence != ConfidenceLevel::High {
        return Severity::Info;
    }
    match link_type {
        LinkType::Contradicts | LinkType::Affects | LinkType::Supersedes => Severity::Critical,
        _ => Severity::Warning,
    }
}

/// Timeline classification of a newly observed record, if it warrants one
pub fn classify_record(record: &NodeRecord) -> Option<(TimelineKind, Severity, String)> {
    let label = record.display_label();
    match record.node.node_type {
        NodeType::Update | NodeType::Series | NodeType::Indicator | NodeType::Dataset => {
            let change = record.metadata_f64("change_percent")?;
            let magnitude = change.abs();
            if magnitude <= SIGNIFICANT_CHANGE_PCT {
                return None;
            }
            let severity = if magnitude >= CRITICAL_CHANGE_PCT {
                Severity::Critical
            } else {
                Severity::Warning
            };
            Some((
                TimelineKind::DataUpdate,
                severity,
                format!("{} changed by {:+.1}%", label, change),
            ))
        }
        NodeType::Document => Some((
            TimelineKind::Publication,
            Severity::Info,
            format!("New publication: {}", label),
        )),
        NodeType::Entity => {
            let severity = match record.metadata_str("impact")?.to_lowercase().as_str() {
                "low" | "medium" => Severity::Info,
                "high" => Severity::Warning,
                "critical" => Severity::Critical,
                _ => return None,
            };
            let action = record.metadata_str("action").unwrap_or("activity reported");
            Some((
                TimelineKind::EntityAction,
                severity,
                format!("{}: {}", label, action),
            ))
        }
        _ => None,
    }
}

pub struct EventPropagator<R: GraphRepository + ?Sized> {
    repository: Arc<R>,
    writer: Arc<LinkWriter<R>>,
    config: PropagationConfig,
}

impl<R: GraphRepository + ?Sized> EventPropagator<R> {
    pub fn new(repository: Arc<R>, writer: Arc<LinkWriter<R>>, config: PropagationConfig) -> Self {
        Self {
            repository,
            writer,
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Derive signals from a newly created active link
    pub async fn on_link_created(&self, link: &Link) -> PropagationOutcome {
        let outcome = PropagationOutcome::observed();
        if link.created_by.as_deref() == Some(PROPAGATION_ACTOR) {
            return outcome.finish();
        }

        let subject_record = self.load(&link.src).await;
        let severity = link_severity(link.link_type, link.confidence);
        let src_label = link
            .src_label
            .clone()
            .unwrap_or_else(|| link.src.default_label());
        let dst_label = link
            .dst_label
            .clone()
            .unwrap_or_else(|| link.dst.default_label());

        let mut event = TimelineEvent::new(
            link.id.clone(),
            TimelineKind::LinkDiscovered,
            link.src.clone(),
            severity,
            format!("{} {} {}", src_label, link.link_type.as_str().replace('_', " "), dst_label),
        );
        event.subject_label = Some(src_label);
        event.link_type = Some(link.link_type);
        event.evidence = link.evidence.snippet.clone();

        let mut sectors = BTreeSet::new();
        for node in [&link.src, &link.dst] {
            if node.node_type == NodeType::Sector {
                sectors.insert(node.node_id.clone());
            }
        }
        if let Some(record) = &subject_record {
            sectors.extend(record_sectors(record));
        }

        self.emit(outcome, event, sectors).await
    }

    /// Derive signals from a producer record seen for the first time
    pub async fn on_record_observed(&self, record: &NodeRecord) -> PropagationOutcome {
        let outcome = PropagationOutcome::observed();
        if record.origin.is_derived() {
            return outcome.finish();
        }
        let Some((kind, severity, title)) = classify_record(record) else {
            debug!(node = %record.node, "Record does not warrant a timeline event");
            return outcome.finish();
        };

        let mut event = TimelineEvent::new(
            format!("record:{}", record.node),
            kind,
            record.node.clone(),
            severity,
            title,
        );
        event.subject_label = record.label.clone();

        self.emit(outcome, event, record_sectors(record)).await
    }

    /// Unread signals created within the last `window_days` (configured window when `None`)
    ///
    /// An empty `sectors` list keeps every sector.
    pub async fn active_sector_signals(
        &self,
        sectors: &[String],
        window_days: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<SectorSignal>> {
        let days = window_days.unwrap_or(self.config.signal_window_days).max(0);
        let mut filter = SignalFilter::active_since(Utc::now() - Duration::days(days))
            .sectors(sectors.iter().cloned());
        filter.limit = limit;
        self.repository.list_sector_signals(&filter).await
    }

    /// Mark unread signals older than `older_than_days` as read
    pub async fn expire_signals(&self, older_than_days: Option<i64>) -> Result<u64> {
        let days = older_than_days.unwrap_or(self.config.signal_expiry_days).max(0);
        let expired = self
            .repository
            .expire_sector_signals(Utc::now() - Duration::days(days))
            .await?;
        if expired > 0 {
            info!(expired, days, "Old sector signals expired");
        }
        Ok(expired)
    }

    pub async fn stats(&self) -> Result<PropagationStats> {
        self.repository.propagation_stats().await
    }

    pub async fn list_timeline_events(&self, subject: Option<&NodeRef>, limit: u32) -> Result<Vec<TimelineEvent>> {
        self.repository.list_timeline_events(subject, limit).await
    }

    async fn emit(
        &self,
        mut outcome: PropagationOutcome,
        event: TimelineEvent,
        sectors: BTreeSet<String>,
    ) -> PropagationOutcome {
        match self.repository.insert_timeline_event(&event).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(origin = %event.origin_key, subject = %event.subject, "Timeline event already exists");
                return outcome.finish();
            }
            Err(e) => {
                warn!(origin = %event.origin_key, error = %e, "Failed to create timeline event");
                outcome.errors.push(format!("timeline event: {}", e));
                return outcome.finish();
            }
        }

        info!(
            event_id = %event.id,
            subject = %event.subject,
            severity = %event.severity,
            "Timeline event created"
        );
        outcome.stage = PropagationStage::EventCreated;

        let event_record = NodeRecord::new(NodeType::Event, event.id.clone())
            .with_label(event.title.clone())
            .with_sectors(sectors.iter().cloned())
            .with_metadata("kind", event.kind.as_str())
            .with_metadata("severity", event.severity.as_str())
            .with_metadata("origin_key", event.origin_key.clone())
            .with_origin(NodeOrigin::Propagation);
        self.register(&event_record, &mut outcome).await;

        let signal_link = CandidateLink::new(
            LinkType::UpdateSignal,
            event.subject.clone(),
            event.node(),
            1.0,
        )
        .with_method(LinkMethod::RuleBased)
        .with_labels(event.subject_label.clone(), Some(event.title.clone()))
        .with_evidence(Evidence {
            snippet: event.evidence.clone(),
            url: None,
        })
        .created_by(PROPAGATION_ACTOR);
        if let Err(e) = self.writer.submit(signal_link, WritePolicy::Manual).await {
            warn!(event_id = %event.id, error = %e, "Failed to link timeline event to its subject");
            outcome.errors.push(format!("update_signal link: {}", e));
        }

        if event.severity >= self.config.signal_min_severity {
            for sector in &sectors {
                let signal = SectorSignal::new(&event, sector.clone());
                match self.repository.insert_sector_signal(&signal).await {
                    Ok(true) => {
                        info!(signal_id = %signal.id, sector = %sector, "Sector signal created");
                        let signal_record = NodeRecord::new(NodeType::Update, signal.id.clone())
                            .with_label(signal.title.clone())
                            .with_sectors([sector.clone()])
                            .with_metadata("severity", signal.severity.as_str())
                            .with_metadata("timeline_event_id", event.id.clone())
                            .with_origin(NodeOrigin::Propagation);
                        self.register(&signal_record, &mut outcome).await;
                        outcome.sector_signals.push(signal);
                        outcome.stage = PropagationStage::SignalCreated;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(event_id = %event.id, sector = %sector, error = %e, "Failed to create sector signal");
                        outcome.errors.push(format!("sector signal {}: {}", sector, e));
                    }
                }
            }
        }

        outcome.timeline_events.push(event);
        outcome.finish()
    }

    async fn register(&self, record: &NodeRecord, outcome: &mut PropagationOutcome) {
        if let Err(e) = self.repository.upsert_node(record).await {
            warn!(node = %record.node, error = %e, "Failed to register derived record");
            outcome.errors.push(format!("register {}: {}", record.node, e));
        }
    }

    async fn load(&self, node: &NodeRef) -> Option<NodeRecord> {
        match self.repository.get_node(node).await {
            Ok(record) => record,
            Err(e) => {
                warn!(node = %node, error = %e, "Failed to load propagation subject");
                None
            }
        }
    }
}

/// Sectors a record touches: its own sector list, its code when it is a
/// sector, and the sectors implied by its entity type
fn record_sectors(record: &NodeRecord) -> BTreeSet<String> {
    let mut sectors: BTreeSet<String> = record
        .sectors
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if record.node.node_type == NodeType::Sector {
        sectors.insert(record.node.node_id.clone());
    }
    if let Some(entity_type) = record.metadata_str("entity_type") {
        sectors.extend(sectors_for_entity_type(entity_type).iter().map(|s| s.to_string()));
    }
    sectors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::link::ConfidenceBands;
    use crate::domain::graph::repository::{LinkRepository, NodeRepository, SignalRepository};
    use crate::domain::graph::vocab::LinkStatus;
    use crate::infrastructure::graph::SqliteGraphRepository;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn propagator() -> (Arc<SqliteGraphRepository>, EventPropagator<SqliteGraphRepository>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqliteGraphRepository::new(pool));
        let writer = Arc::new(LinkWriter::new(repo.clone(), ConfidenceBands::default()));
        let propagator = EventPropagator::new(repo.clone(), writer, PropagationConfig::default());
        (repo, propagator)
    }

    fn high_link(link_type: LinkType, src: NodeRef, dst: NodeRef) -> Link {
        CandidateLink::new(link_type, src, dst, 0.9).into_link(ConfidenceLevel::High, LinkStatus::Active)
    }

    #[test]
    fn test_link_severity() {
        assert_eq!(link_severity(LinkType::Contradicts, ConfidenceLevel::High), Severity::Critical);
        assert_eq!(link_severity(LinkType::Mentions, ConfidenceLevel::High), Severity::Warning);
        assert_eq!(link_severity(LinkType::Affects, ConfidenceLevel::Medium), Severity::Info);
    }

    #[test]
    fn test_classify_record() {
        let small = NodeRecord::new(NodeType::Indicator, "fx").with_metadata("change_percent", 3.0);
        assert!(classify_record(&small).is_none());

        let big = NodeRecord::new(NodeType::Indicator, "fx").with_metadata("change_percent", -25.0);
        let (kind, severity, title) = classify_record(&big).unwrap();
        assert_eq!(kind, TimelineKind::DataUpdate);
        assert_eq!(severity, Severity::Critical);
        assert!(title.contains("-25.0%"));

        let medium = NodeRecord::new(NodeType::Series, "cpi").with_metadata("change_percent", "7");
        assert_eq!(classify_record(&medium).unwrap().1, Severity::Warning);

        let doc = NodeRecord::new(NodeType::Document, "1").with_label("Q3 Report");
        assert_eq!(classify_record(&doc).unwrap().0, TimelineKind::Publication);

        let entity = NodeRecord::new(NodeType::Entity, "cby").with_metadata("impact", "high");
        assert_eq!(classify_record(&entity).unwrap().1, Severity::Warning);

        assert!(classify_record(&NodeRecord::new(NodeType::Project, "p")).is_none());
    }

    #[tokio::test]
    async fn test_link_creates_one_event_and_sector_signals() {
        let (repo, propagator) = propagator().await;
        let bank = NodeRecord::new(NodeType::Entity, "bank-x")
            .with_label("Bank X")
            .with_metadata("entity_type", "bank");
        repo.upsert_node(&bank).await.unwrap();

        let link = high_link(
            LinkType::Mentions,
            bank.node.clone(),
            NodeRef::new(NodeType::Document, "1"),
        );
        let outcome = propagator.on_link_created(&link).await;
        assert_eq!(outcome.stage, PropagationStage::Done);
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(outcome.timeline_events.len(), 1);
        let sectors: Vec<&str> = outcome.sector_signals.iter().map(|s| s.sector.as_str()).collect();
        assert_eq!(sectors, vec!["banking", "finance"]);

        let event = &outcome.timeline_events[0];
        let registered = repo.get_node(&event.node()).await.unwrap().unwrap();
        assert_eq!(registered.origin, NodeOrigin::Propagation);

        let links = repo
            .list_links_for_node(&event.node(), &crate::domain::graph::link::LinkFilter::active())
            .await
            .unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link_type, LinkType::UpdateSignal);
        assert_eq!(links[0].created_by.as_deref(), Some(PROPAGATION_ACTOR));

        // Same originating link: no second event
        let again = propagator.on_link_created(&link).await;
        assert!(again.is_empty());
        assert_eq!(repo.list_timeline_events(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_low_severity_creates_no_signals() {
        let (_repo, propagator) = propagator().await;
        let link = CandidateLink::new(
            LinkType::RelatedTo,
            NodeRef::new(NodeType::Document, "1"),
            NodeRef::sector("banking"),
            0.6,
        )
        .into_link(ConfidenceLevel::Medium, LinkStatus::Active);
        let outcome = propagator.on_link_created(&link).await;
        assert_eq!(outcome.timeline_events.len(), 1);
        assert_eq!(outcome.timeline_events[0].severity, Severity::Info);
        assert!(outcome.sector_signals.is_empty());
        assert_eq!(outcome.stage, PropagationStage::Done);
    }

    #[tokio::test]
    async fn test_derived_inputs_do_not_propagate() {
        let (repo, propagator) = propagator().await;
        let derived = NodeRecord::new(NodeType::Update, "sig")
            .with_metadata("change_percent", 50.0)
            .with_origin(NodeOrigin::Propagation);
        assert!(propagator.on_record_observed(&derived).await.is_empty());

        let mut link = high_link(
            LinkType::UpdateSignal,
            NodeRef::new(NodeType::Entity, "a"),
            NodeRef::new(NodeType::Event, "b"),
        );
        link.created_by = Some(PROPAGATION_ACTOR.into());
        assert!(propagator.on_link_created(&link).await.is_empty());
        assert!(repo.list_timeline_events(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_sector_signals_window() {
        let (_repo, propagator) = propagator().await;
        let update = NodeRecord::new(NodeType::Update, "fx-jump")
            .with_label("Exchange rate")
            .with_sectors(["currency"])
            .with_metadata("change_percent", 30.0);
        let outcome = propagator.on_record_observed(&update).await;
        assert_eq!(outcome.sector_signals.len(), 1);

        let active = propagator.active_sector_signals(&[], None, None).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].sector, "currency");

        let other = propagator
            .active_sector_signals(&["banking".to_string()], None, None)
            .await
            .unwrap();
        assert!(other.is_empty());

        // Nothing is old enough yet; a zero-day cutoff expires everything
        assert_eq!(propagator.expire_signals(None).await.unwrap(), 0);
        assert_eq!(propagator.expire_signals(Some(0)).await.unwrap(), 1);
        assert!(propagator.active_sector_signals(&[], None, None).await.unwrap().is_empty());

        let stats = propagator.stats().await.unwrap();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.total_signals, 1);
        assert_eq!(stats.active_signals, 0);
    }
}
