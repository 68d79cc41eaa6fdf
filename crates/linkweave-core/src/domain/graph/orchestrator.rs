//! Enrichment orchestrator
//!
//! Fetches a record, runs the rule engine over it, feeds every proposal
//! through the [`LinkWriter`] and hands new active links to propagation.
//!
//! Batch mode walks a bounded set of recently changed records with a fixed
//! number of concurrent workers. Deadline, record cap and cancellation are
//! checked between records; a stopped batch returns a partial summary and
//! still writes its rule runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::GraphEvent;
use super::matcher::SimilarityOverrides;
use super::node::{NodeRecord, NodeRef};
use super::propagation::{EventPropagator, PropagationOutcome};
use super::repository::GraphRepository;
use super::rule::{LinkRule, RuleRun, RuleStats, merge_rule_stats};
use super::rule_engine::RuleEngine;
use super::scoring::{LinkWriter, WriteOutcome, WritePolicy};
use super::vocab::{NodeType, RunStatus, RunTrigger};
use crate::config::EnrichmentConfig;
use crate::error::{Error, Result};

/// Options for enriching one record
#[derive(Debug, Clone)]
pub struct EnrichOptions {
    /// Explicit admin call; lets propagation run for derived records
    pub manual: bool,
    pub trigger: RunTrigger,
    /// Similarity scores supplied with this call, by candidate
    pub similarities: SimilarityOverrides,
    /// Restrict evaluation to one rule
    pub rule_id: Option<String>,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            manual: false,
            trigger: RunTrigger::Manual,
            similarities: SimilarityOverrides::new(),
            rule_id: None,
        }
    }
}

impl EnrichOptions {
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::default()
        }
    }

    pub fn on_ingest() -> Self {
        Self {
            trigger: RunTrigger::OnIngest,
            ..Self::default()
        }
    }

    pub fn with_similarity(mut self, node: NodeRef, score: f64) -> Self {
        self.similarities.insert(node, score);
        self
    }
}

/// What enriching one record did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentSummary {
    pub node: Option<NodeRef>,
    pub links_created: u64,
    pub links_updated: u64,
    pub links_queued: u64,
    pub links_skipped: u64,
    pub errors: Vec<String>,
    /// Per rule id
    pub rule_stats: BTreeMap<String, RuleStats>,
    pub propagation: Vec<PropagationOutcome>,
    #[serde(skip)]
    pub events: Vec<GraphEvent>,
}

impl EnrichmentSummary {
    fn for_node(node: &NodeRef) -> Self {
        Self {
            node: Some(node.clone()),
            ..Self::default()
        }
    }
}

/// Which records a batch visits
#[derive(Debug, Clone)]
pub struct BatchFilter {
    /// Empty means every type
    pub node_types: Vec<NodeType>,
    pub since: DateTime<Utc>,
    pub max_records: u32,
    pub workers: usize,
    pub deadline: Option<Duration>,
    pub trigger: RunTrigger,
    /// Run only this rule, even when it is disabled
    pub rule_id: Option<String>,
}

impl BatchFilter {
    /// Filter built from configured defaults
    pub fn from_config(config: &EnrichmentConfig) -> Self {
        let deadline = match config.batch_deadline_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            node_types: Vec::new(),
            since: Utc::now() - chrono::Duration::hours(config.batch_lookback_hours.max(0)),
            max_records: config.batch_max_records,
            workers: config.batch_workers,
            deadline,
            trigger: RunTrigger::Batch,
            rule_id: None,
        }
    }

    pub fn with_types(mut self, node_types: Vec<NodeType>) -> Self {
        self.node_types = node_types;
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }
}

/// Why a batch ended before visiting every selected record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Deadline,
    Cancelled,
    RecordCap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub node: NodeRef,
    pub message: String,
}

/// Aggregate over one batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub records_selected: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub links_created: u64,
    pub links_updated: u64,
    pub links_queued: u64,
    pub links_skipped: u64,
    pub stopped: Option<StopReason>,
    pub errors: Vec<RecordError>,
    pub runs: Vec<RuleRun>,
    #[serde(skip)]
    pub events: Vec<GraphEvent>,
}

impl BatchSummary {
    pub fn is_partial(&self) -> bool {
        self.stopped.is_some()
    }
}

enum RecordResult {
    Enriched(EnrichmentSummary),
    Failed(NodeRef, String),
    Stopped(StopReason),
}

pub struct EnrichmentOrchestrator<R: GraphRepository + ?Sized> {
    repository: Arc<R>,
    engine: RuleEngine<R>,
    writer: Arc<LinkWriter<R>>,
    propagator: Arc<EventPropagator<R>>,
}

impl<R: GraphRepository + ?Sized> EnrichmentOrchestrator<R> {
    pub fn new(
        repository: Arc<R>,
        writer: Arc<LinkWriter<R>>,
        propagator: Arc<EventPropagator<R>>,
        candidate_limit: u32,
    ) -> Self {
        Self {
            engine: RuleEngine::new(repository.clone(), candidate_limit),
            repository,
            writer,
            propagator,
        }
    }

    /// Enrich one record
    pub async fn enrich(&self, node: &NodeRef, options: &EnrichOptions) -> Result<EnrichmentSummary> {
        let record = self
            .repository
            .get_node(node)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node.to_string()))?;
        let rules = self.rules_for(options.rule_id.as_deref()).await?;
        let summary = self.enrich_record(&record, &rules, options).await;
        info!(
            node = %node,
            created = summary.links_created,
            updated = summary.links_updated,
            queued = summary.links_queued,
            errors = summary.errors.len(),
            "Enrichment complete"
        );
        Ok(summary)
    }

    /// Enrich recently changed records and write one rule run per rule
    pub async fn enrich_batch(&self, filter: &BatchFilter, cancel: CancellationToken) -> Result<BatchSummary> {
        let started_at = Utc::now();
        let rules = self.rules_for(filter.rule_id.as_deref()).await?;
        let invoked: Vec<&LinkRule> = rules
            .iter()
            .filter(|r| filter.node_types.is_empty() || r.applies_to_any(&filter.node_types))
            .collect();

        let mut refs = self
            .repository
            .list_changed_since(&filter.node_types, filter.since, filter.max_records.saturating_add(1))
            .await?;
        let capped = refs.len() > filter.max_records as usize;
        refs.truncate(filter.max_records as usize);

        let mut summary = BatchSummary {
            records_selected: refs.len() as u64,
            ..BatchSummary::default()
        };
        info!(
            records = refs.len(),
            rules = invoked.len(),
            workers = filter.workers,
            "Starting batch enrichment"
        );

        let deadline = filter.deadline.map(|d| Instant::now() + d);
        let options = EnrichOptions {
            trigger: filter.trigger,
            ..EnrichOptions::default()
        };
        let rules = &rules;
        let cancel = &cancel;
        let options = &options;

        let results: Vec<RecordResult> = stream::iter(refs)
            .map(|node| async move {
                if cancel.is_cancelled() {
                    return RecordResult::Stopped(StopReason::Cancelled);
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return RecordResult::Stopped(StopReason::Deadline);
                }
                match self.repository.get_node(&node).await {
                    Ok(Some(record)) => RecordResult::Enriched(self.enrich_record(&record, rules, options).await),
                    Ok(None) => RecordResult::Failed(node.clone(), Error::NodeNotFound(node.to_string()).to_string()),
                    Err(e) => {
                        warn!(node = %node, error = %e, "Failed to load record for enrichment");
                        RecordResult::Failed(node, e.to_string())
                    }
                }
            })
            .buffer_unordered(filter.workers.max(1))
            .collect()
            .await;

        let mut stats: BTreeMap<String, RuleStats> = BTreeMap::new();
        let mut failed_nodes = Vec::new();
        for result in results {
            match result {
                RecordResult::Enriched(record) => {
                    summary.records_processed += 1;
                    summary.links_created += record.links_created;
                    summary.links_updated += record.links_updated;
                    summary.links_queued += record.links_queued;
                    summary.links_skipped += record.links_skipped;
                    if let Some(node) = &record.node {
                        summary.errors.extend(record.errors.iter().map(|message| RecordError {
                            node: node.clone(),
                            message: message.clone(),
                        }));
                    }
                    merge_rule_stats(&mut stats, &record.rule_stats);
                    summary.events.extend(record.events);
                }
                RecordResult::Failed(node, message) => {
                    summary.records_processed += 1;
                    summary.records_failed += 1;
                    failed_nodes.push((node.clone(), message.clone()));
                    summary.errors.push(RecordError { node, message });
                }
                RecordResult::Stopped(reason) => {
                    summary.stopped.get_or_insert(reason);
                }
            }
        }
        if capped {
            summary.stopped.get_or_insert(StopReason::RecordCap);
        }

        let status = if summary.stopped.is_some() {
            RunStatus::Partial
        } else if summary.records_processed > 0 && summary.records_failed == summary.records_processed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        for rule in invoked {
            let mut rule_stats = stats.remove(&rule.id).unwrap_or_default();
            for (node, message) in &failed_nodes {
                rule_stats.record_error(node, message.clone());
            }
            let run = RuleRun::from_stats(rule, filter.trigger, status, started_at, &rule_stats);
            match self.repository.record_rule_run(&run).await {
                Ok(()) => summary.runs.push(run),
                Err(e) => {
                    warn!(rule_key = %rule.key, error = %e, "Failed to record rule run");
                }
            }
        }

        info!(
            processed = summary.records_processed,
            failed = summary.records_failed,
            created = summary.links_created,
            queued = summary.links_queued,
            status = %status,
            "Batch enrichment finished"
        );
        Ok(summary)
    }

    async fn rules_for(&self, rule_id: Option<&str>) -> Result<Vec<LinkRule>> {
        match rule_id {
            Some(id) => {
                let rule = self
                    .repository
                    .get_rule(id)
                    .await?
                    .ok_or_else(|| Error::RuleNotFound(id.to_string()))?;
                Ok(vec![rule])
            }
            None => self.engine.load_rules().await,
        }
    }

    /// Evaluate and write; never fails, errors land in the summary
    async fn enrich_record(
        &self,
        record: &NodeRecord,
        rules: &[LinkRule],
        options: &EnrichOptions,
    ) -> EnrichmentSummary {
        let mut summary = EnrichmentSummary::for_node(&record.node);
        let evaluation = self.engine.evaluate(record, rules, &options.similarities).await;
        summary.rule_stats = evaluation.stats;
        for stats in summary.rule_stats.values() {
            summary.errors.extend(stats.error_log.iter().map(|e| e.message.clone()));
        }

        let propagate = self.propagator.enabled() && (options.manual || !record.origin.is_derived());
        if !propagate && record.origin.is_derived() {
            debug!(node = %record.node, "Propagation skipped for derived record");
        }

        for proposal in evaluation.proposals {
            let stats = summary.rule_stats.entry(proposal.rule_id.clone()).or_default();
            let policy = WritePolicy::Rule {
                auto_approve: proposal.auto_approve,
            };
            match self.writer.submit(proposal.candidate, policy).await {
                Ok(WriteOutcome::Created(link)) => {
                    stats.links_created += 1;
                    summary.links_created += 1;
                    summary.events.push(GraphEvent::link_created(&link));
                    if propagate {
                        let outcome = self.propagator.on_link_created(&link).await;
                        summary.events.extend(outcome.timeline_events.iter().map(GraphEvent::timeline_event_created));
                        summary.events.extend(outcome.sector_signals.iter().map(GraphEvent::sector_signal_created));
                        summary.propagation.push(outcome);
                    }
                }
                Ok(WriteOutcome::Updated(link)) => {
                    stats.links_updated += 1;
                    summary.links_updated += 1;
                    summary.events.push(GraphEvent::link_updated(&link));
                }
                Ok(WriteOutcome::Queued(entry)) => {
                    stats.links_queued += 1;
                    summary.links_queued += 1;
                    summary.events.push(GraphEvent::link_queued(&entry));
                }
                Ok(WriteOutcome::QueueRefreshed(_)) | Ok(WriteOutcome::Discarded(_)) => {
                    stats.links_skipped += 1;
                }
                Err(e) => {
                    warn!(node = %record.node, rule_id = %proposal.rule_id, error = %e, "Link write failed");
                    stats.record_error(&record.node, e.to_string());
                    summary.errors.push(e.to_string());
                }
            }
        }

        summary.links_skipped = summary.rule_stats.values().map(|s| s.links_skipped).sum();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropagationConfig;
    use crate::domain::graph::link::{ConfidenceBands, LinkFilter};
    use crate::domain::graph::repository::{LinkRepository, NodeRepository, RuleRepository, SignalRepository};
    use crate::domain::graph::rule::{MatchLogic, NewRule, StrengthFormula};
    use crate::domain::graph::vocab::{ConfidenceLevel, LinkMethod, LinkType, NodeOrigin};
    use crate::infrastructure::graph::SqliteGraphRepository;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn orchestrator() -> (Arc<SqliteGraphRepository>, EnrichmentOrchestrator<SqliteGraphRepository>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqliteGraphRepository::new(pool));
        let writer = Arc::new(LinkWriter::new(repo.clone(), ConfidenceBands::default()));
        let propagator = Arc::new(EventPropagator::new(
            repo.clone(),
            writer.clone(),
            PropagationConfig::default(),
        ));
        let orchestrator = EnrichmentOrchestrator::new(repo.clone(), writer, propagator, 100);
        (repo, orchestrator)
    }

    async fn bank_rule(repo: &SqliteGraphRepository) -> LinkRule {
        let rule = NewRule::new(
            "bank_name",
            "Shared bank name",
            vec![NodeType::Document],
            vec![NodeType::Entity],
            MatchLogic::SharedId {
                fields: vec!["bank_name".into()],
            },
            LinkType::Mentions,
        )
        .strength(StrengthFormula::fixed(0.8))
        .auto_approve(true)
        .into_rule()
        .unwrap();
        repo.save_rule(&rule).await.unwrap();
        rule
    }

    fn document(id: &str) -> NodeRecord {
        NodeRecord::new(NodeType::Document, id)
            .with_label(format!("Report {}", id))
            .with_identifier("bank_name", "Bank X")
    }

    #[tokio::test]
    async fn test_enrich_is_idempotent() {
        let (repo, orchestrator) = orchestrator().await;
        bank_rule(&repo).await;
        let doc = document("1");
        let bank = NodeRecord::new(NodeType::Entity, "bank-x")
            .with_label("Bank X")
            .with_identifier("bank_name", "Bank X");
        repo.upsert_node(&doc).await.unwrap();
        repo.upsert_node(&bank).await.unwrap();

        let first = orchestrator.enrich(&doc.node, &EnrichOptions::default()).await.unwrap();
        assert_eq!(first.links_created, 1);
        assert!(first.errors.is_empty(), "{:?}", first.errors);
        assert!(first.events.iter().any(|e| e.event_type_name() == "link_created"));

        let second = orchestrator.enrich(&doc.node, &EnrichOptions::default()).await.unwrap();
        assert_eq!(second.links_created, 0);
        assert_eq!(second.links_updated, 1);

        let links = repo.list_links_for_node(&bank.node, &LinkFilter::active()).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].confidence, ConfidenceLevel::High);
        assert_eq!(links[0].method, LinkMethod::RuleBased);
    }

    #[tokio::test]
    async fn test_enrich_missing_node() {
        let (_repo, orchestrator) = orchestrator().await;
        let missing = NodeRef::new(NodeType::Document, "nope");
        assert!(matches!(
            orchestrator.enrich(&missing, &EnrichOptions::default()).await,
            Err(Error::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_isolates_failing_record() {
        let (repo, orchestrator) = orchestrator().await;
        let rule = bank_rule(&repo).await;
        repo.upsert_node(&NodeRecord::new(NodeType::Entity, "bank-x").with_identifier("bank_name", "Bank X"))
            .await
            .unwrap();
        repo.upsert_node(&document("good")).await.unwrap();
        repo.upsert_node(&document("bad")).await.unwrap();
        sqlx::query("UPDATE graph_nodes SET tags = '{broken' WHERE node_id = 'bad'")
            .execute(repo.pool())
            .await
            .unwrap();

        let filter = BatchFilter::from_config(&EnrichmentConfig::default()).with_types(vec![NodeType::Document]);
        let summary = orchestrator
            .enrich_batch(&filter, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.records_processed, 2);
        assert_eq!(summary.records_failed, 1);
        assert_eq!(summary.links_created, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].node, NodeRef::new(NodeType::Document, "bad"));
        assert!(!summary.is_partial());

        let runs = repo.list_rule_runs(Some(&rule.id), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].trigger, RunTrigger::Batch);
        assert_eq!(runs[0].links_created, 1);
        assert_eq!(runs[0].errors, 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch_is_partial() {
        let (repo, orchestrator) = orchestrator().await;
        let rule = bank_rule(&repo).await;
        repo.upsert_node(&document("1")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let filter = BatchFilter::from_config(&EnrichmentConfig::default());
        let summary = orchestrator.enrich_batch(&filter, cancel).await.unwrap();

        assert_eq!(summary.stopped, Some(StopReason::Cancelled));
        assert_eq!(summary.records_processed, 0);
        let runs = repo.list_rule_runs(Some(&rule.id), 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn test_record_cap_stops_batch() {
        let (repo, orchestrator) = orchestrator().await;
        bank_rule(&repo).await;
        repo.upsert_node(&document("1")).await.unwrap();
        repo.upsert_node(&document("2")).await.unwrap();

        let mut filter = BatchFilter::from_config(&EnrichmentConfig::default());
        filter.max_records = 1;
        let summary = orchestrator
            .enrich_batch(&filter, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.records_selected, 1);
        assert_eq!(summary.stopped, Some(StopReason::RecordCap));
        assert!(summary.runs.iter().all(|r| r.status == RunStatus::Partial));
    }

    #[tokio::test]
    async fn test_derived_records_propagate_only_when_manual() {
        let (repo, orchestrator) = orchestrator().await;
        let rule = NewRule::new(
            "event_sector",
            "Event affects sector",
            vec![NodeType::Event],
            vec![NodeType::Sector],
            MatchLogic::Tag { tags: Vec::new() },
            LinkType::Affects,
        )
        .strength(StrengthFormula::fixed(0.9))
        .auto_approve(true)
        .into_rule()
        .unwrap();
        repo.save_rule(&rule).await.unwrap();
        repo.upsert_node(&NodeRecord::new(NodeType::Sector, "banking").with_label("Banking"))
            .await
            .unwrap();

        let derived = NodeRecord::new(NodeType::Event, "ev-1")
            .with_sectors(["banking"])
            .with_origin(NodeOrigin::Propagation);
        repo.upsert_node(&derived).await.unwrap();
        let summary = orchestrator.enrich(&derived.node, &EnrichOptions::default()).await.unwrap();
        assert_eq!(summary.links_created, 1);
        assert!(summary.propagation.is_empty());
        assert!(repo.list_timeline_events(None, 10).await.unwrap().is_empty());

        let other = NodeRecord::new(NodeType::Event, "ev-2")
            .with_sectors(["banking"])
            .with_origin(NodeOrigin::Propagation);
        repo.upsert_node(&other).await.unwrap();
        let summary = orchestrator.enrich(&other.node, &EnrichOptions::manual()).await.unwrap();
        assert_eq!(summary.links_created, 1);
        assert_eq!(summary.propagation.len(), 1);
        assert_eq!(repo.list_timeline_events(None, 10).await.unwrap().len(), 1);
    }
}
