//! Graph service
//!
//! The public API of the engine. Wires the rule engine, link writer, review
//! queue, propagation, related-items cache, health metrics and stories over
//! one repository, and collects domain events for the host to drain.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, EnrichmentConfig};
use crate::error::{Error, Result};

use super::event::{EventBuffer, GraphEvent};
use super::health::{HealthMetrics, HealthSnapshot, PublicHealthSummary};
use super::link::{CandidateLink, Link, LinkFilter};
use super::node::{NodeRecord, NodeRef};
use super::orchestrator::{BatchFilter, BatchSummary, EnrichOptions, EnrichmentOrchestrator, EnrichmentSummary};
use super::propagation::{EventPropagator, PropagationOutcome};
use super::related::{RelatedItems, RelatedItemsService, RelatedQuery};
use super::repository::GraphRepository;
use super::review::{ReviewEntry, ReviewResolution};
use super::review_queue::ReviewQueue;
use super::rule::{LinkRule, NewRule, RuleRun, default_rules};
use super::rule_engine::sort_by_priority;
use super::scoring::{LinkWriter, WriteOutcome, WritePolicy};
use super::signal::{PropagationStats, SectorSignal, TimelineEvent};
use super::story::{NarrativeGenerator, Story, StoryFilter, StoryRequest, StoryService};
use super::vocab::{LinkMethod, LinkStatus, NodeType, ReviewPriority, RunTrigger};

/// Result of the producer hook
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub node: NodeRef,
    /// First time the record was seen
    pub is_new: bool,
    pub observed: Option<PropagationOutcome>,
    pub enrichment: EnrichmentSummary,
}

pub struct GraphService<R: GraphRepository + ?Sized + 'static> {
    repository: Arc<R>,
    writer: Arc<LinkWriter<R>>,
    orchestrator: EnrichmentOrchestrator<R>,
    review: ReviewQueue<R>,
    related: RelatedItemsService<R>,
    health: HealthMetrics<R>,
    propagator: Arc<EventPropagator<R>>,
    stories: StoryService<R>,
    enrichment: EnrichmentConfig,
    max_related_items: usize,
    events: Arc<EventBuffer>,
}

impl<R: GraphRepository + ?Sized + 'static> GraphService<R> {
    pub fn new(repository: Arc<R>, config: &Config, generator: Arc<dyn NarrativeGenerator>) -> Self {
        let writer = Arc::new(LinkWriter::new(repository.clone(), config.scoring.bands()));
        let propagator = Arc::new(EventPropagator::new(
            repository.clone(),
            writer.clone(),
            config.propagation.clone(),
        ));
        Self {
            orchestrator: EnrichmentOrchestrator::new(
                repository.clone(),
                writer.clone(),
                propagator.clone(),
                config.enrichment.candidate_limit,
            ),
            review: ReviewQueue::new(repository.clone(), writer.clone()),
            related: RelatedItemsService::new(repository.clone(), config.cache.ttl_secs),
            health: HealthMetrics::new(repository.clone()),
            stories: StoryService::new(
                repository.clone(),
                generator,
                Duration::from_secs(config.narrative.timeout_secs),
            ),
            enrichment: config.enrichment.clone(),
            max_related_items: config.cache.max_items,
            events: Arc::new(EventBuffer::default()),
            propagator,
            writer,
            repository,
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Use a buffer of a different capacity for undrained events
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = Arc::new(EventBuffer::with_capacity(capacity));
        self
    }

    /// Take every event collected since the last drain
    ///
    /// Hosts should drain regularly; past the buffer's capacity the oldest
    /// events are dropped.
    pub fn drain_events(&self) -> Vec<GraphEvent> {
        self.events.drain()
    }

    fn record_events(&self, new_events: impl IntoIterator<Item = GraphEvent>) {
        self.events.extend(new_events);
    }

    // ========== Node Operations ==========

    /// Register or replace a record without enriching it
    pub async fn upsert_node(&self, record: &NodeRecord) -> Result<bool> {
        self.repository.upsert_node(record).await
    }

    pub async fn get_node(&self, node: &NodeRef) -> Result<NodeRecord> {
        self.repository
            .get_node(node)
            .await?
            .ok_or_else(|| Error::NodeNotFound(node.to_string()))
    }

    pub async fn list_nodes(&self, node_type: Option<NodeType>, limit: u32) -> Result<Vec<NodeRecord>> {
        self.repository.list_nodes(node_type, limit).await
    }

    /// Producer hook: register, observe for propagation, then enrich
    pub async fn ingest_record(&self, record: NodeRecord) -> Result<IngestSummary> {
        let is_new = self.repository.upsert_node(&record).await?;
        debug!(node = %record.node, is_new, "Record ingested");

        let observed = if is_new && !record.origin.is_derived() && self.propagator.enabled() {
            let outcome = self.propagator.on_record_observed(&record).await;
            self.record_propagation(&outcome);
            Some(outcome)
        } else {
            None
        };

        let enrichment = self.enrich(&record.node, EnrichOptions::on_ingest()).await?;
        Ok(IngestSummary {
            node: record.node,
            is_new,
            observed,
            enrichment,
        })
    }

    // ========== Enrichment Operations ==========

    pub async fn enrich(&self, node: &NodeRef, options: EnrichOptions) -> Result<EnrichmentSummary> {
        let mut summary = self.orchestrator.enrich(node, &options).await?;
        self.record_events(std::mem::take(&mut summary.events));
        Ok(summary)
    }

    /// Batch filter from the configured defaults
    pub fn batch_filter(&self) -> BatchFilter {
        BatchFilter::from_config(&self.enrichment)
    }

    pub async fn enrich_batch(&self, filter: &BatchFilter, cancel: CancellationToken) -> Result<BatchSummary> {
        let mut summary = self.orchestrator.enrich_batch(filter, cancel).await?;
        self.record_events(std::mem::take(&mut summary.events));
        Ok(summary)
    }

    // ========== Link Operations ==========

    /// Create a link by hand
    ///
    /// Deduplicated like any candidate; an existing active link for the tuple
    /// absorbs it instead.
    pub async fn create_link(&self, candidate: CandidateLink, created_by: &str) -> Result<Link> {
        if candidate.is_self_link() {
            return Err(Error::InvalidInput(format!(
                "a link cannot connect {} to itself",
                candidate.src
            )));
        }
        let candidate = candidate.with_method(LinkMethod::Manual).created_by(created_by);
        match self.writer.submit(candidate, WritePolicy::Manual).await? {
            WriteOutcome::Created(link) => {
                self.record_events([GraphEvent::link_created(&link)]);
                self.propagate(&link).await;
                Ok(link)
            }
            WriteOutcome::Updated(link) => {
                self.record_events([GraphEvent::link_updated(&link)]);
                Ok(link)
            }
            other => Err(Error::Other(format!("unexpected manual write outcome: {:?}", other))),
        }
    }

    pub async fn get_link(&self, id: &str) -> Result<Link> {
        self.repository
            .get_link(id)
            .await?
            .ok_or_else(|| Error::LinkNotFound(id.to_string()))
    }

    pub async fn links_for_node(&self, node: &NodeRef, filter: &LinkFilter) -> Result<Vec<Link>> {
        self.repository.list_links_for_node(node, filter).await
    }

    /// Move a link along its lifecycle
    pub async fn update_link_status(&self, id: &str, to: LinkStatus, reason: Option<String>) -> Result<Link> {
        let mut link = self.get_link(id).await?;
        let from = link.status;
        if from == to {
            return Ok(link);
        }
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition(
                id.to_string(),
                from.to_string(),
                to.to_string(),
            ));
        }

        link.status = to;
        link.updated_at = chrono::Utc::now();
        self.repository.update_link(&link).await.map_err(|e| {
            if e.is_unique_violation() {
                Error::DuplicateActiveLink(link.key().to_string())
            } else {
                e
            }
        })?;
        self.writer.invalidate(&link.nodes()).await;

        info!(link_id = %id, from = %from, to = %to, reason = ?reason, "Link status changed");
        self.record_events([GraphEvent::LinkStatusChanged {
            link_id: id.to_string(),
            from,
            to,
            reason,
            timestamp: chrono::Utc::now(),
        }]);
        Ok(link)
    }

    pub async fn deprecate_link(&self, id: &str, reason: Option<String>) -> Result<Link> {
        self.update_link_status(id, LinkStatus::Deprecated, reason).await
    }

    // ========== Rule Operations ==========

    /// Validate and persist a rule; keys are unique
    pub async fn create_rule(&self, rule: NewRule) -> Result<LinkRule> {
        let rule = rule.into_rule()?;
        if self.repository.get_rule_by_key(&rule.key).await?.is_some() {
            return Err(Error::InvalidRule(format!(
                "a rule with key '{}' already exists",
                rule.key
            )));
        }
        self.repository.save_rule(&rule).await?;
        info!(rule_id = %rule.id, rule_key = %rule.key, "Rule created");
        self.record_events([GraphEvent::RuleCreated {
            rule_id: rule.id.clone(),
            rule_key: rule.key.clone(),
            timestamp: chrono::Utc::now(),
        }]);
        Ok(rule)
    }

    pub async fn list_rules(&self, enabled_only: bool) -> Result<Vec<LinkRule>> {
        let mut rules = self.repository.list_rules(enabled_only).await?;
        sort_by_priority(&mut rules);
        Ok(rules)
    }

    /// Look a rule up by id, then by key
    pub async fn get_rule(&self, id_or_key: &str) -> Result<LinkRule> {
        if let Some(rule) = self.repository.get_rule(id_or_key).await? {
            return Ok(rule);
        }
        self.repository
            .get_rule_by_key(id_or_key)
            .await?
            .ok_or_else(|| Error::RuleNotFound(id_or_key.to_string()))
    }

    pub async fn set_rule_enabled(&self, id_or_key: &str, enabled: bool) -> Result<LinkRule> {
        let mut rule = self.get_rule(id_or_key).await?;
        if rule.enabled != enabled {
            rule.enabled = enabled;
            rule.updated_at = chrono::Utc::now();
            self.repository.save_rule(&rule).await?;
            info!(rule_key = %rule.key, enabled, "Rule toggled");
        }
        Ok(rule)
    }

    pub async fn update_rule_priority(&self, id_or_key: &str, priority: i32) -> Result<LinkRule> {
        let mut rule = self.get_rule(id_or_key).await?;
        rule.priority = priority;
        rule.updated_at = chrono::Utc::now();
        self.repository.save_rule(&rule).await?;
        Ok(rule)
    }

    /// Install the built-in rules that are missing; returns the new ones
    pub async fn seed_default_rules(&self) -> Result<Vec<LinkRule>> {
        let mut installed = Vec::new();
        for rule in default_rules() {
            if self.repository.get_rule_by_key(&rule.key).await?.is_some() {
                continue;
            }
            installed.push(self.create_rule(rule).await?);
        }
        info!(installed = installed.len(), "Default rules seeded");
        Ok(installed)
    }

    /// Run one rule on demand over the changed-record set of `filter`
    pub async fn run_rule(&self, id_or_key: &str, filter: Option<BatchFilter>) -> Result<BatchSummary> {
        let rule = self.get_rule(id_or_key).await?;
        let mut filter = filter.unwrap_or_else(|| self.batch_filter());
        filter.rule_id = Some(rule.id.clone());
        filter.trigger = RunTrigger::Manual;
        self.enrich_batch(&filter, CancellationToken::new()).await
    }

    pub async fn list_rule_runs(&self, rule: Option<&str>, limit: u32) -> Result<Vec<RuleRun>> {
        let rule_id = match rule {
            Some(id_or_key) => Some(self.get_rule(id_or_key).await?.id),
            None => None,
        };
        self.repository.list_rule_runs(rule_id.as_deref(), limit).await
    }

    // ========== Related Items ==========

    pub async fn related(&self, node: &NodeRef, query: RelatedQuery) -> Result<RelatedItems> {
        self.related.get(node, query).await
    }

    /// Default query with the configured item cap
    pub fn related_query(&self) -> RelatedQuery {
        RelatedQuery {
            max_items: self.max_related_items,
            ..RelatedQuery::default()
        }
    }

    // ========== Review Operations ==========

    pub async fn list_pending_reviews(
        &self,
        priority: Option<ReviewPriority>,
        limit: Option<u32>,
    ) -> Result<Vec<ReviewEntry>> {
        self.review.list_pending(priority, limit).await
    }

    pub async fn get_review(&self, id: &str) -> Result<ReviewEntry> {
        self.review.get(id).await
    }

    pub async fn approve_review(&self, id: &str, reviewer: &str, notes: Option<String>) -> Result<ReviewResolution> {
        let resolution = self.review.approve(id, reviewer, notes).await?;
        if resolution.changed {
            self.record_events([GraphEvent::review_resolved(&resolution.entry)]);
            if resolution.link_created
                && let Some(link_id) = &resolution.entry.link_id
            {
                let link = self.get_link(link_id).await?;
                self.record_events([GraphEvent::link_created(&link)]);
                self.propagate(&link).await;
            }
        }
        Ok(resolution)
    }

    pub async fn reject_review(&self, id: &str, reviewer: &str, notes: Option<String>) -> Result<ReviewResolution> {
        let resolution = self.review.reject(id, reviewer, notes).await?;
        if resolution.changed {
            self.record_events([GraphEvent::review_resolved(&resolution.entry)]);
        }
        Ok(resolution)
    }

    pub async fn pending_review_count(&self) -> Result<i64> {
        self.review.pending_count().await
    }

    // ========== Health Operations ==========

    pub async fn calculate_health(&self) -> Result<HealthSnapshot> {
        self.health.calculate().await
    }

    pub async fn latest_health(&self) -> Result<Option<HealthSnapshot>> {
        self.health.latest().await
    }

    pub async fn health_history(&self, limit: u32) -> Result<Vec<HealthSnapshot>> {
        self.health.history(limit).await
    }

    pub async fn public_health_summary(&self) -> Result<Option<PublicHealthSummary>> {
        self.health.public_summary().await
    }

    // ========== Signal Operations ==========

    /// Unread signals in the window, optionally restricted to `sectors`
    pub async fn active_sector_signals(
        &self,
        sectors: &[String],
        window_days: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<SectorSignal>> {
        self.propagator
            .active_sector_signals(sectors, window_days, limit)
            .await
    }

    /// Mark old unread signals as read; returns how many were expired
    pub async fn expire_sector_signals(&self, older_than_days: Option<i64>) -> Result<u64> {
        self.propagator.expire_signals(older_than_days).await
    }

    pub async fn propagation_stats(&self) -> Result<PropagationStats> {
        self.propagator.stats().await
    }

    pub async fn timeline_events(&self, subject: Option<&NodeRef>, limit: u32) -> Result<Vec<TimelineEvent>> {
        self.propagator.list_timeline_events(subject, limit).await
    }

    // ========== Story Operations ==========

    /// Start generating a story; the handle resolves to its final state
    ///
    /// A `story_generated` event is recorded when generation finishes, whether
    /// or not the handle is awaited.
    pub async fn generate_story(&self, request: StoryRequest) -> Result<(Story, JoinHandle<Story>)> {
        let (story, generation) = self.stories.generate(request).await?;
        let events = self.events.clone();
        let mut fallback = story.clone();
        let handle = tokio::spawn(async move {
            let finished = match generation.await {
                Ok(finished) => finished,
                Err(e) => {
                    error!(story_id = %fallback.id, error = %e, "Story generation task failed");
                    fallback.mark_failed(format!("generation task failed: {}", e));
                    fallback
                }
            };
            events.extend([GraphEvent::story_generated(&finished)]);
            finished
        });
        Ok((story, handle))
    }

    /// Generate a story and wait for the generator to finish
    pub async fn generate_story_and_wait(&self, request: StoryRequest) -> Result<Story> {
        let (_, handle) = self.generate_story(request).await?;
        handle
            .await
            .map_err(|e| Error::NarrativeFailed(format!("generation task failed: {}", e)))
    }

    pub async fn get_story(&self, id: &str) -> Result<Story> {
        self.stories.get(id).await
    }

    pub async fn list_stories(&self, filter: &StoryFilter) -> Result<Vec<Story>> {
        self.stories.list(filter).await
    }

    pub async fn set_story_published(&self, id: &str, published: bool) -> Result<Story> {
        self.stories.set_published(id, published).await
    }

    async fn propagate(&self, link: &Link) {
        if !self.propagator.enabled() {
            return;
        }
        let outcome = self.propagator.on_link_created(link).await;
        if !outcome.errors.is_empty() {
            warn!(link_id = %link.id, errors = outcome.errors.len(), "Propagation finished with errors");
        }
        self.record_propagation(&outcome);
    }

    fn record_propagation(&self, outcome: &PropagationOutcome) {
        self.record_events(
            outcome
                .timeline_events
                .iter()
                .map(GraphEvent::timeline_event_created)
                .chain(outcome.sector_signals.iter().map(GraphEvent::sector_signal_created)),
        );
    }
}
