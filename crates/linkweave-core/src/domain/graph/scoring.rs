//! Scoring and deduplication
//!
//! Every link write in the engine goes through [`LinkWriter`]. Under the
//! tuple lock it looks for an existing active link, merges into it when one
//! exists, and otherwise routes the candidate to the link store or the
//! review queue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::link::{CandidateLink, ConfidenceBands, Link, LinkKey, LinkWrite};
use super::locks::TupleLocks;
use super::node::NodeRef;
use super::repository::GraphRepository;
use super::review::{ReviewEntry, ReviewResolution};
use super::vocab::{ConfidenceLevel, LinkStatus, ReviewPriority, ReviewReason, ReviewStatus};
use crate::error::{Error, Result};

/// How a candidate may be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Discovered by a rule
    Rule { auto_approve: bool },
    /// Admin or propagation write; always active, never queued
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    SelfLink,
    PreviouslyRejected,
}

/// Result of submitting one candidate
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Created(Link),
    /// Merged into an existing active link
    Updated(Link),
    Queued(ReviewEntry),
    /// Folded into an existing pending review entry
    QueueRefreshed(ReviewEntry),
    Discarded(DiscardReason),
}

impl WriteOutcome {
    pub fn link(&self) -> Option<&Link> {
        match self {
            Self::Created(link) | Self::Updated(link) => Some(link),
            _ => None,
        }
    }
}

pub struct LinkWriter<R: GraphRepository + ?Sized> {
    repository: Arc<R>,
    bands: ConfidenceBands,
    locks: TupleLocks,
}

impl<R: GraphRepository + ?Sized> LinkWriter<R> {
    pub fn new(repository: Arc<R>, bands: ConfidenceBands) -> Self {
        Self {
            repository,
            bands,
            locks: TupleLocks::new(),
        }
    }

    pub fn bands(&self) -> &ConfidenceBands {
        &self.bands
    }

    /// Score, deduplicate and route one candidate
    pub async fn submit(&self, candidate: CandidateLink, policy: WritePolicy) -> Result<WriteOutcome> {
        if candidate.is_self_link() {
            debug!(node = %candidate.src, "Discarding self-link");
            return Ok(WriteOutcome::Discarded(DiscardReason::SelfLink));
        }

        let key = candidate.key();
        let _guard = self.locks.acquire(key.lock_key()).await;

        let existing = self.repository.find_links_for_tuple(&key, true).await?;
        if let Some(active) = find_active(&existing, &key, candidate.bidirectional) {
            return self.merge(active.clone(), &candidate).await;
        }

        let confidence = self.bands.classify(candidate.strength);

        let auto_approve = match policy {
            WritePolicy::Manual => {
                let pending = self.pending_entry(&key).await?;
                return self.insert_active(candidate, confidence, pending).await;
            }
            WritePolicy::Rule { auto_approve } => auto_approve,
        };

        let reviews = self.repository.find_reviews_for_tuple(&key).await?;
        if let Some(pending) = reviews.iter().find(|r| r.status == ReviewStatus::Pending) {
            let mut entry = pending.clone();
            entry.refresh(&candidate, &self.bands);
            self.repository.update_review(&entry).await?;
            debug!(review_id = %entry.id, link = %key, "Pending review refreshed");
            return Ok(WriteOutcome::QueueRefreshed(entry));
        }
        if reviews.iter().any(|r| r.status == ReviewStatus::Rejected) {
            debug!(link = %key, "Skipping previously rejected candidate");
            return Ok(WriteOutcome::Discarded(DiscardReason::PreviouslyRejected));
        }

        let deprecated = existing
            .iter()
            .any(|l| l.key() == key && l.status == LinkStatus::Deprecated);
        if deprecated {
            return self
                .queue(
                    candidate,
                    confidence,
                    ReviewReason::ConflictsWithExisting,
                    ReviewPriority::High,
                )
                .await;
        }

        if auto_approve && confidence >= ConfidenceLevel::Medium {
            return self.insert_active(candidate, confidence, None).await;
        }

        let reason = if auto_approve {
            ReviewReason::BelowThreshold
        } else {
            ReviewReason::RuleNotAutoApproving
        };
        self.queue(candidate, confidence, reason, ReviewPriority::from_confidence(confidence))
            .await
    }

    /// Approve a review entry, writing its candidate as an active link
    ///
    /// The existence check is repeated under the tuple lock. Resolved entries
    /// are returned unchanged.
    pub async fn approve(&self, id: &str, reviewer: &str, notes: Option<String>) -> Result<ReviewResolution> {
        let entry = self
            .repository
            .get_review(id)
            .await?
            .ok_or_else(|| Error::ReviewEntryNotFound(id.to_string()))?;
        let key = entry.key();
        let _guard = self.locks.acquire(key.lock_key()).await;

        // Re-read: a concurrent reviewer may have resolved it while we waited
        let mut entry = self
            .repository
            .get_review(id)
            .await?
            .ok_or_else(|| Error::ReviewEntryNotFound(id.to_string()))?;
        if entry.is_resolved() {
            debug!(review_id = %id, status = %entry.status, "Review already resolved");
            return Ok(ReviewResolution {
                entry,
                changed: false,
                link_created: false,
            });
        }

        let (write, link_created) = self.approval_write(&entry).await?;
        entry.mark_approved(&write.link().id, reviewer, notes);
        self.repository.commit_approval(&entry, &write).await?;
        self.invalidate(&write.link().nodes()).await;

        info!(
            review_id = %entry.id,
            link_id = %write.link().id,
            reviewer = %reviewer,
            "Review approved"
        );
        Ok(ReviewResolution {
            entry,
            changed: true,
            link_created,
        })
    }

    /// Reject a review entry; no link is written
    pub async fn reject(&self, id: &str, reviewer: &str, notes: Option<String>) -> Result<ReviewResolution> {
        let entry = self
            .repository
            .get_review(id)
            .await?
            .ok_or_else(|| Error::ReviewEntryNotFound(id.to_string()))?;
        let key = entry.key();
        let _guard = self.locks.acquire(key.lock_key()).await;

        let mut entry = self
            .repository
            .get_review(id)
            .await?
            .ok_or_else(|| Error::ReviewEntryNotFound(id.to_string()))?;
        if entry.is_resolved() {
            debug!(review_id = %id, status = %entry.status, "Review already resolved");
            return Ok(ReviewResolution {
                entry,
                changed: false,
                link_created: false,
            });
        }

        entry.mark_rejected(reviewer, notes);
        self.repository.update_review(&entry).await?;
        info!(review_id = %entry.id, reviewer = %reviewer, "Review rejected");
        Ok(ReviewResolution {
            entry,
            changed: true,
            link_created: false,
        })
    }

    /// Drop cached related items for `nodes`; failures are logged only
    pub async fn invalidate(&self, nodes: &[NodeRef]) {
        if let Err(e) = self.repository.invalidate_related(nodes).await {
            warn!(error = %e, "Failed to invalidate related-items cache");
        }
    }

    async fn approval_write(&self, entry: &ReviewEntry) -> Result<(LinkWrite, bool)> {
        let key = entry.key();
        let existing = self.repository.find_links_for_tuple(&key, true).await?;
        if let Some(active) = find_active(&existing, &key, entry.candidate.bidirectional) {
            let mut link = active.clone();
            link.absorb(&entry.candidate, &self.bands);
            return Ok((LinkWrite::Update(link), false));
        }
        let confidence = self.bands.classify(entry.candidate.strength);
        let link = entry.candidate.clone().into_link(confidence, LinkStatus::Active);
        Ok((LinkWrite::Insert(link), true))
    }

    async fn merge(&self, mut link: Link, candidate: &CandidateLink) -> Result<WriteOutcome> {
        let changed = link.absorb(candidate, &self.bands);
        self.repository.update_link(&link).await?;
        if changed {
            self.invalidate(&link.nodes()).await;
        }
        debug!(link_id = %link.id, changed, "Existing link refreshed");
        Ok(WriteOutcome::Updated(link))
    }

    async fn pending_entry(&self, key: &LinkKey) -> Result<Option<ReviewEntry>> {
        Ok(self
            .repository
            .find_reviews_for_tuple(key)
            .await?
            .into_iter()
            .find(|r| r.status == ReviewStatus::Pending))
    }

    /// Insert a new active link; a pending entry for the tuple is approved with it
    async fn insert_active(
        &self,
        candidate: CandidateLink,
        confidence: ConfidenceLevel,
        pending: Option<ReviewEntry>,
    ) -> Result<WriteOutcome> {
        let key = candidate.key();
        let link = candidate.clone().into_link(confidence, LinkStatus::Active);

        let written = match pending {
            Some(mut entry) => {
                let reviewer = link.created_by.clone().unwrap_or_else(|| "manual".to_string());
                entry.mark_approved(&link.id, &reviewer, None);
                self.repository
                    .commit_approval(&entry, &LinkWrite::Insert(link.clone()))
                    .await
            }
            None => self.repository.insert_link(&link).await,
        };

        match written {
            Ok(()) => {
                self.invalidate(&link.nodes()).await;
                info!(
                    link_id = %link.id,
                    link_type = %link.link_type,
                    src = %link.src,
                    dst = %link.dst,
                    confidence = %link.confidence,
                    "Link created"
                );
                Ok(WriteOutcome::Created(link))
            }
            Err(e) if e.is_unique_violation() => {
                // Lost a race with another writer; fold into the winner
                let existing = self.repository.find_links_for_tuple(&key, true).await?;
                match find_active(&existing, &key, candidate.bidirectional) {
                    Some(active) => self.merge(active.clone(), &candidate).await,
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn queue(
        &self,
        candidate: CandidateLink,
        confidence: ConfidenceLevel,
        reason: ReviewReason,
        priority: ReviewPriority,
    ) -> Result<WriteOutcome> {
        let entry = ReviewEntry::new(candidate.clone(), confidence, reason, priority);
        match self.repository.insert_review(&entry).await {
            Ok(()) => {
                info!(
                    review_id = %entry.id,
                    link = %entry.key(),
                    reason = %reason,
                    priority = %priority,
                    "Link queued for review"
                );
                Ok(WriteOutcome::Queued(entry))
            }
            Err(e) if e.is_unique_violation() => match self.pending_entry(&entry.key()).await? {
                Some(mut pending) => {
                    pending.refresh(&candidate, &self.bands);
                    self.repository.update_review(&pending).await?;
                    Ok(WriteOutcome::QueueRefreshed(pending))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}

/// The active link answering `key`, honoring bidirectional flags on either side
fn find_active<'a>(links: &'a [Link], key: &LinkKey, bidirectional: bool) -> Option<&'a Link> {
    let reversed = key.reversed();
    links.iter().find(|l| {
        l.status == LinkStatus::Active
            && (l.answers(key) || (bidirectional && l.key() == reversed))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::link::Evidence;
    use crate::domain::graph::repository::{LinkRepository, ReviewRepository};
    use crate::domain::graph::vocab::{LinkType, NodeType};
    use crate::infrastructure::graph::SqliteGraphRepository;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn writer() -> (Arc<SqliteGraphRepository>, LinkWriter<SqliteGraphRepository>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqliteGraphRepository::new(pool));
        let writer = LinkWriter::new(repo.clone(), ConfidenceBands::default());
        (repo, writer)
    }

    fn candidate(strength: f64) -> CandidateLink {
        CandidateLink::new(
            LinkType::Mentions,
            NodeRef::new(NodeType::Document, "1"),
            NodeRef::new(NodeType::Entity, "bank-x"),
            strength,
        )
    }

    const AUTO: WritePolicy = WritePolicy::Rule { auto_approve: true };
    const REVIEW: WritePolicy = WritePolicy::Rule { auto_approve: false };

    #[tokio::test]
    async fn test_self_link_is_discarded() {
        let (repo, writer) = writer().await;
        let node = NodeRef::new(NodeType::Entity, "a");
        let self_link = CandidateLink::new(LinkType::RelatedTo, node.clone(), node.clone(), 0.9);

        let outcome = writer.submit(self_link.clone(), AUTO).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Discarded(DiscardReason::SelfLink)));
        let outcome = writer.submit(self_link, WritePolicy::Manual).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Discarded(DiscardReason::SelfLink)));
        assert_eq!(repo.link_stats().await.unwrap().total, 0);
        assert_eq!(repo.count_pending_reviews().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rediscovery_merges_into_existing_link() {
        let (repo, writer) = writer().await;
        let first = writer.submit(candidate(0.6), AUTO).await.unwrap();
        let WriteOutcome::Created(created) = first else {
            panic!("expected a created link");
        };

        let again = candidate(0.9).with_evidence(Evidence::snippet("bank_name = Bank X"));
        let WriteOutcome::Updated(updated) = writer.submit(again, AUTO).await.unwrap() else {
            panic!("expected an update");
        };
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.strength, 0.9);
        assert_eq!(updated.confidence, ConfidenceLevel::High);

        let weaker = writer.submit(candidate(0.1), AUTO).await.unwrap();
        assert_eq!(weaker.link().unwrap().strength, 0.9);
        assert_eq!(repo.link_stats().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_routing_by_confidence_and_auto_approve() {
        let (repo, writer) = writer().await;

        let low = writer.submit(candidate(0.35), AUTO).await.unwrap();
        let WriteOutcome::Queued(entry) = low else {
            panic!("expected queue");
        };
        assert_eq!(entry.reason, ReviewReason::BelowThreshold);
        assert_eq!(entry.priority, ReviewPriority::Low);

        let other = CandidateLink::new(
            LinkType::Publishes,
            NodeRef::new(NodeType::Entity, "cby"),
            NodeRef::new(NodeType::Document, "1"),
            0.95,
        );
        let WriteOutcome::Queued(entry) = writer.submit(other, REVIEW).await.unwrap() else {
            panic!("non-auto rules always queue");
        };
        assert_eq!(entry.reason, ReviewReason::RuleNotAutoApproving);
        assert_eq!(entry.priority, ReviewPriority::High);

        let refreshed = writer.submit(candidate(0.55), AUTO).await.unwrap();
        assert!(matches!(refreshed, WriteOutcome::QueueRefreshed(_)));
        assert_eq!(repo.count_pending_reviews().await.unwrap(), 2);
        assert_eq!(repo.link_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_bidirectional_candidate_matches_reverse_link() {
        let (repo, writer) = writer().await;
        let forward = CandidateLink::new(
            LinkType::RelatedTo,
            NodeRef::new(NodeType::Document, "1"),
            NodeRef::new(NodeType::Document, "2"),
            0.7,
        );
        writer.submit(forward.clone(), AUTO).await.unwrap();

        let reverse = CandidateLink::new(LinkType::RelatedTo, forward.dst.clone(), forward.src.clone(), 0.8)
            .bidirectional(true);
        let outcome = writer.submit(reverse, AUTO).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Updated(_)));
        assert_eq!(repo.link_stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_review_round_trip() {
        let (repo, writer) = writer().await;
        let WriteOutcome::Queued(entry) = writer.submit(candidate(0.9), REVIEW).await.unwrap() else {
            panic!("expected queue");
        };

        let resolution = writer.approve(&entry.id, "analyst", Some("ok".into())).await.unwrap();
        assert!(resolution.changed);
        assert!(resolution.link_created);
        let link_id = resolution.entry.link_id.clone().unwrap();
        let link = repo.get_link(&link_id).await.unwrap().unwrap();
        assert_eq!(link.status, LinkStatus::Active);
        assert_eq!(link.key(), entry.key());

        let again = writer.approve(&entry.id, "analyst", None).await.unwrap();
        assert!(!again.changed);
        assert_eq!(repo.link_stats().await.unwrap().active, 1);

        let rejected_after = writer.reject(&entry.id, "analyst", None).await.unwrap();
        assert!(!rejected_after.changed);
        assert_eq!(rejected_after.entry.status, ReviewStatus::Approved);
    }

    #[tokio::test]
    async fn test_rejected_tuple_is_not_requeued() {
        let (repo, writer) = writer().await;
        let WriteOutcome::Queued(entry) = writer.submit(candidate(0.4), REVIEW).await.unwrap() else {
            panic!("expected queue");
        };
        writer.reject(&entry.id, "analyst", Some("wrong bank".into())).await.unwrap();

        let outcome = writer.submit(candidate(0.4), REVIEW).await.unwrap();
        assert!(matches!(
            outcome,
            WriteOutcome::Discarded(DiscardReason::PreviouslyRejected)
        ));
        assert_eq!(repo.link_stats().await.unwrap().total, 0);
        assert_eq!(repo.count_pending_reviews().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_review_entry_is_not_found() {
        let (_repo, writer) = writer().await;
        let err = writer.approve("nope", "analyst", None).await.unwrap_err();
        assert!(matches!(err, Error::ReviewEntryNotFound(_)));
        let err = writer.reject("nope", "analyst", None).await.unwrap_err();
        assert!(matches!(err, Error::ReviewEntryNotFound(_)));
    }

    #[tokio::test]
    async fn test_deprecated_link_conflict_is_queued_high() {
        let (repo, writer) = writer().await;
        let WriteOutcome::Created(mut link) = writer.submit(candidate(0.9), AUTO).await.unwrap() else {
            panic!("expected link");
        };
        link.status = LinkStatus::Deprecated;
        repo.update_link(&link).await.unwrap();

        let WriteOutcome::Queued(entry) = writer.submit(candidate(0.9), AUTO).await.unwrap() else {
            panic!("expected conflict queue");
        };
        assert_eq!(entry.reason, ReviewReason::ConflictsWithExisting);
        assert_eq!(entry.priority, ReviewPriority::High);
    }

    #[tokio::test]
    async fn test_concurrent_writers_create_one_link() {
        let (repo, writer) = writer().await;
        let writer = Arc::new(writer);
        let mut handles = Vec::new();
        for i in 0..8 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                writer.submit(candidate(0.5 + i as f64 * 0.05), AUTO).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let stats = repo.link_stats().await.unwrap();
        assert_eq!(stats.active, 1);
        assert!((stats.average_active_strength - 0.85).abs() < 1e-9);
    }
}
