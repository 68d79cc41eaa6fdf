//! Review queue entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::link::{CandidateLink, ConfidenceBands, LinkKey};
use super::vocab::{ConfidenceLevel, ReviewPriority, ReviewReason, ReviewStatus};

/// A candidate link awaiting human judgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub id: String,
    pub candidate: CandidateLink,
    pub confidence: ConfidenceLevel,
    pub reason: ReviewReason,
    pub priority: ReviewPriority,
    pub status: ReviewStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// Link written on approval
    pub link_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewEntry {
    pub fn new(
        candidate: CandidateLink,
        confidence: ConfidenceLevel,
        reason: ReviewReason,
        priority: ReviewPriority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            candidate,
            confidence,
            reason,
            priority,
            status: ReviewStatus::Pending,
            resolved_by: None,
            resolved_at: None,
            notes: None,
            link_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> LinkKey {
        self.candidate.key()
    }

    pub fn is_resolved(&self) -> bool {
        self.status != ReviewStatus::Pending
    }

    /// Fold a re-discovered candidate into a pending entry
    ///
    /// Strength keeps the maximum; priority never drops below its current value.
    pub fn refresh(&mut self, candidate: &CandidateLink, bands: &ConfidenceBands) -> bool {
        let mut changed = false;
        if candidate.strength > self.candidate.strength {
            self.candidate.strength = candidate.strength;
            self.confidence = bands.classify(candidate.strength);
            let derived = ReviewPriority::from_confidence(self.confidence);
            if derived > self.priority {
                self.priority = derived;
            }
            changed = true;
        }
        changed |= self.candidate.evidence.merge(&candidate.evidence);
        self.updated_at = Utc::now();
        changed
    }

    pub fn mark_approved(&mut self, link_id: &str, reviewer: &str, notes: Option<String>) {
        let now = Utc::now();
        self.status = ReviewStatus::Approved;
        self.link_id = Some(link_id.to_string());
        self.resolved_by = Some(reviewer.to_string());
        self.resolved_at = Some(now);
        self.notes = notes;
        self.updated_at = now;
    }

    pub fn mark_rejected(&mut self, reviewer: &str, notes: Option<String>) {
        let now = Utc::now();
        self.status = ReviewStatus::Rejected;
        self.resolved_by = Some(reviewer.to_string());
        self.resolved_at = Some(now);
        self.notes = notes;
        self.updated_at = now;
    }
}

/// Result of an approve/reject call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResolution {
    pub entry: ReviewEntry,
    /// False when the entry was already resolved and nothing changed
    pub changed: bool,
    /// True when approval inserted a new link rather than merging
    pub link_created: bool,
}
