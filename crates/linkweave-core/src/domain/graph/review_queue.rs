//! Review queue service

use std::sync::Arc;

use super::repository::GraphRepository;
use super::review::{ReviewEntry, ReviewResolution};
use super::scoring::LinkWriter;
use super::vocab::ReviewPriority;
use crate::error::{Error, Result};

/// Default page size for pending listings
pub const DEFAULT_PENDING_LIMIT: u32 = 50;

pub struct ReviewQueue<R: GraphRepository + ?Sized> {
    repository: Arc<R>,
    writer: Arc<LinkWriter<R>>,
}

impl<R: GraphRepository + ?Sized> ReviewQueue<R> {
    pub fn new(repository: Arc<R>, writer: Arc<LinkWriter<R>>) -> Self {
        Self { repository, writer }
    }

    /// Pending entries ordered by priority, then age
    pub async fn list_pending(
        &self,
        priority: Option<ReviewPriority>,
        limit: Option<u32>,
    ) -> Result<Vec<ReviewEntry>> {
        self.repository
            .list_pending_reviews(priority, limit.unwrap_or(DEFAULT_PENDING_LIMIT))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<ReviewEntry> {
        self.repository
            .get_review(id)
            .await?
            .ok_or_else(|| Error::ReviewEntryNotFound(id.to_string()))
    }

    /// Approve an entry; already-resolved entries are a no-op success
    pub async fn approve(&self, id: &str, reviewer: &str, notes: Option<String>) -> Result<ReviewResolution> {
        self.writer.approve(id, reviewer, notes).await
    }

    /// Reject an entry; already-resolved entries are a no-op success
    pub async fn reject(&self, id: &str, reviewer: &str, notes: Option<String>) -> Result<ReviewResolution> {
        self.writer.reject(id, reviewer, notes).await
    }

    pub async fn pending_count(&self) -> Result<i64> {
        self.repository.count_pending_reviews().await
    }
}
