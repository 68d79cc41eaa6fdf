//! Narrative stories
//!
//! Story text comes from an external generator behind [`NarrativeGenerator`].
//! The engine only persists the result and registers ready stories as
//! document nodes so they can be linked later.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::link::LinkFilter;
use super::node::{NodeRecord, NodeRef};
use super::related::why_linked;
use super::repository::GraphRepository;
use super::vocab::{NodeOrigin, NodeType, StoryStatus};
use crate::error::{Error, Result};

/// Links summarized into a narrative prompt
const PROMPT_CONTEXT_LINKS: u32 = 25;

/// A persisted narrative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub subject: Option<NodeRef>,
    pub title: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub summary: Option<String>,
    pub body: Option<String>,
    pub status: StoryStatus,
    pub published: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    /// New pending story for a request
    pub fn pending(request: &StoryRequest) -> Self {
        let now = Utc::now();
        Self {
            id: story_id(request.subject.as_ref(), now),
            subject: request.subject.clone(),
            title: request.title.clone(),
            period_start: request.period_start,
            period_end: request.period_end,
            summary: None,
            body: None,
            status: StoryStatus::Pending,
            published: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_ready(&mut self, narrative: Narrative) {
        self.summary = narrative.summary;
        self.body = Some(narrative.body);
        self.status = StoryStatus::Ready;
        self.error = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StoryStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Document node a ready story is registered as
    pub fn node(&self) -> NodeRef {
        NodeRef::new(NodeType::Document, self.id.clone())
    }
}

/// `story_{subject_type}_{subject_id|all}_{unix_ts}`
pub fn story_id(subject: Option<&NodeRef>, at: DateTime<Utc>) -> String {
    match subject {
        Some(node) => format!("story_{}_{}_{}", node.node_type, node.node_id, at.timestamp()),
        None => format!("story_all_{}", at.timestamp()),
    }
}

/// Input for generating a story
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryRequest {
    pub subject: Option<NodeRef>,
    pub title: String,
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    /// Extra instructions passed to the generator
    #[serde(default)]
    pub guidance: Option<String>,
}

/// What the generator is asked to write about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativePrompt {
    pub title: String,
    pub subject: Option<NodeRef>,
    pub subject_label: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    /// One line per related item, e.g. `Mentioned in this document: Q3 Report`
    pub context: Vec<String>,
    pub guidance: Option<String>,
}

/// Generated narrative text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub summary: Option<String>,
    pub body: String,
}

/// External text generator
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    async fn generate(&self, prompt: &NarrativePrompt) -> Result<Narrative>;
}

/// Filter for listing stories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryFilter {
    pub subject: Option<NodeRef>,
    pub published: Option<bool>,
    pub limit: Option<u32>,
}

/// Persists stories and runs generation off the caller's path
pub struct StoryService<R: GraphRepository + ?Sized + 'static> {
    repository: Arc<R>,
    generator: Arc<dyn NarrativeGenerator>,
    timeout: Duration,
}

impl<R: GraphRepository + ?Sized + 'static> StoryService<R> {
    pub fn new(repository: Arc<R>, generator: Arc<dyn NarrativeGenerator>, timeout: Duration) -> Self {
        Self {
            repository,
            generator,
            timeout,
        }
    }

    /// Persist a pending story and start generating it in the background
    ///
    /// The returned handle resolves to the story in its final state. Dropping
    /// it does not cancel generation.
    pub async fn generate(&self, request: StoryRequest) -> Result<(Story, JoinHandle<Story>)> {
        if request.title.trim().is_empty() {
            return Err(Error::InvalidInput("story title must not be empty".into()));
        }

        let mut story = Story::pending(&request);
        let base_id = story.id.clone();
        let mut suffix = 1;
        while self.repository.get_story(&story.id).await?.is_some() {
            suffix += 1;
            story.id = format!("{}_{}", base_id, suffix);
        }
        self.repository.save_story(&story).await?;
        info!(story_id = %story.id, "Story queued for generation");

        let prompt = self.prompt(&request).await?;
        let repository = self.repository.clone();
        let generator = self.generator.clone();
        let timeout = self.timeout;
        let mut pending = story.clone();

        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, generator.generate(&prompt)).await {
                Ok(Ok(narrative)) => pending.mark_ready(narrative),
                Ok(Err(e)) => {
                    error!(story_id = %pending.id, error = %e, "Story generation failed");
                    pending.mark_failed(e.to_string());
                }
                Err(_) => {
                    let e = Error::NarrativeTimeout(timeout.as_secs());
                    error!(story_id = %pending.id, "Story generation timed out");
                    pending.mark_failed(e.to_string());
                }
            }

            if let Err(e) = repository.save_story(&pending).await {
                error!(story_id = %pending.id, error = %e, "Failed to persist generated story");
                return pending;
            }
            if pending.status == StoryStatus::Ready {
                let mut record = NodeRecord::new(NodeType::Document, pending.id.clone())
                    .with_label(pending.title.clone())
                    .with_metadata("story_id", pending.id.clone())
                    .with_origin(NodeOrigin::Narrative);
                record.body = pending.body.clone();
                if let Some(subject) = &pending.subject {
                    record = record.with_metadata("subject", subject.to_string());
                }
                if let Err(e) = repository.upsert_node(&record).await {
                    warn!(story_id = %pending.id, error = %e, "Failed to register story as a document");
                }
                info!(story_id = %pending.id, "Story ready");
            }
            pending
        });

        Ok((story, handle))
    }

    pub async fn get(&self, id: &str) -> Result<Story> {
        self.repository
            .get_story(id)
            .await?
            .ok_or_else(|| Error::StoryNotFound(id.to_string()))
    }

    pub async fn list(&self, filter: &StoryFilter) -> Result<Vec<Story>> {
        self.repository.list_stories(filter).await
    }

    /// Publish or unpublish; only ready stories can be published
    pub async fn set_published(&self, id: &str, published: bool) -> Result<Story> {
        let mut story = self.get(id).await?;
        if published && story.status != StoryStatus::Ready {
            return Err(Error::InvalidInput(format!(
                "story '{}' is {} and cannot be published",
                id, story.status
            )));
        }
        if story.published != published {
            story.published = published;
            story.updated_at = Utc::now();
            self.repository.save_story(&story).await?;
            info!(story_id = %id, published, "Story publication changed");
        }
        Ok(story)
    }

    async fn prompt(&self, request: &StoryRequest) -> Result<NarrativePrompt> {
        let mut prompt = NarrativePrompt {
            title: request.title.clone(),
            subject: request.subject.clone(),
            subject_label: None,
            period_start: request.period_start,
            period_end: request.period_end,
            context: Vec::new(),
            guidance: request.guidance.clone(),
        };
        let Some(subject) = &request.subject else {
            return Ok(prompt);
        };

        prompt.subject_label = self
            .repository
            .get_node(subject)
            .await?
            .map(|record| record.display_label());
        let links = self
            .repository
            .list_links_for_node(subject, &LinkFilter::active().with_limit(PROMPT_CONTEXT_LINKS))
            .await?;
        for link in links {
            if let Some((other, label)) = link.other_end(subject) {
                let label = label.map(str::to_string).unwrap_or_else(|| other.default_label());
                prompt.context.push(format!(
                    "{}: {}",
                    why_linked(link.link_type, link.method, link.confidence),
                    label
                ));
            }
        }
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::repository::NodeRepository;
    use crate::infrastructure::graph::SqliteGraphRepository;
    use crate::storage::migrations::run_migrations;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn test_story_id_format() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let node = NodeRef::new(NodeType::Entity, "bank-x");
        assert_eq!(
            story_id(Some(&node), at),
            format!("story_entity_bank-x_{}", at.timestamp())
        );
        assert_eq!(story_id(None, at), format!("story_all_{}", at.timestamp()));
    }

    struct FixedGenerator;

    #[async_trait]
    impl NarrativeGenerator for FixedGenerator {
        async fn generate(&self, prompt: &NarrativePrompt) -> Result<Narrative> {
            Ok(Narrative {
                summary: Some(format!("{} ({} links)", prompt.title, prompt.context.len())),
                body: "Body text".into(),
            })
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl NarrativeGenerator for FailingGenerator {
        async fn generate(&self, _prompt: &NarrativePrompt) -> Result<Narrative> {
            Err(Error::NarrativeFailed("service unavailable".into()))
        }
    }

    struct SlowGenerator;

    #[async_trait]
    impl NarrativeGenerator for SlowGenerator {
        async fn generate(&self, _prompt: &NarrativePrompt) -> Result<Narrative> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(Error::NarrativeFailed("unreachable".into()))
        }
    }

    async fn service(
        generator: Arc<dyn NarrativeGenerator>,
        timeout: Duration,
    ) -> (Arc<SqliteGraphRepository>, StoryService<SqliteGraphRepository>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqliteGraphRepository::new(pool));
        (repo.clone(), StoryService::new(repo, generator, timeout))
    }

    fn request(title: &str) -> StoryRequest {
        StoryRequest {
            subject: Some(NodeRef::new(NodeType::Entity, "bank-x")),
            title: title.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_generate_marks_ready_and_registers_document() {
        let (repo, service) = service(Arc::new(FixedGenerator), Duration::from_secs(5)).await;
        let (pending, handle) = service.generate(request("Bank X brief")).await.unwrap();
        assert_eq!(pending.status, StoryStatus::Pending);

        let done = handle.await.unwrap();
        assert_eq!(done.status, StoryStatus::Ready);
        assert_eq!(done.body.as_deref(), Some("Body text"));

        let stored = service.get(&pending.id).await.unwrap();
        assert_eq!(stored.status, StoryStatus::Ready);
        let node = repo.get_node(&stored.node()).await.unwrap().unwrap();
        assert_eq!(node.origin, NodeOrigin::Narrative);

        let published = service.set_published(&pending.id, true).await.unwrap();
        assert!(published.published);
        let listed = service
            .list(&StoryFilter {
                published: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_generation_failure_is_recorded() {
        let (_repo, service) = service(Arc::new(FailingGenerator), Duration::from_secs(5)).await;
        let (pending, handle) = service.generate(request("Brief")).await.unwrap();
        let done = handle.await.unwrap();
        assert_eq!(done.status, StoryStatus::Failed);
        assert!(done.error.unwrap().contains("service unavailable"));

        let err = service.set_published(&pending.id, true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_generation_timeout() {
        let (_repo, service) = service(Arc::new(SlowGenerator), Duration::from_millis(50)).await;
        let (_pending, handle) = service.generate(request("Brief")).await.unwrap();
        let done = handle.await.unwrap();
        assert_eq!(done.status, StoryStatus::Failed);
        assert!(done.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_same_second_requests_get_distinct_ids() {
        let (_repo, service) = service(Arc::new(FixedGenerator), Duration::from_secs(5)).await;
        let (a, ha) = service.generate(request("One")).await.unwrap();
        let (b, hb) = service.generate(request("Two")).await.unwrap();
        ha.await.unwrap();
        hb.await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(matches!(service.get("missing").await, Err(Error::StoryNotFound(_))));
    }

    #[test]
    fn test_story_lifecycle() {
        let request = StoryRequest {
            title: "Weekly banking brief".into(),
            ..Default::default()
        };
        let mut story = Story::pending(&request);
        assert_eq!(story.status, StoryStatus::Pending);
        assert!(!story.published);

        story.mark_failed("timeout");
        assert_eq!(story.status, StoryStatus::Failed);

        story.mark_ready(Narrative {
            summary: Some("short".into()),
            body: "long".into(),
        });
        assert_eq!(story.status, StoryStatus::Ready);
        assert!(story.error.is_none());
        assert_eq!(story.node().node_type, NodeType::Document);
    }
}
