//! Story persistence

use async_trait::async_trait;
use sqlx::FromRow;
use tracing::debug;

use super::{SqliteGraphRepository, node_ref, parse_date, parse_timestamp, parse_vocab};
use crate::domain::graph::{Story, StoryFilter, StoryRepository, StoryStatus};
use crate::error::Result;

/// Stored subject type for stories about the whole graph
const ALL_SUBJECTS: &str = "all";

const DEFAULT_STORY_LIMIT: u32 = 50;

#[async_trait]
impl StoryRepository for SqliteGraphRepository {
    async fn save_story(&self, story: &Story) -> Result<()> {
        let (subject_type, subject_id) = match &story.subject {
            Some(subject) => (subject.node_type.as_str(), Some(subject.node_id.as_str())),
            None => (ALL_SUBJECTS, None),
        };

        sqlx::query(
            r#"
            INSERT INTO stories (
                id, subject_type, subject_id, title, period_start, period_end,
                summary, body, status, published, error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                summary = excluded.summary,
                body = excluded.body,
                status = excluded.status,
                published = excluded.published,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&story.id)
        .bind(subject_type)
        .bind(subject_id)
        .bind(&story.title)
        .bind(story.period_start.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(story.period_end.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(&story.summary)
        .bind(&story.body)
        .bind(story.status.as_str())
        .bind(story.published)
        .bind(&story.error)
        .bind(story.created_at.to_rfc3339())
        .bind(story.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(story_id = %story.id, status = %story.status, "Story saved");
        Ok(())
    }

    async fn get_story(&self, id: &str) -> Result<Option<Story>> {
        let row: Option<StoryRow> = sqlx::query_as("SELECT * FROM stories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_story()).transpose()
    }

    async fn list_stories(&self, filter: &StoryFilter) -> Result<Vec<Story>> {
        let subject_type = filter.subject.as_ref().map(|s| s.node_type.as_str());
        let subject_id = filter.subject.as_ref().map(|s| s.node_id.as_str());
        let rows: Vec<StoryRow> = sqlx::query_as(
            r#"
            SELECT * FROM stories
            WHERE (? IS NULL OR (subject_type = ? AND subject_id = ?))
              AND (? IS NULL OR published = ?)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(subject_type)
        .bind(subject_type)
        .bind(subject_id)
        .bind(filter.published)
        .bind(filter.published)
        .bind(filter.limit.unwrap_or(DEFAULT_STORY_LIMIT) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_story()).collect()
    }
}

#[derive(Debug, FromRow)]
struct StoryRow {
    id: String,
    subject_type: String,
    subject_id: Option<String>,
    title: String,
    period_start: Option<String>,
    period_end: Option<String>,
    summary: Option<String>,
    body: Option<String>,
    status: String,
    published: bool,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StoryRow {
    fn into_story(self) -> Result<Story> {
        let subject = match (self.subject_type.as_str(), self.subject_id) {
            (ALL_SUBJECTS, _) | (_, None) => None,
            (subject_type, Some(subject_id)) => Some(node_ref(subject_type, subject_id)?),
        };

        Ok(Story {
            id: self.id,
            subject,
            title: self.title,
            period_start: parse_date("period_start", self.period_start.as_deref())?,
            period_end: parse_date("period_end", self.period_end.as_deref())?,
            summary: self.summary,
            body: self.body,
            status: parse_vocab("story status", &self.status, StoryStatus::parse)?,
            published: self.published,
            error: self.error,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{NodeRef, NodeType, StoryRequest};
    use crate::storage::migrations::run_migrations;
    use chrono::NaiveDate;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_story_round_trip_and_filters() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = SqliteGraphRepository::new(pool);

        let bank = NodeRef::new(NodeType::Entity, "bank-x");
        let mut about_bank = Story::pending(&StoryRequest {
            subject: Some(bank.clone()),
            title: "Bank X".into(),
            period_start: NaiveDate::from_ymd_opt(2025, 1, 1),
            period_end: NaiveDate::from_ymd_opt(2025, 3, 31),
            guidance: None,
        });
        about_bank.published = true;
        repo.save_story(&about_bank).await.unwrap();

        let overview = Story::pending(&StoryRequest {
            title: "Weekly overview".into(),
            ..StoryRequest::default()
        });
        repo.save_story(&overview).await.unwrap();

        let loaded = repo.get_story(&about_bank.id).await.unwrap().unwrap();
        assert_eq!(loaded.subject, Some(bank.clone()));
        assert_eq!(loaded.period_end, NaiveDate::from_ymd_opt(2025, 3, 31));
        assert!(repo.get_story(&overview.id).await.unwrap().unwrap().subject.is_none());

        let published = repo
            .list_stories(&StoryFilter {
                published: Some(true),
                ..StoryFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(published.len(), 1);

        let for_bank = repo
            .list_stories(&StoryFilter {
                subject: Some(bank),
                ..StoryFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(for_bank.len(), 1);
        assert_eq!(repo.list_stories(&StoryFilter::default()).await.unwrap().len(), 2);
    }
}
