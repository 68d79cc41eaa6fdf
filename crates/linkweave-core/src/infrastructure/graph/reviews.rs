//! Review queue persistence

use async_trait::async_trait;
use sqlx::FromRow;
use tracing::debug;

use super::links::{insert_link, update_link};
use super::{SqliteGraphRepository, node_ref, parse_optional_timestamp, parse_timestamp, parse_vocab};
use crate::domain::graph::{
    CandidateLink, ConfidenceLevel, Evidence, LinkKey, LinkMethod, LinkType, LinkWrite, RegimeTag,
    ReviewEntry, ReviewPriority, ReviewReason, ReviewRepository, ReviewStatus,
};
use crate::error::Result;

const PRIORITY_RANK: &str = "CASE priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END";

#[async_trait]
impl ReviewRepository for SqliteGraphRepository {
    async fn insert_review(&self, entry: &ReviewEntry) -> Result<()> {
        let candidate = &entry.candidate;
        sqlx::query(
            r#"
            INSERT INTO review_queue (
                id, link_type, src_type, src_id, src_label, dst_type, dst_id, dst_label,
                strength, confidence, method, evidence_snippet, evidence_url, rule_id,
                bidirectional, public_safe, regime_tag, created_by, reason, priority, status,
                resolved_by, resolved_at, notes, link_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(candidate.link_type.as_str())
        .bind(candidate.src.node_type.as_str())
        .bind(&candidate.src.node_id)
        .bind(&candidate.src_label)
        .bind(candidate.dst.node_type.as_str())
        .bind(&candidate.dst.node_id)
        .bind(&candidate.dst_label)
        .bind(candidate.strength)
        .bind(entry.confidence.as_str())
        .bind(candidate.method.as_str())
        .bind(&candidate.evidence.snippet)
        .bind(&candidate.evidence.url)
        .bind(&candidate.rule_id)
        .bind(candidate.bidirectional)
        .bind(candidate.public_safe)
        .bind(candidate.regime_tag.map(|t| t.as_str()))
        .bind(&candidate.created_by)
        .bind(entry.reason.as_str())
        .bind(entry.priority.as_str())
        .bind(entry.status.as_str())
        .bind(&entry.resolved_by)
        .bind(entry.resolved_at.map(|t| t.to_rfc3339()))
        .bind(&entry.notes)
        .bind(&entry.link_id)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(review_id = %entry.id, link = %entry.key(), "Review entry queued");
        Ok(())
    }

    async fn update_review(&self, entry: &ReviewEntry) -> Result<()> {
        update_review(&self.pool, entry).await
    }

    async fn get_review(&self, id: &str) -> Result<Option<ReviewEntry>> {
        let row: Option<ReviewRow> = sqlx::query_as("SELECT * FROM review_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_entry()).transpose()
    }

    async fn find_reviews_for_tuple(&self, key: &LinkKey) -> Result<Vec<ReviewEntry>> {
        let rows: Vec<ReviewRow> = sqlx::query_as(
            r#"
            SELECT * FROM review_queue
            WHERE link_type = ? AND src_type = ? AND src_id = ? AND dst_type = ? AND dst_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(key.link_type.as_str())
        .bind(key.src.node_type.as_str())
        .bind(&key.src.node_id)
        .bind(key.dst.node_type.as_str())
        .bind(&key.dst.node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_entry()).collect()
    }

    async fn list_pending_reviews(
        &self,
        priority: Option<ReviewPriority>,
        limit: u32,
    ) -> Result<Vec<ReviewEntry>> {
        let sql = format!(
            r#"
            SELECT * FROM review_queue
            WHERE status = 'pending' AND (? IS NULL OR priority = ?)
            ORDER BY {}, created_at, rowid
            LIMIT ?
            "#,
            PRIORITY_RANK
        );
        let priority = priority.map(|p| p.as_str());
        let rows: Vec<ReviewRow> = sqlx::query_as(&sql)
            .bind(priority)
            .bind(priority)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_entry()).collect()
    }

    async fn commit_approval(&self, entry: &ReviewEntry, write: &LinkWrite) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // The link must exist before the entry can reference it
        match write {
            LinkWrite::Insert(link) => insert_link(&mut *tx, link).await?,
            LinkWrite::Update(link) => update_link(&mut *tx, link).await?,
        }
        update_review(&mut *tx, entry).await?;

        tx.commit().await?;
        debug!(review_id = %entry.id, link_id = %write.link().id, "Approval committed");
        Ok(())
    }

    async fn count_pending_reviews(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM review_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

async fn update_review<'e, E>(executor: E, entry: &ReviewEntry) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let candidate = &entry.candidate;
    sqlx::query(
        r#"
        UPDATE review_queue SET
            strength = ?,
            confidence = ?,
            evidence_snippet = ?,
            evidence_url = ?,
            priority = ?,
            status = ?,
            resolved_by = ?,
            resolved_at = ?,
            notes = ?,
            link_id = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(candidate.strength)
    .bind(entry.confidence.as_str())
    .bind(&candidate.evidence.snippet)
    .bind(&candidate.evidence.url)
    .bind(entry.priority.as_str())
    .bind(entry.status.as_str())
    .bind(&entry.resolved_by)
    .bind(entry.resolved_at.map(|t| t.to_rfc3339()))
    .bind(&entry.notes)
    .bind(&entry.link_id)
    .bind(entry.updated_at.to_rfc3339())
    .bind(&entry.id)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct ReviewRow {
    id: String,
    link_type: String,
    src_type: String,
    src_id: String,
    src_label: Option<String>,
    dst_type: String,
    dst_id: String,
    dst_label: Option<String>,
    strength: f64,
    confidence: String,
    method: String,
    evidence_snippet: Option<String>,
    evidence_url: Option<String>,
    rule_id: Option<String>,
    bidirectional: bool,
    public_safe: bool,
    regime_tag: Option<String>,
    created_by: Option<String>,
    reason: String,
    priority: String,
    status: String,
    resolved_by: Option<String>,
    resolved_at: Option<String>,
    notes: Option<String>,
    link_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ReviewRow {
    fn into_entry(self) -> Result<ReviewEntry> {
        let regime_tag = self
            .regime_tag
            .as_deref()
            .map(|t| parse_vocab("regime tag", t, RegimeTag::parse))
            .transpose()?;

        let candidate = CandidateLink {
            link_type: parse_vocab("link type", &self.link_type, LinkType::parse)?,
            src: node_ref(&self.src_type, self.src_id)?,
            src_label: self.src_label,
            dst: node_ref(&self.dst_type, self.dst_id)?,
            dst_label: self.dst_label,
            strength: self.strength,
            method: parse_vocab("link method", &self.method, LinkMethod::parse)?,
            rule_id: self.rule_id,
            evidence: Evidence {
                snippet: self.evidence_snippet,
                url: self.evidence_url,
            },
            bidirectional: self.bidirectional,
            public_safe: self.public_safe,
            regime_tag,
            created_by: self.created_by,
        };

        Ok(ReviewEntry {
            id: self.id,
            candidate,
            confidence: parse_vocab("confidence", &self.confidence, ConfidenceLevel::parse)?,
            reason: parse_vocab("review reason", &self.reason, ReviewReason::parse)?,
            priority: parse_vocab("review priority", &self.priority, ReviewPriority::parse)?,
            status: parse_vocab("review status", &self.status, ReviewStatus::parse)?,
            resolved_by: self.resolved_by,
            resolved_at: parse_optional_timestamp("resolved_at", self.resolved_at.as_deref())?,
            notes: self.notes,
            link_id: self.link_id,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}
