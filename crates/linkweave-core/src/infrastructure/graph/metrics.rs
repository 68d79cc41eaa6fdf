//! Health snapshot persistence

use async_trait::async_trait;
use sqlx::FromRow;
use tracing::debug;

use super::{SqliteGraphRepository, from_json, parse_timestamp, to_json};
use crate::domain::graph::{HealthSnapshot, MetricsRepository};
use crate::error::Result;

#[async_trait]
impl MetricsRepository for SqliteGraphRepository {
    async fn append_snapshot(&self, snapshot: &HealthSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO health_snapshots (
                id, calculated_at, total_links, active_links, needs_review_links,
                deprecated_links, pending_reviews, links_with_evidence_pct,
                links_with_anchors_pct, docs_linked_to_sectors_pct,
                average_strength, link_type_distribution, coverage
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(snapshot.calculated_at.to_rfc3339())
        .bind(snapshot.total_links)
        .bind(snapshot.active_links)
        .bind(snapshot.needs_review_links)
        .bind(snapshot.deprecated_links)
        .bind(snapshot.pending_reviews)
        .bind(snapshot.links_with_evidence_pct)
        .bind(snapshot.links_with_anchors_pct)
        .bind(snapshot.docs_linked_to_sectors_pct)
        .bind(snapshot.average_strength)
        .bind(to_json(&snapshot.link_type_distribution)?)
        .bind(to_json(&snapshot.coverage)?)
        .execute(&self.pool)
        .await?;

        debug!(snapshot_id = %snapshot.id, "Health snapshot appended");
        Ok(())
    }

    async fn latest_snapshot(&self) -> Result<Option<HealthSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT * FROM health_snapshots ORDER BY calculated_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_snapshot()).transpose()
    }

    async fn list_snapshots(&self, limit: u32) -> Result<Vec<HealthSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT * FROM health_snapshots ORDER BY calculated_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_snapshot()).collect()
    }
}

#[derive(Debug, FromRow)]
struct SnapshotRow {
    id: String,
    calculated_at: String,
    total_links: i64,
    active_links: i64,
    needs_review_links: i64,
    deprecated_links: i64,
    pending_reviews: i64,
    links_with_evidence_pct: f64,
    links_with_anchors_pct: f64,
    docs_linked_to_sectors_pct: f64,
    average_strength: f64,
    link_type_distribution: String,
    coverage: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<HealthSnapshot> {
        Ok(HealthSnapshot {
            id: self.id,
            calculated_at: parse_timestamp("calculated_at", &self.calculated_at)?,
            total_links: self.total_links,
            active_links: self.active_links,
            needs_review_links: self.needs_review_links,
            deprecated_links: self.deprecated_links,
            pending_reviews: self.pending_reviews,
            links_with_evidence_pct: self.links_with_evidence_pct,
            links_with_anchors_pct: self.links_with_anchors_pct,
            docs_linked_to_sectors_pct: self.docs_linked_to_sectors_pct,
            average_strength: self.average_strength,
            link_type_distribution: from_json("link_type_distribution", &self.link_type_distribution)?,
            coverage: from_json("coverage", &self.coverage)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::LinkStats;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_snapshots_are_append_only() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = SqliteGraphRepository::new(pool);

        assert!(repo.latest_snapshot().await.unwrap().is_none());

        let first = HealthSnapshot::from_counts(&LinkStats::default(), 0, &BTreeMap::new());
        repo.append_snapshot(&first).await.unwrap();
        let second = HealthSnapshot::from_counts(&LinkStats::default(), 4, &BTreeMap::new());
        repo.append_snapshot(&second).await.unwrap();

        let latest = repo.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest, second);
        assert_eq!(repo.list_snapshots(10).await.unwrap().len(), 2);
        assert_eq!(repo.list_snapshots(1).await.unwrap()[0].id, second.id);
    }
}
