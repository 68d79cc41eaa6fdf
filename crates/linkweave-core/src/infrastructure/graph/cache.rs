//! Related-items cache persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{SqliteGraphRepository, from_json, to_json};
use crate::domain::graph::{Audience, CacheRepository, NodeRef, RelatedItems};
use crate::error::Result;

#[async_trait]
impl CacheRepository for SqliteGraphRepository {
    async fn get_cached_related(
        &self,
        node: &NodeRef,
        audience: Audience,
        now: DateTime<Utc>,
    ) -> Result<Option<RelatedItems>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT payload FROM related_items_cache
            WHERE node_type = ? AND node_id = ? AND audience = ? AND expires_at > ?
            "#,
        )
        .bind(node.node_type.as_str())
        .bind(&node.node_id)
        .bind(audience.as_str())
        .bind(now.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(payload,)| from_json("payload", &payload)).transpose()
    }

    async fn put_cached_related(
        &self,
        items: &RelatedItems,
        audience: Audience,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO related_items_cache (node_type, node_id, audience, payload, computed_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(node_type, node_id, audience) DO UPDATE SET
                payload = excluded.payload,
                computed_at = excluded.computed_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(items.node.node_type.as_str())
        .bind(&items.node.node_id)
        .bind(audience.as_str())
        .bind(to_json(items)?)
        .bind(items.computed_at.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(node = %items.node, audience = %audience, "Related items cached");
        Ok(())
    }

    async fn invalidate_related(&self, nodes: &[NodeRef]) -> Result<u64> {
        let mut removed = 0;
        for node in nodes {
            let result = sqlx::query("DELETE FROM related_items_cache WHERE node_type = ? AND node_id = ?")
                .bind(node.node_type.as_str())
                .bind(&node.node_id)
                .execute(&self.pool)
                .await?;
            removed += result.rows_affected();
        }
        if removed > 0 {
            debug!(nodes = nodes.len(), removed, "Related-items cache invalidated");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::NodeType;
    use crate::storage::migrations::run_migrations;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn repository() -> SqliteGraphRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteGraphRepository::new(pool)
    }

    #[tokio::test]
    async fn test_cache_expiry_and_invalidation() {
        let repo = repository().await;
        let node = NodeRef::new(NodeType::Entity, "bank-x");
        let items = RelatedItems::build(&node, &[], 10);
        let now = Utc::now();

        repo.put_cached_related(&items, Audience::Public, now + Duration::minutes(5))
            .await
            .unwrap();
        repo.put_cached_related(&items, Audience::Admin, now + Duration::minutes(5))
            .await
            .unwrap();

        assert!(repo.get_cached_related(&node, Audience::Public, now).await.unwrap().is_some());
        assert!(
            repo.get_cached_related(&node, Audience::Public, now + Duration::minutes(10))
                .await
                .unwrap()
                .is_none()
        );

        assert_eq!(repo.invalidate_related(&[node.clone()]).await.unwrap(), 2);
        assert!(repo.get_cached_related(&node, Audience::Admin, now).await.unwrap().is_none());
    }
}
