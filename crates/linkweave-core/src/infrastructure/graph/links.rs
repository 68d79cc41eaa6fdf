//! Link persistence

use async_trait::async_trait;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::debug;

use super::{SqliteGraphRepository, node_ref, parse_timestamp, parse_vocab};
use crate::domain::graph::{
    ConfidenceLevel, Evidence, Link, LinkFilter, LinkKey, LinkMethod, LinkRepository, LinkStats,
    LinkStatus, LinkType, NodeRef, NodeType, RegimeTag,
};
use crate::error::Result;

#[async_trait]
impl LinkRepository for SqliteGraphRepository {
    async fn insert_link(&self, link: &Link) -> Result<()> {
        insert_link(&self.pool, link).await?;
        debug!(link_id = %link.id, link = %link.key(), "Link inserted");
        Ok(())
    }

    async fn update_link(&self, link: &Link) -> Result<()> {
        update_link(&self.pool, link).await?;
        debug!(link_id = %link.id, status = %link.status, "Link updated");
        Ok(())
    }

    async fn get_link(&self, id: &str) -> Result<Option<Link>> {
        let row: Option<LinkRow> = sqlx::query_as("SELECT * FROM graph_links WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_link()).transpose()
    }

    async fn find_links_for_tuple(&self, key: &LinkKey, either_direction: bool) -> Result<Vec<Link>> {
        let rows: Vec<LinkRow> = sqlx::query_as(
            r#"
            SELECT * FROM graph_links
            WHERE link_type = ?
              AND (
                (src_type = ? AND src_id = ? AND dst_type = ? AND dst_id = ?)
                OR (? AND src_type = ? AND src_id = ? AND dst_type = ? AND dst_id = ?)
              )
            ORDER BY created_at
            "#,
        )
        .bind(key.link_type.as_str())
        .bind(key.src.node_type.as_str())
        .bind(&key.src.node_id)
        .bind(key.dst.node_type.as_str())
        .bind(&key.dst.node_id)
        .bind(either_direction)
        .bind(key.dst.node_type.as_str())
        .bind(&key.dst.node_id)
        .bind(key.src.node_type.as_str())
        .bind(&key.src.node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_link()).collect()
    }

    async fn list_links_for_node(&self, node: &NodeRef, filter: &LinkFilter) -> Result<Vec<Link>> {
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT * FROM graph_links WHERE ((src_type = ");
        builder
            .push_bind(node.node_type.as_str())
            .push(" AND src_id = ")
            .push_bind(node.node_id.as_str())
            .push(") OR (dst_type = ")
            .push_bind(node.node_type.as_str())
            .push(" AND dst_id = ")
            .push_bind(node.node_id.as_str())
            .push(")) AND status IN (");
        let mut statuses = builder.separated(", ");
        for status in filter.effective_statuses() {
            statuses.push_bind(status.as_str());
        }
        statuses.push_unseparated(")");

        if !filter.link_types.is_empty() {
            builder.push(" AND link_type IN (");
            let mut types = builder.separated(", ");
            for link_type in &filter.link_types {
                types.push_bind(link_type.as_str());
            }
            types.push_unseparated(")");
        }

        builder.push(" ORDER BY strength DESC, updated_at DESC, id");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<LinkRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_link()).collect()
    }

    async fn link_stats(&self) -> Result<LinkStats> {
        let (total, active, needs_review, deprecated, rejected, active_with_evidence, active_from_anchor, average): (
            i64,
            i64,
            i64,
            i64,
            i64,
            i64,
            i64,
            Option<f64>,
        ) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(status = 'active'), 0),
                COALESCE(SUM(status = 'needs_review'), 0),
                COALESCE(SUM(status = 'deprecated'), 0),
                COALESCE(SUM(status = 'rejected'), 0),
                COALESCE(SUM(status = 'active' AND (
                    TRIM(COALESCE(evidence_snippet, '')) != ''
                    OR TRIM(COALESCE(evidence_url, '')) != ''
                )), 0),
                COALESCE(SUM(status = 'active' AND method = 'extracted_from_anchor'), 0),
                AVG(CASE WHEN status = 'active' THEN strength END)
            FROM graph_links
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let distribution: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT link_type, COUNT(*) FROM graph_links
            WHERE status = 'active'
            GROUP BY link_type
            ORDER BY COUNT(*) DESC, link_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let type_distribution = distribution
            .into_iter()
            .map(|(link_type, count)| Ok((parse_vocab("link type", &link_type, LinkType::parse)?, count)))
            .collect::<Result<Vec<_>>>()?;

        Ok(LinkStats {
            total,
            active,
            needs_review,
            deprecated,
            rejected,
            active_with_evidence,
            active_from_anchor,
            average_active_strength: average.unwrap_or(0.0),
            type_distribution,
        })
    }

    async fn linked_node_counts(&self) -> Result<Vec<(NodeType, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT n.node_type, COUNT(*) FROM graph_nodes n
            WHERE EXISTS (
                SELECT 1 FROM graph_links l
                WHERE l.status = 'active'
                  AND ((l.src_type = n.node_type AND l.src_id = n.node_id)
                    OR (l.dst_type = n.node_type AND l.dst_id = n.node_id))
            )
            GROUP BY n.node_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(node_type, count)| Ok((parse_vocab("node type", &node_type, NodeType::parse)?, count)))
            .collect()
    }

    async fn count_nodes_linked_to(&self, from: NodeType, to: NodeType) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM graph_nodes n
            WHERE n.node_type = ?1
              AND EXISTS (
                SELECT 1 FROM graph_links l
                WHERE l.status = 'active'
                  AND ((l.src_type = n.node_type AND l.src_id = n.node_id AND l.dst_type = ?2)
                    OR (l.dst_type = n.node_type AND l.dst_id = n.node_id AND l.src_type = ?2))
              )
            "#,
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Insert a link row on any executor, so approvals can run inside a transaction
pub(super) async fn insert_link<'e, E>(executor: E, link: &Link) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO graph_links (
            id, link_type, src_type, src_id, src_label, dst_type, dst_id, dst_label,
            strength, confidence, method, status, evidence_snippet, evidence_url,
            rule_id, bidirectional, public_safe, regime_tag, created_by, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&link.id)
    .bind(link.link_type.as_str())
    .bind(link.src.node_type.as_str())
    .bind(&link.src.node_id)
    .bind(&link.src_label)
    .bind(link.dst.node_type.as_str())
    .bind(&link.dst.node_id)
    .bind(&link.dst_label)
    .bind(link.strength)
    .bind(link.confidence.as_str())
    .bind(link.method.as_str())
    .bind(link.status.as_str())
    .bind(&link.evidence.snippet)
    .bind(&link.evidence.url)
    .bind(&link.rule_id)
    .bind(link.bidirectional)
    .bind(link.public_safe)
    .bind(link.regime_tag.map(|t| t.as_str()))
    .bind(&link.created_by)
    .bind(link.created_at.to_rfc3339())
    .bind(link.updated_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

pub(super) async fn update_link<'e, E>(executor: E, link: &Link) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        UPDATE graph_links SET
            src_label = ?,
            dst_label = ?,
            strength = ?,
            confidence = ?,
            status = ?,
            evidence_snippet = ?,
            evidence_url = ?,
            bidirectional = ?,
            public_safe = ?,
            regime_tag = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&link.src_label)
    .bind(&link.dst_label)
    .bind(link.strength)
    .bind(link.confidence.as_str())
    .bind(link.status.as_str())
    .bind(&link.evidence.snippet)
    .bind(&link.evidence.url)
    .bind(link.bidirectional)
    .bind(link.public_safe)
    .bind(link.regime_tag.map(|t| t.as_str()))
    .bind(link.updated_at.to_rfc3339())
    .bind(&link.id)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct LinkRow {
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
    status: String,
    evidence_snippet: Option<String>,
    evidence_url: Option<String>,
    rule_id: Option<String>,
    bidirectional: bool,
    public_safe: bool,
    regime_tag: Option<String>,
    created_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl LinkRow {
    fn into_link(self) -> Result<Link> {
        let regime_tag = self
            .regime_tag
            .as_deref()
            .map(|t| parse_vocab("regime tag", t, RegimeTag::parse))
            .transpose()?;

        Ok(Link {
            link_type: parse_vocab("link type", &self.link_type, LinkType::parse)?,
            src: node_ref(&self.src_type, self.src_id)?,
            src_label: self.src_label,
            dst: node_ref(&self.dst_type, self.dst_id)?,
            dst_label: self.dst_label,
            strength: self.strength,
            confidence: parse_vocab("confidence", &self.confidence, ConfidenceLevel::parse)?,
            method: parse_vocab("link method", &self.method, LinkMethod::parse)?,
            status: parse_vocab("link status", &self.status, LinkStatus::parse)?,
            evidence: Evidence {
                snippet: self.evidence_snippet,
                url: self.evidence_url,
            },
            rule_id: self.rule_id,
            bidirectional: self.bidirectional,
            public_safe: self.public_safe,
            regime_tag,
            created_by: self.created_by,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            id: self.id,
        })
    }
}
