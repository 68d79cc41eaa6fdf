//! Node registry persistence and candidate lookup

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, warn};

use super::{SqliteGraphRepository, from_json, node_ref, parse_timestamp, parse_vocab, to_json};
use crate::domain::graph::{
    CandidateFilter, CandidateQuery, NodeOrigin, NodeRecord, NodeRef, NodeRepository, NodeType,
};
use crate::error::Result;

/// `json_each` source that tolerates a corrupt column on another row
fn json_source(column: &str) -> String {
    format!(
        "json_each(CASE WHEN json_valid(graph_nodes.{0}) THEN graph_nodes.{0} ELSE '[]' END)",
        column
    )
}

/// Escape `LIKE` wildcards so a keyword matches literally
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// JSON path addressing a single object key
fn key_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', ""))
}

/// Push `(v1, v2, ...)`; an empty list becomes `(NULL)`, which matches nothing
fn push_list(builder: &mut QueryBuilder<'_, Sqlite>, values: impl IntoIterator<Item = String>) {
    let values: Vec<String> = values.into_iter().collect();
    if values.is_empty() {
        builder.push("(NULL)");
        return;
    }
    builder.push("(");
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

fn push_node_match(builder: &mut QueryBuilder<'_, Sqlite>, node: &NodeRef) {
    builder
        .push("(node_type = ")
        .push_bind(node.node_type.as_str().to_string())
        .push(" AND node_id = ")
        .push_bind(node.node_id.clone())
        .push(")");
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &CandidateFilter) {
    match filter {
        CandidateFilter::Keywords(keywords) => {
            let patterns: Vec<String> = keywords
                .iter()
                .map(|k| k.trim())
                .filter(|k| !k.is_empty())
                .map(|k| format!("%{}%", escape_like(&k.to_lowercase())))
                .collect();
            builder.push("(");
            for (i, pattern) in patterns.into_iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder
                    .push("search_text LIKE ")
                    .push_bind(pattern)
                    .push(" ESCAPE '\\'");
            }
            if keywords.iter().all(|k| k.trim().is_empty()) {
                builder.push("0");
            }
            builder.push(")");
        }
        CandidateFilter::AnyTag(tags) => {
            let tags: Vec<String> = tags
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
            builder.push(format!(
                "EXISTS (SELECT 1 FROM {} WHERE value IN ",
                json_source("tag_keys")
            ));
            push_list(builder, tags);
            builder.push(")");
        }
        CandidateFilter::Identifiers(pairs) => {
            builder.push("(");
            for (i, (field, values)) in pairs.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder
                    .push(
                        "EXISTS (SELECT 1 FROM json_each(CASE WHEN json_valid(graph_nodes.identifiers) \
                         THEN graph_nodes.identifiers ELSE '{}' END, ",
                    )
                    .push_bind(key_path(field))
                    .push(") WHERE value IN ");
                push_list(builder, values.iter().cloned());
                builder.push(")");
            }
            if pairs.is_empty() {
                builder.push("0");
            }
            builder.push(")");
        }
        CandidateFilter::MetadataEquals(pairs) => {
            builder.push("(1");
            for (field, value) in pairs {
                builder.push(
                    " AND json_extract(CASE WHEN json_valid(metadata) THEN metadata ELSE '{}' END, ",
                );
                builder.push_bind(key_path(field)).push(")");
                match value {
                    Value::String(s) => {
                        builder.push(" = ").push_bind(s.clone());
                    }
                    Value::Bool(b) => {
                        builder.push(" = ").push_bind(i64::from(*b));
                    }
                    Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                        (Some(i), _) => {
                            builder.push(" = ").push_bind(i);
                        }
                        (None, Some(f)) => {
                            builder.push(" = ").push_bind(f);
                        }
                        (None, None) => {
                            builder.push(" IS NOT NULL");
                        }
                    },
                    // Arrays, objects and null are compared after loading
                    _ => {
                        builder.push(" IS NOT NULL");
                    }
                }
            }
            builder.push(")");
        }
        CandidateFilter::Anchored {
            anchor_types,
            target,
            referenced,
        } => {
            builder.push(format!(
                "(EXISTS (SELECT 1 FROM {} a WHERE json_extract(a.value, '$.anchor_type') IN ",
                json_source("anchors")
            ));
            push_list(builder, anchor_types.iter().cloned());
            builder
                .push(" AND json_extract(a.value, '$.target.node_type') = ")
                .push_bind(target.node_type.as_str().to_string())
                .push(" AND json_extract(a.value, '$.target.node_id') = ")
                .push_bind(target.node_id.clone())
                .push(")");
            for node in referenced {
                builder.push(" OR ");
                push_node_match(builder, node);
            }
            builder.push(")");
        }
        CandidateFilter::Nodes(nodes) => {
            builder.push("(0");
            for node in nodes {
                builder.push(" OR ");
                push_node_match(builder, node);
            }
            builder.push(")");
        }
    }
}

#[async_trait]
impl NodeRepository for SqliteGraphRepository {
    async fn upsert_node(&self, record: &NodeRecord) -> Result<bool> {
        let existed: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM graph_nodes WHERE node_type = ? AND node_id = ?")
                .bind(record.node.node_type.as_str())
                .bind(&record.node.node_id)
                .fetch_optional(&self.pool)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO graph_nodes (
                node_type, node_id, label, body, tags, sectors, metadata,
                identifiers, anchors, similarities, roles, origin, search_text, tag_keys,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(node_type, node_id) DO UPDATE SET
                label = excluded.label,
                body = excluded.body,
                tags = excluded.tags,
                sectors = excluded.sectors,
                metadata = excluded.metadata,
                identifiers = excluded.identifiers,
                anchors = excluded.anchors,
                similarities = excluded.similarities,
                roles = excluded.roles,
                origin = excluded.origin,
                search_text = excluded.search_text,
                tag_keys = excluded.tag_keys,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.node.node_type.as_str())
        .bind(&record.node.node_id)
        .bind(&record.label)
        .bind(&record.body)
        .bind(to_json(&record.tags)?)
        .bind(to_json(&record.sectors)?)
        .bind(to_json(&record.metadata)?)
        .bind(to_json(&record.identifiers)?)
        .bind(to_json(&record.anchors)?)
        .bind(to_json(&record.similarities)?)
        .bind(to_json(&record.roles)?)
        .bind(record.origin.as_str())
        .bind(record.searchable_text())
        .bind(to_json(&record.tag_keys())?)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let is_new = existed.is_none();
        debug!(node = %record.node, is_new, "Node saved");
        Ok(is_new)
    }

    async fn get_node(&self, node: &NodeRef) -> Result<Option<NodeRecord>> {
        let row: Option<NodeRow> =
            sqlx::query_as("SELECT * FROM graph_nodes WHERE node_type = ? AND node_id = ?")
                .bind(node.node_type.as_str())
                .bind(&node.node_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| r.into_record()).transpose()
    }

    async fn list_nodes(&self, node_type: Option<NodeType>, limit: u32) -> Result<Vec<NodeRecord>> {
        let rows: Vec<NodeRow> = match node_type {
            Some(node_type) => {
                sqlx::query_as(
                    "SELECT * FROM graph_nodes WHERE node_type = ? ORDER BY updated_at DESC, node_id LIMIT ?",
                )
                .bind(node_type.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM graph_nodes ORDER BY updated_at DESC, node_type, node_id LIMIT ?",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(|r| r.into_record()).collect()
    }

    async fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<NodeRecord>> {
        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM graph_nodes WHERE NOT ");
        push_node_match(&mut builder, &query.exclude);

        let types: Vec<String> = query
            .node_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        builder.push(" AND (node_type IN ");
        push_list(&mut builder, types.clone());
        builder.push(format!(" OR EXISTS (SELECT 1 FROM {} WHERE value IN ", json_source("roles")));
        push_list(&mut builder, types);
        builder.push(")");
        if query.node_types.contains(&NodeType::Dataset) {
            builder.push(
                " OR (node_type = 'document' AND json_valid(metadata) \
                 AND json_type(metadata, '$.numeric_claims') = 'array' \
                 AND json_array_length(metadata, '$.numeric_claims') > 0)",
            );
        }
        builder.push(") AND ");
        push_filter(&mut builder, &query.filter);
        builder
            .push(" ORDER BY updated_at DESC, node_type, node_id LIMIT ")
            .push_bind(query.limit as i64);

        let rows: Vec<NodeRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        // A corrupt candidate must not fail another record's enrichment
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let node = format!("{}:{}", row.node_type, row.node_id);
            match row.into_record() {
                Ok(record) => records.push(record),
                Err(e) => warn!(node = %node, error = %e, "Skipping unreadable candidate"),
            }
        }
        Ok(records)
    }

    async fn list_changed_since(
        &self,
        node_types: &[NodeType],
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<NodeRef>> {
        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT node_type, node_id FROM graph_nodes WHERE updated_at >= ");
        builder.push_bind(since.to_rfc3339());
        if !node_types.is_empty() {
            builder.push(" AND node_type IN ");
            push_list(&mut builder, node_types.iter().map(|t| t.as_str().to_string()));
        }
        builder
            .push(" ORDER BY updated_at ASC, node_type, node_id LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<(String, String)> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(node_type, node_id)| node_ref(&node_type, node_id))
            .collect()
    }

    async fn count_nodes_by_type(&self) -> Result<Vec<(NodeType, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT node_type, COUNT(*) FROM graph_nodes GROUP BY node_type")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(node_type, count)| Ok((parse_vocab("node type", &node_type, NodeType::parse)?, count)))
            .collect()
    }
}

#[derive(Debug, FromRow)]
struct NodeRow {
    node_type: String,
    node_id: String,
    label: Option<String>,
    body: Option<String>,
    tags: String,
    sectors: String,
    metadata: String,
    identifiers: String,
    anchors: String,
    similarities: String,
    roles: String,
    origin: String,
    created_at: String,
    updated_at: String,
}

impl NodeRow {
    fn into_record(self) -> Result<NodeRecord> {
        Ok(NodeRecord {
            node: node_ref(&self.node_type, self.node_id)?,
            label: self.label,
            body: self.body,
            tags: from_json("tags", &self.tags)?,
            sectors: from_json("sectors", &self.sectors)?,
            metadata: from_json("metadata", &self.metadata)?,
            identifiers: from_json("identifiers", &self.identifiers)?,
            anchors: from_json("anchors", &self.anchors)?,
            similarities: from_json("similarities", &self.similarities)?,
            roles: from_json("roles", &self.roles)?,
            origin: parse_vocab("node origin", &self.origin, NodeOrigin::parse)?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}
