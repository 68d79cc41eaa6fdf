//! Database migrations
//!
//! This module manages SQLite schema migrations for linkweave.
//! Migrations are versioned and applied automatically on database connection.

use sqlx::SqlitePool;

use crate::domain::graph::{NodeRecord, NodeType};

/// Current schema version
pub const CURRENT_VERSION: i32 = 4;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Node registry, links, rules, rule runs and review queue
const MIGRATION_V1: &str = r#"
    -- Records supplied by producers (and derived records created by propagation)
    CREATE TABLE IF NOT EXISTS graph_nodes (
        node_type TEXT NOT NULL CHECK (node_type IN (
            'entity', 'document', 'series', 'event', 'project',
            'update', 'sector', 'indicator', 'dataset', 'geography'
        )),
        node_id TEXT NOT NULL,
        label TEXT,
        body TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        sectors TEXT NOT NULL DEFAULT '[]',
        metadata TEXT NOT NULL DEFAULT '{}',
        identifiers TEXT NOT NULL DEFAULT '{}',
        anchors TEXT NOT NULL DEFAULT '[]',
        similarities TEXT NOT NULL DEFAULT '[]',
        roles TEXT NOT NULL DEFAULT '[]',
        origin TEXT NOT NULL DEFAULT 'producer' CHECK (origin IN ('producer', 'propagation', 'narrative')),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (node_type, node_id)
    );

    CREATE INDEX IF NOT EXISTS idx_graph_nodes_updated ON graph_nodes(updated_at);
    CREATE INDEX IF NOT EXISTS idx_graph_nodes_type_updated ON graph_nodes(node_type, updated_at);

    -- Typed, directed, scored relationships
    CREATE TABLE IF NOT EXISTS graph_links (
        id TEXT PRIMARY KEY NOT NULL,
        link_type TEXT NOT NULL,
        src_type TEXT NOT NULL,
        src_id TEXT NOT NULL,
        src_label TEXT,
        dst_type TEXT NOT NULL,
        dst_id TEXT NOT NULL,
        dst_label TEXT,
        strength REAL NOT NULL CHECK (strength >= 0.0 AND strength <= 1.0),
        confidence TEXT NOT NULL CHECK (confidence IN ('high', 'medium', 'low', 'uncertain')),
        method TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'needs_review', 'deprecated', 'rejected')),
        evidence_snippet TEXT,
        evidence_url TEXT,
        rule_id TEXT,
        bidirectional INTEGER NOT NULL DEFAULT 0,
        public_safe INTEGER NOT NULL DEFAULT 1,
        regime_tag TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK (NOT (src_type = dst_type AND src_id = dst_id))
    );

    -- At most one active link per relationship tuple
    CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_links_active_tuple
        ON graph_links(link_type, src_type, src_id, dst_type, dst_id)
        WHERE status = 'active';
    CREATE INDEX IF NOT EXISTS idx_graph_links_src ON graph_links(src_type, src_id);
    CREATE INDEX IF NOT EXISTS idx_graph_links_dst ON graph_links(dst_type, dst_id);
    CREATE INDEX IF NOT EXISTS idx_graph_links_status ON graph_links(status);

    -- Matching rules
    CREATE TABLE IF NOT EXISTS link_rules (
        id TEXT PRIMARY KEY NOT NULL,
        rule_key TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        description TEXT,
        input_types TEXT NOT NULL,
        candidate_types TEXT NOT NULL,
        match_logic TEXT NOT NULL,
        output_link_type TEXT NOT NULL,
        strength_formula TEXT,
        direction TEXT NOT NULL DEFAULT 'forward' CHECK (direction IN ('forward', 'reverse')),
        method TEXT NOT NULL DEFAULT 'rule_based',
        bidirectional INTEGER NOT NULL DEFAULT 0,
        short_circuit INTEGER NOT NULL DEFAULT 0,
        auto_approve INTEGER NOT NULL DEFAULT 0,
        public_safe INTEGER NOT NULL DEFAULT 1,
        priority INTEGER NOT NULL DEFAULT 50,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_link_rules_priority ON link_rules(enabled, priority DESC);

    -- Append-only audit of rule executions
    CREATE TABLE IF NOT EXISTS rule_runs (
        id TEXT PRIMARY KEY NOT NULL,
        rule_id TEXT NOT NULL REFERENCES link_rules(id),
        rule_key TEXT NOT NULL,
        run_trigger TEXT NOT NULL CHECK (run_trigger IN ('batch', 'manual', 'on_ingest')),
        status TEXT NOT NULL CHECK (status IN ('completed', 'partial', 'failed')),
        started_at TEXT NOT NULL,
        completed_at TEXT NOT NULL,
        records_scanned INTEGER NOT NULL DEFAULT 0,
        links_created INTEGER NOT NULL DEFAULT 0,
        links_updated INTEGER NOT NULL DEFAULT 0,
        links_queued INTEGER NOT NULL DEFAULT 0,
        links_skipped INTEGER NOT NULL DEFAULT 0,
        errors INTEGER NOT NULL DEFAULT 0,
        error_log TEXT NOT NULL DEFAULT '[]'
    );

    CREATE INDEX IF NOT EXISTS idx_rule_runs_rule ON rule_runs(rule_id, started_at DESC);

    -- Candidate links awaiting human judgment
    CREATE TABLE IF NOT EXISTS review_queue (
        id TEXT PRIMARY KEY NOT NULL,
        link_type TEXT NOT NULL,
        src_type TEXT NOT NULL,
        src_id TEXT NOT NULL,
        src_label TEXT,
        dst_type TEXT NOT NULL,
        dst_id TEXT NOT NULL,
        dst_label TEXT,
        strength REAL NOT NULL,
        confidence TEXT NOT NULL,
        method TEXT NOT NULL,
        evidence_snippet TEXT,
        evidence_url TEXT,
        rule_id TEXT,
        bidirectional INTEGER NOT NULL DEFAULT 0,
        public_safe INTEGER NOT NULL DEFAULT 1,
        regime_tag TEXT,
        created_by TEXT,
        reason TEXT NOT NULL CHECK (reason IN ('below_threshold', 'rule_not_auto_approving', 'conflicts_with_existing')),
        priority TEXT NOT NULL CHECK (priority IN ('high', 'medium', 'low')),
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'approved', 'rejected')),
        resolved_by TEXT,
        resolved_at TEXT,
        notes TEXT,
        link_id TEXT REFERENCES graph_links(id),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK (status != 'approved' OR link_id IS NOT NULL)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_review_queue_pending_tuple
        ON review_queue(link_type, src_type, src_id, dst_type, dst_id)
        WHERE status = 'pending';
    CREATE INDEX IF NOT EXISTS idx_review_queue_status ON review_queue(status, created_at);
"#;

/// Migration 2: Related-items cache and health snapshots
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS related_items_cache (
        node_type TEXT NOT NULL,
        node_id TEXT NOT NULL,
        audience TEXT NOT NULL CHECK (audience IN ('public', 'admin')),
        payload TEXT NOT NULL,
        computed_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        PRIMARY KEY (node_type, node_id, audience)
    );

    CREATE TABLE IF NOT EXISTS health_snapshots (
        id TEXT PRIMARY KEY NOT NULL,
        calculated_at TEXT NOT NULL,
        total_links INTEGER NOT NULL,
        active_links INTEGER NOT NULL,
        needs_review_links INTEGER NOT NULL,
        deprecated_links INTEGER NOT NULL,
        pending_reviews INTEGER NOT NULL,
        links_with_evidence_pct REAL NOT NULL,
        average_strength REAL NOT NULL,
        link_type_distribution TEXT NOT NULL,
        coverage TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_health_snapshots_time ON health_snapshots(calculated_at DESC);
"#;

/// Migration 3: Propagation records and narrative stories
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS timeline_events (
        id TEXT PRIMARY KEY NOT NULL,
        origin_key TEXT NOT NULL,
        kind TEXT NOT NULL,
        subject_type TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        subject_label TEXT,
        link_type TEXT,
        evidence TEXT,
        severity TEXT NOT NULL CHECK (severity IN ('info', 'warning', 'critical')),
        title TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (origin_key, subject_type, subject_id)
    );

    CREATE INDEX IF NOT EXISTS idx_timeline_events_subject ON timeline_events(subject_type, subject_id);

    CREATE TABLE IF NOT EXISTS sector_signals (
        id TEXT PRIMARY KEY NOT NULL,
        timeline_event_id TEXT NOT NULL REFERENCES timeline_events(id) ON DELETE CASCADE,
        sector TEXT NOT NULL,
        severity TEXT NOT NULL CHECK (severity IN ('info', 'warning', 'critical')),
        title TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (timeline_event_id, sector)
    );

    CREATE INDEX IF NOT EXISTS idx_sector_signals_created ON sector_signals(created_at DESC);

    CREATE TABLE IF NOT EXISTS stories (
        id TEXT PRIMARY KEY NOT NULL,
        subject_type TEXT NOT NULL,
        subject_id TEXT,
        title TEXT NOT NULL,
        period_start TEXT,
        period_end TEXT,
        summary TEXT,
        body TEXT,
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'ready', 'failed')),
        published INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_stories_subject ON stories(subject_type, subject_id);
"#;

/// Migration 4: Normalized search columns, signal read state and extra health metrics
const MIGRATION_V4: &str = r#"
    -- Lowercased in the application; SQLite's lower() folds ASCII only
    ALTER TABLE graph_nodes ADD COLUMN search_text TEXT NOT NULL DEFAULT '';
    ALTER TABLE graph_nodes ADD COLUMN tag_keys TEXT NOT NULL DEFAULT '[]';

    ALTER TABLE sector_signals ADD COLUMN is_read INTEGER NOT NULL DEFAULT 0;
    CREATE INDEX IF NOT EXISTS idx_sector_signals_sector ON sector_signals(sector, is_read, created_at DESC);

    ALTER TABLE health_snapshots ADD COLUMN links_with_anchors_pct REAL NOT NULL DEFAULT 0;
    ALTER TABLE health_snapshots ADD COLUMN docs_linked_to_sectors_pct REAL NOT NULL DEFAULT 0;
"#;

/// Fill the v4 search columns for nodes written before they existed
async fn backfill_search_columns(pool: &SqlitePool) -> anyhow::Result<u64> {
    let rows: Vec<(String, String, Option<String>, Option<String>, String, String)> = sqlx::query_as(
        "SELECT node_type, node_id, label, body, tags, sectors FROM graph_nodes",
    )
    .fetch_all(pool)
    .await?;

    let mut updated = 0;
    for (node_type, node_id, label, body, tags, sectors) in rows {
        let Some(parsed_type) = NodeType::parse(&node_type) else {
            continue;
        };
        let mut record = NodeRecord::new(parsed_type, node_id.clone());
        record.label = label;
        record.body = body;
        // Corrupt JSON stays unsearchable by tag; the row itself is left alone
        record.tags = serde_json::from_str(&tags).unwrap_or_default();
        record.sectors = serde_json::from_str(&sectors).unwrap_or_default();

        sqlx::query("UPDATE graph_nodes SET search_text = ?, tag_keys = ? WHERE node_type = ? AND node_id = ?")
            .bind(record.searchable_text())
            .bind(serde_json::to_string(&record.tag_keys())?)
            .bind(&node_type)
            .bind(&node_id)
            .execute(pool)
            .await?;
        updated += 1;
    }
    Ok(updated)
}

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Graph core schema");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Related-items cache and health snapshots");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Propagation records and stories");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    if current_version < 4 {
        tracing::info!("Applying migration v4: Search columns, signal read state and health metrics");
        sqlx::raw_sql(MIGRATION_V4).execute(pool).await?;
        let backfilled = backfill_search_columns(pool).await?;
        tracing::debug!(nodes = backfilled, "Search columns backfilled");
        record_migration(pool, 4).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool")
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await;

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.needs_migration);

        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);
        assert!(!needs_migration(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = create_test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_tables_created() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let tables = vec![
            "graph_nodes",
            "graph_links",
            "link_rules",
            "rule_runs",
            "review_queue",
            "related_items_cache",
            "health_snapshots",
            "timeline_events",
            "sector_signals",
            "stories",
        ];

        for table in tables {
            let result: (i32,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap_or_else(|_| panic!("Table {} should exist", table));
            assert_eq!(result.0, 0, "Table {} should be empty", table);
        }
    }

    #[tokio::test]
    async fn test_v4_backfills_existing_nodes() {
        let pool = create_test_pool().await;
        sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(&pool).await.unwrap();
        for (version, sql) in [(1, MIGRATION_V1), (2, MIGRATION_V2), (3, MIGRATION_V3)] {
            sqlx::raw_sql(sql).execute(&pool).await.unwrap();
            record_migration(&pool, version).await.unwrap();
        }
        sqlx::query(
            "INSERT INTO graph_nodes (node_type, node_id, label, tags, sectors, created_at, updated_at)
             VALUES ('entity', 'msf', 'ÄRZTE ohne Grenzen', '[\" Ärzte \"]', '[\"Health\"]', '', '')",
        )
        .execute(&pool)
        .await
        .unwrap();

        run_migrations(&pool).await.unwrap();

        let (search_text, tag_keys): (String, String) =
            sqlx::query_as("SELECT search_text, tag_keys FROM graph_nodes WHERE node_id = 'msf'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(search_text, "ärzte ohne grenzen");
        assert_eq!(tag_keys, r#"["health","ärzte"]"#);
    }

    #[tokio::test]
    async fn test_self_link_rejected_by_schema() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let result = sqlx::query(
            "INSERT INTO graph_links (id, link_type, src_type, src_id, dst_type, dst_id, strength, confidence, method, created_at, updated_at)
             VALUES ('l1', 'mentions', 'document', '1', 'document', '1', 0.5, 'medium', 'manual', '', '')",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_active_tuple_unique_index() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let insert = |id: &'static str, status: &'static str| {
            sqlx::query(
                "INSERT INTO graph_links (id, link_type, src_type, src_id, dst_type, dst_id, strength, confidence, method, status, created_at, updated_at)
                 VALUES (?, 'mentions', 'document', '1', 'entity', '2', 0.5, 'medium', 'manual', ?, '', '')",
            )
            .bind(id)
            .bind(status)
        };

        insert("a", "active").execute(&pool).await.unwrap();
        insert("b", "deprecated").execute(&pool).await.unwrap();
        assert!(insert("c", "active").execute(&pool).await.is_err());
    }
}
