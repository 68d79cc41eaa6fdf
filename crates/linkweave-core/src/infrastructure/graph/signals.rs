//! Timeline event and sector signal persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::debug;

use super::{SqliteGraphRepository, node_ref, parse_timestamp, parse_vocab};
use crate::domain::graph::{
    LinkType, NodeRef, PropagationStats, SectorSignal, Severity, SignalFilter, SignalRepository,
    TimelineEvent, TimelineKind,
};
use crate::error::Result;

#[async_trait]
impl SignalRepository for SqliteGraphRepository {
    // ========== Timeline Operations ==========

    async fn insert_timeline_event(&self, event: &TimelineEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO timeline_events (
                id, origin_key, kind, subject_type, subject_id, subject_label,
                link_type, evidence, severity, title, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(origin_key, subject_type, subject_id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.origin_key)
        .bind(event.kind.as_str())
        .bind(event.subject.node_type.as_str())
        .bind(&event.subject.node_id)
        .bind(&event.subject_label)
        .bind(event.link_type.map(|t| t.as_str()))
        .bind(&event.evidence)
        .bind(event.severity.as_str())
        .bind(&event.title)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        debug!(event_id = %event.id, origin = %event.origin_key, inserted, "Timeline event saved");
        Ok(inserted)
    }

    async fn find_timeline_event(
        &self,
        origin_key: &str,
        subject: &NodeRef,
    ) -> Result<Option<TimelineEvent>> {
        let row: Option<TimelineRow> = sqlx::query_as(
            r#"
            SELECT * FROM timeline_events
            WHERE origin_key = ? AND subject_type = ? AND subject_id = ?
            "#,
        )
        .bind(origin_key)
        .bind(subject.node_type.as_str())
        .bind(&subject.node_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_event()).transpose()
    }

    async fn list_timeline_events(
        &self,
        subject: Option<&NodeRef>,
        limit: u32,
    ) -> Result<Vec<TimelineEvent>> {
        let subject_type = subject.map(|s| s.node_type.as_str());
        let subject_id = subject.map(|s| s.node_id.as_str());
        let rows: Vec<TimelineRow> = sqlx::query_as(
            r#"
            SELECT * FROM timeline_events
            WHERE (? IS NULL OR (subject_type = ? AND subject_id = ?))
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(subject_type)
        .bind(subject_type)
        .bind(subject_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_event()).collect()
    }

    // ========== Sector Signal Operations ==========

    async fn insert_sector_signal(&self, signal: &SectorSignal) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sector_signals (id, timeline_event_id, sector, severity, title, created_at, is_read)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(timeline_event_id, sector) DO NOTHING
            "#,
        )
        .bind(&signal.id)
        .bind(&signal.timeline_event_id)
        .bind(&signal.sector)
        .bind(signal.severity.as_str())
        .bind(&signal.title)
        .bind(signal.created_at.to_rfc3339())
        .bind(signal.is_read)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_sector_signals(&self, filter: &SignalFilter) -> Result<Vec<SectorSignal>> {
        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM sector_signals WHERE 1");
        if !filter.sectors.is_empty() {
            builder.push(" AND sector IN (");
            let mut separated = builder.separated(", ");
            for sector in &filter.sectors {
                separated.push_bind(sector.clone());
            }
            separated.push_unseparated(")");
        }
        if let Some(since) = filter.since {
            builder.push(" AND created_at >= ").push_bind(since.to_rfc3339());
        }
        if filter.unread_only {
            builder.push(" AND is_read = 0");
        }
        builder.push(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<SignalRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_signal()).collect()
    }

    async fn expire_sector_signals(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("UPDATE sector_signals SET is_read = 1 WHERE is_read = 0 AND created_at < ?")
            .bind(before.to_rfc3339())
            .execute(&self.pool)
            .await?;
        let expired = result.rows_affected();
        debug!(expired, before = %before, "Sector signals expired");
        Ok(expired)
    }

    async fn propagation_stats(&self) -> Result<PropagationStats> {
        let events_by_kind: Vec<(String, i64)> =
            sqlx::query_as("SELECT kind, COUNT(*) FROM timeline_events GROUP BY kind")
                .fetch_all(&self.pool)
                .await?;
        let (total_signals, active_signals): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(is_read = 0), 0) FROM sector_signals",
        )
        .fetch_one(&self.pool)
        .await?;
        let signals_by_sector: Vec<(String, i64)> = sqlx::query_as(
            "SELECT sector, COUNT(*) FROM sector_signals WHERE is_read = 0 GROUP BY sector",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(PropagationStats {
            total_events: events_by_kind.iter().map(|(_, n)| n).sum(),
            total_signals,
            active_signals,
            events_by_kind: events_by_kind.into_iter().collect(),
            signals_by_sector: signals_by_sector.into_iter().collect(),
        })
    }
}

#[derive(Debug, FromRow)]
struct TimelineRow {
    id: String,
    origin_key: String,
    kind: String,
    subject_type: String,
    subject_id: String,
    subject_label: Option<String>,
    link_type: Option<String>,
    evidence: Option<String>,
    severity: String,
    title: String,
    created_at: String,
}

impl TimelineRow {
    fn into_event(self) -> Result<TimelineEvent> {
        let link_type = self
            .link_type
            .as_deref()
            .map(|t| parse_vocab("link type", t, LinkType::parse))
            .transpose()?;

        Ok(TimelineEvent {
            id: self.id,
            origin_key: self.origin_key,
            kind: parse_vocab("timeline kind", &self.kind, TimelineKind::parse)?,
            subject: node_ref(&self.subject_type, self.subject_id)?,
            subject_label: self.subject_label,
            link_type,
            evidence: self.evidence,
            severity: parse_vocab("severity", &self.severity, Severity::parse)?,
            title: self.title,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct SignalRow {
    id: String,
    timeline_event_id: String,
    sector: String,
    severity: String,
    title: String,
    created_at: String,
    is_read: bool,
}

impl SignalRow {
    fn into_signal(self) -> Result<SectorSignal> {
        Ok(SectorSignal {
            id: self.id,
            timeline_event_id: self.timeline_event_id,
            sector: self.sector,
            severity: parse_vocab("severity", &self.severity, Severity::parse)?,
            title: self.title,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            is_read: self.is_read,
        })
    }
}
