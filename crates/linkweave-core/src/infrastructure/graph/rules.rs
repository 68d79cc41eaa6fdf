//! Rule and rule-run persistence

use async_trait::async_trait;
use sqlx::FromRow;
use tracing::debug;

use super::{SqliteGraphRepository, from_json, parse_timestamp, parse_vocab, to_json};
use crate::domain::graph::{
    LinkMethod, LinkRule, LinkType, RuleDirection, RuleRepository, RuleRun, RunStatus, RunTrigger,
};
use crate::error::Result;

#[async_trait]
impl RuleRepository for SqliteGraphRepository {
    // ========== Rule Operations ==========

    async fn save_rule(&self, rule: &LinkRule) -> Result<()> {
        let strength_formula = rule.strength_formula.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO link_rules (
                id, rule_key, name, description, input_types, candidate_types, match_logic,
                output_link_type, strength_formula, direction, method, bidirectional,
                short_circuit, auto_approve, public_safe, priority, enabled, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                rule_key = excluded.rule_key,
                name = excluded.name,
                description = excluded.description,
                input_types = excluded.input_types,
                candidate_types = excluded.candidate_types,
                match_logic = excluded.match_logic,
                output_link_type = excluded.output_link_type,
                strength_formula = excluded.strength_formula,
                direction = excluded.direction,
                method = excluded.method,
                bidirectional = excluded.bidirectional,
                short_circuit = excluded.short_circuit,
                auto_approve = excluded.auto_approve,
                public_safe = excluded.public_safe,
                priority = excluded.priority,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.key)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(to_json(&rule.input_types)?)
        .bind(to_json(&rule.candidate_types)?)
        .bind(to_json(&rule.match_logic)?)
        .bind(rule.output_link_type.as_str())
        .bind(strength_formula)
        .bind(rule.direction.as_str())
        .bind(rule.method.as_str())
        .bind(rule.bidirectional)
        .bind(rule.short_circuit)
        .bind(rule.auto_approve)
        .bind(rule.public_safe)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(rule_id = %rule.id, rule_key = %rule.key, "Rule saved");
        Ok(())
    }

    async fn get_rule(&self, id: &str) -> Result<Option<LinkRule>> {
        let row: Option<RuleRow> = sqlx::query_as("SELECT * FROM link_rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_rule()).transpose()
    }

    async fn get_rule_by_key(&self, key: &str) -> Result<Option<LinkRule>> {
        let row: Option<RuleRow> = sqlx::query_as("SELECT * FROM link_rules WHERE rule_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_rule()).transpose()
    }

    async fn list_rules(&self, enabled_only: bool) -> Result<Vec<LinkRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT * FROM link_rules WHERE (? = 0 OR enabled = 1) ORDER BY priority DESC, rule_key",
        )
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_rule()).collect()
    }

    // ========== Rule Run Operations ==========

    async fn record_rule_run(&self, run: &RuleRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_runs (
                id, rule_id, rule_key, run_trigger, status, started_at, completed_at,
                records_scanned, links_created, links_updated, links_queued, links_skipped,
                errors, error_log
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.rule_id)
        .bind(&run.rule_key)
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at.to_rfc3339())
        .bind(run.completed_at.to_rfc3339())
        .bind(run.records_scanned as i64)
        .bind(run.links_created as i64)
        .bind(run.links_updated as i64)
        .bind(run.links_queued as i64)
        .bind(run.links_skipped as i64)
        .bind(run.errors as i64)
        .bind(to_json(&run.error_log)?)
        .execute(&self.pool)
        .await?;

        debug!(run_id = %run.id, rule_key = %run.rule_key, status = %run.status, "Rule run recorded");
        Ok(())
    }

    async fn list_rule_runs(&self, rule_id: Option<&str>, limit: u32) -> Result<Vec<RuleRun>> {
        let rows: Vec<RuleRunRow> = sqlx::query_as(
            r#"
            SELECT * FROM rule_runs
            WHERE (? IS NULL OR rule_id = ?)
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(rule_id)
        .bind(rule_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_run()).collect()
    }
}

#[derive(Debug, FromRow)]
struct RuleRow {
    id: String,
    rule_key: String,
    name: String,
    description: Option<String>,
    input_types: String,
    candidate_types: String,
    match_logic: String,
    output_link_type: String,
    strength_formula: Option<String>,
    direction: String,
    method: String,
    bidirectional: bool,
    short_circuit: bool,
    auto_approve: bool,
    public_safe: bool,
    priority: i32,
    enabled: bool,
    created_at: String,
    updated_at: String,
}

impl RuleRow {
    fn into_rule(self) -> Result<LinkRule> {
        let strength_formula = self
            .strength_formula
            .as_deref()
            .map(|s| from_json("strength_formula", s))
            .transpose()?;

        Ok(LinkRule {
            id: self.id,
            key: self.rule_key,
            name: self.name,
            description: self.description,
            input_types: from_json("input_types", &self.input_types)?,
            candidate_types: from_json("candidate_types", &self.candidate_types)?,
            match_logic: from_json("match_logic", &self.match_logic)?,
            output_link_type: parse_vocab("link type", &self.output_link_type, LinkType::parse)?,
            strength_formula,
            direction: parse_vocab("rule direction", &self.direction, RuleDirection::parse)?,
            method: parse_vocab("link method", &self.method, LinkMethod::parse)?,
            bidirectional: self.bidirectional,
            short_circuit: self.short_circuit,
            auto_approve: self.auto_approve,
            public_safe: self.public_safe,
            priority: self.priority,
            enabled: self.enabled,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct RuleRunRow {
    id: String,
    rule_id: String,
    rule_key: String,
    run_trigger: String,
    status: String,
    started_at: String,
    completed_at: String,
    records_scanned: i64,
    links_created: i64,
    links_updated: i64,
    links_queued: i64,
    links_skipped: i64,
    errors: i64,
    error_log: String,
}

impl RuleRunRow {
    fn into_run(self) -> Result<RuleRun> {
        Ok(RuleRun {
            id: self.id,
            rule_id: self.rule_id,
            rule_key: self.rule_key,
            trigger: parse_vocab("run trigger", &self.run_trigger, RunTrigger::parse)?,
            status: parse_vocab("run status", &self.status, RunStatus::parse)?,
            started_at: parse_timestamp("started_at", &self.started_at)?,
            completed_at: parse_timestamp("completed_at", &self.completed_at)?,
            records_scanned: self.records_scanned.max(0) as u64,
            links_created: self.links_created.max(0) as u64,
            links_updated: self.links_updated.max(0) as u64,
            links_queued: self.links_queued.max(0) as u64,
            links_skipped: self.links_skipped.max(0) as u64,
            errors: self.errors.max(0) as u64,
            error_log: from_json("error_log", &self.error_log)?,
        })
    }
}
