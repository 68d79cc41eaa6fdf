//! Matching rules and their execution audit records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeRef;
use super::vocab::{LinkMethod, LinkType, NodeType, RuleDirection, RunStatus, RunTrigger};
use crate::error::{Error, Result};

/// Maximum entries kept in a rule run's error log
pub const MAX_ERROR_LOG_ENTRIES: usize = 50;

/// A metadata field comparison
///
/// A plain string compares the same field on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    Same(String),
    Mapped { record: String, candidate: String },
}

impl FieldSpec {
    pub fn record_field(&self) -> &str {
        match self {
            Self::Same(field) => field,
            Self::Mapped { record, .. } => record,
        }
    }

    pub fn candidate_field(&self) -> &str {
        match self {
            Self::Same(field) => field,
            Self::Mapped { candidate, .. } => candidate,
        }
    }
}

/// Matching strategy of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchLogic {
    /// Any keyword contained in the candidate's label or body
    Keyword { keywords: Vec<String> },
    /// A citation anchor of a listed type connects record and candidate
    Anchor { anchor_types: Vec<String> },
    /// Exact value shared in one of the identifier fields
    SharedId { fields: Vec<String> },
    /// Non-empty tag intersection, optionally restricted to `tags`
    Tag {
        #[serde(default)]
        tags: Vec<String>,
    },
    /// Every listed metadata field equal on both sides
    Metadata { fields: Vec<FieldSpec> },
    /// Precomputed similarity at or above `threshold`
    Embedding { threshold: f64 },
    /// Stored logic this build does not understand
    #[serde(other)]
    Unrecognized,
}

impl MatchLogic {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Keyword { .. } => "keyword",
            Self::Anchor { .. } => "anchor",
            Self::SharedId { .. } => "shared_id",
            Self::Tag { .. } => "tag",
            Self::Metadata { .. } => "metadata",
            Self::Embedding { .. } => "embedding",
            Self::Unrecognized => "unrecognized",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Keyword { keywords } => {
                if keywords.iter().all(|k| k.trim().is_empty()) {
                    return Err(Error::InvalidRule(
                        "keyword logic needs at least one non-empty keyword".into(),
                    ));
                }
            }
            Self::Anchor { anchor_types } => {
                if anchor_types.is_empty() {
                    return Err(Error::InvalidRule(
                        "anchor logic needs at least one anchor type".into(),
                    ));
                }
            }
            Self::SharedId { fields } => {
                if fields.is_empty() {
                    return Err(Error::InvalidRule(
                        "shared_id logic needs at least one identifier field".into(),
                    ));
                }
                for field in fields {
                    validate_field_name(field)?;
                }
            }
            Self::Tag { .. } => {}
            Self::Metadata { fields } => {
                if fields.is_empty() {
                    return Err(Error::InvalidRule(
                        "metadata logic needs at least one field".into(),
                    ));
                }
                for field in fields {
                    validate_field_name(field.record_field())?;
                    validate_field_name(field.candidate_field())?;
                }
            }
            Self::Embedding { threshold } => {
                if !(*threshold > 0.0 && *threshold <= 1.0) {
                    return Err(Error::InvalidRule(format!(
                        "embedding threshold must be in (0, 1], got {}",
                        threshold
                    )));
                }
            }
            Self::Unrecognized => {
                return Err(Error::InvalidRule("unrecognized match logic type".into()));
            }
        }
        Ok(())
    }
}

/// Field names end up in JSON paths, so they are restricted
fn validate_field_name(field: &str) -> Result<()> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRule(format!(
            "field name '{}' must be non-empty and contain only letters, digits and '_'",
            field
        )))
    }
}

/// How a match turns into a raw strength
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrengthFormula {
    Fixed { value: f64 },
    /// Similarity multiplied by `factor`
    Proportional { factor: f64 },
    /// `base + per_match * (matches - 1)`, capped
    PerMatch { base: f64, per_match: f64, cap: f64 },
}

impl StrengthFormula {
    pub fn fixed(value: f64) -> Self {
        Self::Fixed { value }
    }

    /// Raw strength for a match with `matches` hits and an optional similarity
    pub fn compute(&self, matches: usize, similarity: Option<f64>) -> f64 {
        let raw = match self {
            Self::Fixed { value } => *value,
            Self::Proportional { factor } => similarity.unwrap_or(0.0) * factor,
            Self::PerMatch {
                base,
                per_match,
                cap,
            } => {
                let extra = matches.saturating_sub(1) as f64;
                (base + per_match * extra).min(*cap)
            }
        };
        super::link::clamp_strength(raw)
    }

    fn validate(&self) -> Result<()> {
        let values: Vec<(&str, f64)> = match self {
            Self::Fixed { value } => vec![("value", *value)],
            Self::Proportional { factor } => vec![("factor", *factor)],
            Self::PerMatch {
                base,
                per_match,
                cap,
            } => vec![("base", *base), ("per_match", *per_match), ("cap", *cap)],
        };
        for (name, value) in values {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidRule(format!(
                    "strength formula {} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// A persisted matching rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRule {
    pub id: String,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub input_types: Vec<NodeType>,
    pub candidate_types: Vec<NodeType>,
    pub match_logic: MatchLogic,
    pub output_link_type: LinkType,
    pub strength_formula: Option<StrengthFormula>,
    pub direction: RuleDirection,
    pub method: LinkMethod,
    pub bidirectional: bool,
    pub short_circuit: bool,
    pub auto_approve: bool,
    pub public_safe: bool,
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LinkRule {
    /// Explicit formula, or the default for the rule's logic
    pub fn formula(&self) -> StrengthFormula {
        match (&self.strength_formula, &self.match_logic) {
            (Some(formula), _) => formula.clone(),
            (None, MatchLogic::Embedding { .. }) => StrengthFormula::Proportional { factor: 1.0 },
            (None, _) => StrengthFormula::fixed(0.5),
        }
    }

    /// Whether any of the record's types is an input type of this rule
    pub fn applies_to_any(&self, types: &[NodeType]) -> bool {
        types.iter().any(|t| self.input_types.contains(t))
    }

    /// Orient a (record, candidate) pair per the rule's direction
    pub fn orient<'a>(
        &self,
        record: &'a NodeRef,
        candidate: &'a NodeRef,
    ) -> (&'a NodeRef, &'a NodeRef) {
        match self.direction {
            RuleDirection::Forward => (record, candidate),
            RuleDirection::Reverse => (candidate, record),
        }
    }
}

/// Input for creating a rule; validated eagerly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_types: Vec<NodeType>,
    pub candidate_types: Vec<NodeType>,
    pub match_logic: MatchLogic,
    pub output_link_type: LinkType,
    #[serde(default)]
    pub strength_formula: Option<StrengthFormula>,
    #[serde(default)]
    pub direction: RuleDirection,
    #[serde(default = "default_method")]
    pub method: LinkMethod,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub short_circuit: bool,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default = "default_true")]
    pub public_safe: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_method() -> LinkMethod {
    LinkMethod::RuleBased
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    50
}

impl NewRule {
    pub fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        input_types: Vec<NodeType>,
        candidate_types: Vec<NodeType>,
        match_logic: MatchLogic,
        output_link_type: LinkType,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            description: None,
            input_types,
            candidate_types,
            match_logic,
            output_link_type,
            strength_formula: None,
            direction: RuleDirection::Forward,
            method: LinkMethod::RuleBased,
            bidirectional: false,
            short_circuit: false,
            auto_approve: false,
            public_safe: true,
            priority: default_priority(),
            enabled: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn strength(mut self, formula: StrengthFormula) -> Self {
        self.strength_formula = Some(formula);
        self
    }

    pub fn direction(mut self, direction: RuleDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn public_safe(mut self, public_safe: bool) -> Self {
        self.public_safe = public_safe;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    pub fn short_circuit(mut self, short_circuit: bool) -> Self {
        self.short_circuit = short_circuit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let key_ok = !self.key.is_empty()
            && self
                .key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !key_ok {
            return Err(Error::InvalidRule(format!(
                "rule key '{}' must be a non-empty slug of [a-z0-9_]",
                self.key
            )));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidRule("rule name must not be empty".into()));
        }
        if self.input_types.is_empty() {
            return Err(Error::InvalidRule("rule needs at least one input type".into()));
        }
        if self.candidate_types.is_empty() {
            return Err(Error::InvalidRule(
                "rule needs at least one candidate type".into(),
            ));
        }
        self.match_logic.validate()?;
        if let Some(formula) = &self.strength_formula {
            formula.validate()?;
        }
        Ok(())
    }

    /// Validate and materialize as a persisted rule
    pub fn into_rule(self) -> Result<LinkRule> {
        self.validate()?;
        let now = Utc::now();
        Ok(LinkRule {
            id: Uuid::new_v4().to_string(),
            key: self.key,
            name: self.name.trim().to_string(),
            description: self.description,
            input_types: self.input_types,
            candidate_types: self.candidate_types,
            match_logic: self.match_logic,
            output_link_type: self.output_link_type,
            strength_formula: self.strength_formula,
            direction: self.direction,
            method: self.method,
            bidirectional: self.bidirectional,
            short_circuit: self.short_circuit,
            auto_approve: self.auto_approve,
            public_safe: self.public_safe,
            priority: self.priority,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Built-in rules installed by `seed_default_rules`
pub fn default_rules() -> Vec<NewRule> {
    vec![
        NewRule::new(
            "doc_sector_tag",
            "Document to sector by tag",
            vec![NodeType::Document],
            vec![NodeType::Sector],
            MatchLogic::Tag { tags: Vec::new() },
            LinkType::RelatedTo,
        )
        .description("Links documents to sectors that share a tag")
        .strength(StrengthFormula::fixed(0.7))
        .auto_approve(true)
        .priority(100),
        NewRule::new(
            "doc_entity_mention",
            "Document mentions entity",
            vec![NodeType::Document],
            vec![NodeType::Entity],
            MatchLogic::Anchor {
                anchor_types: vec!["entity_mention".into()],
            },
            LinkType::Mentions,
        )
        .description("Links documents to entities cited by an entity_mention anchor")
        .strength(StrengthFormula::PerMatch {
            base: 0.6,
            per_match: 0.1,
            cap: 0.9,
        })
        .priority(90),
        NewRule::new(
            "entity_publishes_doc",
            "Entity publishes document",
            vec![NodeType::Document],
            vec![NodeType::Entity],
            MatchLogic::Metadata {
                fields: vec![FieldSpec::Mapped {
                    record: "publisher".into(),
                    candidate: "name".into(),
                }],
            },
            LinkType::Publishes,
        )
        .description("Links publishers to their documents by publisher metadata")
        .strength(StrengthFormula::fixed(0.9))
        .direction(RuleDirection::Reverse)
        .auto_approve(true)
        .priority(95),
        NewRule::new(
            "update_signal_sector",
            "Update signals sector",
            vec![NodeType::Update],
            vec![NodeType::Sector],
            MatchLogic::Tag { tags: Vec::new() },
            LinkType::UpdateSignal,
        )
        .description("Links updates to the sectors they touch")
        .strength(StrengthFormula::fixed(0.8))
        .auto_approve(true)
        .priority(85),
        NewRule::new(
            "event_affects_indicator",
            "Event co-occurs with indicator",
            vec![NodeType::Event],
            vec![NodeType::Indicator],
            MatchLogic::Embedding { threshold: 0.7 },
            LinkType::TemporalCooccurrence,
        )
        .description("Suggests indicators whose movement coincides with an event")
        .strength(StrengthFormula::Proportional { factor: 1.0 })
        .public_safe(false)
        .priority(50),
    ]
}

/// Per-rule counters accumulated during enrichment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleStats {
    pub records_scanned: u64,
    pub links_created: u64,
    pub links_updated: u64,
    pub links_queued: u64,
    pub links_skipped: u64,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_log: Vec<RunError>,
}

impl RuleStats {
    pub fn record_error(&mut self, node: &NodeRef, message: impl Into<String>) {
        self.errors += 1;
        if self.error_log.len() < MAX_ERROR_LOG_ENTRIES {
            self.error_log.push(RunError {
                node: Some(node.clone()),
                message: message.into(),
            });
        }
    }

    pub fn absorb(&mut self, other: &RuleStats) {
        self.records_scanned += other.records_scanned;
        self.links_created += other.links_created;
        self.links_updated += other.links_updated;
        self.links_queued += other.links_queued;
        self.links_skipped += other.links_skipped;
        self.errors += other.errors;
        for entry in &other.error_log {
            if self.error_log.len() >= MAX_ERROR_LOG_ENTRIES {
                break;
            }
            self.error_log.push(entry.clone());
        }
    }
}

/// Merge per-rule stats maps keyed by rule id
pub fn merge_rule_stats(into: &mut BTreeMap<String, RuleStats>, from: &BTreeMap<String, RuleStats>) {
    for (rule_id, stats) in from {
        into.entry(rule_id.clone()).or_default().absorb(stats);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub node: Option<NodeRef>,
    pub message: String,
}

/// Audit record of one execution of one rule; never mutated after write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRun {
    pub id: String,
    pub rule_id: String,
    pub rule_key: String,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub records_scanned: u64,
    pub links_created: u64,
    pub links_updated: u64,
    pub links_queued: u64,
    pub links_skipped: u64,
    pub errors: u64,
    pub error_log: Vec<RunError>,
}

impl RuleRun {
    pub fn from_stats(
        rule: &LinkRule,
        trigger: RunTrigger,
        status: RunStatus,
        started_at: DateTime<Utc>,
        stats: &RuleStats,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_key: rule.key.clone(),
            trigger,
            status,
            started_at,
            completed_at: Utc::now(),
            records_scanned: stats.records_scanned,
            links_created: stats.links_created,
            links_updated: stats.links_updated,
            links_queued: stats.links_queued,
            links_skipped: stats.links_skipped,
            errors: stats.errors,
            error_log: stats.error_log.clone(),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyword_rule() -> NewRule {
        NewRule::new(
            "bank_keyword",
            "Bank keyword",
            vec![NodeType::Document],
            vec![NodeType::Entity],
            MatchLogic::Keyword {
                keywords: vec!["bank".into()],
            },
            LinkType::Mentions,
        )
    }

    #[test]
    fn test_match_logic_is_tagged() {
        let logic: MatchLogic =
            serde_json::from_str(r#"{"type":"shared_id","fields":["bank_name"]}"#).unwrap();
        assert_eq!(
            logic,
            MatchLogic::SharedId {
                fields: vec!["bank_name".into()]
            }
        );

        let tag: MatchLogic = serde_json::from_str(r#"{"type":"tag"}"#).unwrap();
        assert_eq!(tag, MatchLogic::Tag { tags: vec![] });
    }

    #[test]
    fn test_unknown_logic_deserializes_as_unrecognized() {
        let logic: MatchLogic =
            serde_json::from_str(r#"{"type":"graph_walk","depth":3}"#).unwrap();
        assert_eq!(logic, MatchLogic::Unrecognized);
    }

    #[test]
    fn test_metadata_field_spec_forms() {
        let logic: MatchLogic = serde_json::from_str(
            r#"{"type":"metadata","fields":["country",{"record":"publisher","candidate":"name"}]}"#,
        )
        .unwrap();
        let MatchLogic::Metadata { fields } = logic else {
            panic!("expected metadata logic");
        };
        assert_eq!(fields[0].record_field(), "country");
        assert_eq!(fields[1].record_field(), "publisher");
        assert_eq!(fields[1].candidate_field(), "name");
    }

    #[test]
    fn test_validation_rejects_bad_rules() {
        assert!(keyword_rule().validate().is_ok());

        let mut bad_key = keyword_rule();
        bad_key.key = "Bad Key".into();
        assert!(matches!(bad_key.validate(), Err(Error::InvalidRule(_))));

        let mut no_inputs = keyword_rule();
        no_inputs.input_types.clear();
        assert!(no_inputs.validate().is_err());

        let mut empty_keywords = keyword_rule();
        empty_keywords.match_logic = MatchLogic::Keyword {
            keywords: vec!["  ".into()],
        };
        assert!(empty_keywords.validate().is_err());

        let mut threshold = keyword_rule();
        threshold.match_logic = MatchLogic::Embedding { threshold: 0.0 };
        assert!(threshold.validate().is_err());

        let mut field = keyword_rule();
        field.match_logic = MatchLogic::SharedId {
            fields: vec!["bad.field".into()],
        };
        assert!(field.validate().is_err());

        let mut unknown = keyword_rule();
        unknown.match_logic = MatchLogic::Unrecognized;
        assert!(unknown.validate().is_err());

        let formula = keyword_rule().strength(StrengthFormula::fixed(1.5));
        assert!(formula.validate().is_err());
    }

    #[test]
    fn test_strength_formulas() {
        assert_eq!(StrengthFormula::fixed(0.8).compute(3, None), 0.8);
        assert_eq!(
            StrengthFormula::Proportional { factor: 1.0 }.compute(1, Some(0.73)),
            0.73
        );
        let per_match = StrengthFormula::PerMatch {
            base: 0.6,
            per_match: 0.1,
            cap: 0.75,
        };
        assert_eq!(per_match.compute(1, None), 0.6);
        assert!((per_match.compute(2, None) - 0.7).abs() < 1e-9);
        assert_eq!(per_match.compute(5, None), 0.75);
    }

    #[test]
    fn test_default_formula_depends_on_logic() {
        let rule = keyword_rule().into_rule().unwrap();
        assert_eq!(rule.formula(), StrengthFormula::fixed(0.5));

        let mut embedding = keyword_rule();
        embedding.match_logic = MatchLogic::Embedding { threshold: 0.5 };
        let rule = embedding.into_rule().unwrap();
        assert_eq!(rule.formula(), StrengthFormula::Proportional { factor: 1.0 });
    }

    #[test]
    fn test_default_rules_are_valid() {
        let rules = default_rules();
        assert_eq!(rules.len(), 5);
        for rule in rules {
            rule.validate().unwrap();
        }
    }

    #[test]
    fn test_rule_stats_merge_caps_error_log() {
        let node = NodeRef::new(NodeType::Document, "1");
        let mut a = RuleStats::default();
        let mut b = RuleStats::default();
        for i in 0..40 {
            a.record_error(&node, format!("a{}", i));
            b.record_error(&node, format!("b{}", i));
        }
        a.absorb(&b);
        assert_eq!(a.errors, 80);
        assert_eq!(a.error_log.len(), MAX_ERROR_LOG_ENTRIES);
    }

    #[test]
    fn test_orient_respects_direction() {
        let record = NodeRef::new(NodeType::Document, "1");
        let candidate = NodeRef::new(NodeType::Entity, "2");
        let mut rule = keyword_rule().into_rule().unwrap();
        assert_eq!(rule.orient(&record, &candidate), (&record, &candidate));
        rule.direction = RuleDirection::Reverse;
        assert_eq!(rule.orient(&record, &candidate), (&candidate, &record));
    }
}
