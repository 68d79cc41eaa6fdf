//! Rule engine
//!
//! Evaluates the enabled rules applicable to a record, highest priority
//! first, against a bounded candidate set fetched per rule. A rule that
//! cannot be evaluated is skipped and counted; it never aborts the rules
//! after it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use super::link::{CandidateLink, Evidence};
use super::matcher::{self, MatchOutcome, SimilarityOverrides};
use super::node::{NodeRecord, NodeRef};
use super::repository::GraphRepository;
use super::rule::{LinkRule, MatchLogic, RuleStats};
use crate::error::Result;

/// A candidate link proposed by one rule
#[derive(Debug, Clone)]
pub struct Proposal {
    pub rule_id: String,
    pub auto_approve: bool,
    pub candidate: CandidateLink,
}

/// Everything one record's evaluation produced
#[derive(Debug, Clone, Default)]
pub struct RuleEvaluation {
    /// In rule priority order
    pub proposals: Vec<Proposal>,
    /// Keyed by rule id, one entry per applied rule
    pub stats: BTreeMap<String, RuleStats>,
}

pub struct RuleEngine<R: GraphRepository + ?Sized> {
    repository: Arc<R>,
    candidate_limit: u32,
}

impl<R: GraphRepository + ?Sized> RuleEngine<R> {
    pub fn new(repository: Arc<R>, candidate_limit: u32) -> Self {
        Self {
            repository,
            candidate_limit: candidate_limit.max(1),
        }
    }

    /// Enabled rules, highest priority first
    pub async fn load_rules(&self) -> Result<Vec<LinkRule>> {
        let mut rules = self.repository.list_rules(true).await?;
        sort_by_priority(&mut rules);
        Ok(rules)
    }

    /// Evaluate `rules` against `record`
    ///
    /// Rules whose input types do not include any of the record's applicable
    /// types are ignored. Candidate fetch failures are logged and counted
    /// against the rule.
    pub async fn evaluate(
        &self,
        record: &NodeRecord,
        rules: &[LinkRule],
        overrides: &SimilarityOverrides,
    ) -> RuleEvaluation {
        let types = record.applicable_types();
        let mut ordered: Vec<&LinkRule> = rules.iter().filter(|r| r.applies_to_any(&types)).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));

        let mut evaluation = RuleEvaluation::default();
        let mut claimed: HashSet<(NodeRef, NodeRef)> = HashSet::new();

        for rule in ordered {
            let stats = evaluation.stats.entry(rule.id.clone()).or_default();

            let query = match matcher::candidate_query(rule, record, overrides, self.candidate_limit) {
                Ok(query) => query,
                Err(reason) => {
                    if rule.match_logic == MatchLogic::Unrecognized {
                        warn!(rule_key = %rule.key, node = %record.node, "Skipping rule: {}", reason);
                    } else {
                        debug!(rule_key = %rule.key, node = %record.node, "Rule not applicable: {}", reason);
                    }
                    continue;
                }
            };

            let candidates = match self.repository.find_candidates(&query).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(rule_key = %rule.key, node = %record.node, error = %e, "Candidate lookup failed");
                    stats.record_error(&record.node, format!("candidate lookup failed: {}", e));
                    continue;
                }
            };

            let formula = rule.formula();
            for candidate in &candidates {
                if candidate.node == record.node {
                    continue;
                }
                stats.records_scanned += 1;

                let found = match matcher::evaluate(rule, record, candidate, overrides) {
                    MatchOutcome::Matched(found) => found,
                    MatchOutcome::NoMatch => continue,
                    MatchOutcome::Skipped(reason) => {
                        warn!(
                            rule_key = %rule.key,
                            node = %record.node,
                            candidate = %candidate.node,
                            "Skipping candidate: {}",
                            reason
                        );
                        stats.links_skipped += 1;
                        continue;
                    }
                };

                let pair = unordered_pair(&record.node, &candidate.node);
                if claimed.contains(&pair) {
                    debug!(
                        rule_key = %rule.key,
                        candidate = %candidate.node,
                        "Pair claimed by a higher-priority rule"
                    );
                    stats.links_skipped += 1;
                    continue;
                }
                if rule.short_circuit {
                    claimed.insert(pair);
                }

                let strength = formula.compute(found.matches, found.similarity);
                let (src, dst) = rule.orient(&record.node, &candidate.node);
                let (src_label, dst_label) = if src == &record.node {
                    (record.label.clone(), candidate.label.clone())
                } else {
                    (candidate.label.clone(), record.label.clone())
                };

                let link = CandidateLink::new(rule.output_link_type, src.clone(), dst.clone(), strength)
                    .with_method(rule.method)
                    .with_labels(src_label, dst_label)
                    .with_rule(rule.id.clone())
                    .with_evidence(Evidence {
                        snippet: found.snippet,
                        url: None,
                    })
                    .bidirectional(rule.bidirectional)
                    .public_safe(rule.public_safe);

                debug!(
                    rule_key = %rule.key,
                    link = %link.key(),
                    strength,
                    "Candidate link proposed"
                );
                evaluation.proposals.push(Proposal {
                    rule_id: rule.id.clone(),
                    auto_approve: rule.auto_approve,
                    candidate: link,
                });
            }
        }

        evaluation
    }
}

/// Highest priority first, ties broken by key
pub fn sort_by_priority(rules: &mut [LinkRule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));
}

fn unordered_pair(a: &NodeRef, b: &NodeRef) -> (NodeRef, NodeRef) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::repository::{NodeRepository, RuleRepository};
    use crate::domain::graph::rule::{NewRule, StrengthFormula};
    use crate::domain::graph::vocab::{LinkType, NodeType, RuleDirection};
    use crate::infrastructure::graph::SqliteGraphRepository;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn repository() -> Arc<SqliteGraphRepository> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        Arc::new(SqliteGraphRepository::new(pool))
    }

    fn shared_id_rule(key: &str, priority: i32, short_circuit: bool) -> LinkRule {
        NewRule::new(
            key,
            key,
            vec![NodeType::Document],
            vec![NodeType::Entity],
            MatchLogic::SharedId {
                fields: vec!["bank_name".into()],
            },
            LinkType::Mentions,
        )
        .strength(StrengthFormula::fixed(0.8))
        .priority(priority)
        .short_circuit(short_circuit)
        .into_rule()
        .unwrap()
    }

    #[tokio::test]
    async fn test_evaluate_proposes_matching_candidates() {
        let repo = repository().await;
        let doc = NodeRecord::new(NodeType::Document, "1")
            .with_label("Report on Bank X")
            .with_identifier("bank_name", "Bank X");
        let bank = NodeRecord::new(NodeType::Entity, "bank-x")
            .with_label("Bank X")
            .with_identifier("bank_name", "Bank X");
        let other = NodeRecord::new(NodeType::Entity, "bank-y").with_identifier("bank_name", "Bank Y");
        for record in [&doc, &bank, &other] {
            repo.upsert_node(record).await.unwrap();
        }
        let rule = shared_id_rule("bank_name", 80, false);
        repo.save_rule(&rule).await.unwrap();

        let engine = RuleEngine::new(repo.clone(), 100);
        let rules = engine.load_rules().await.unwrap();
        let evaluation = engine.evaluate(&doc, &rules, &SimilarityOverrides::new()).await;

        assert_eq!(evaluation.proposals.len(), 1);
        let proposal = &evaluation.proposals[0];
        assert_eq!(proposal.candidate.dst, bank.node);
        assert_eq!(proposal.candidate.strength, 0.8);
        assert_eq!(proposal.candidate.dst_label.as_deref(), Some("Bank X"));
        assert_eq!(proposal.candidate.rule_id.as_deref(), Some(rule.id.as_str()));

        let stats = &evaluation.stats[&rule.id];
        assert_eq!(stats.records_scanned, 1);
    }

    #[tokio::test]
    async fn test_short_circuit_suppresses_lower_priority_rules() {
        let repo = repository().await;
        let doc = NodeRecord::new(NodeType::Document, "1").with_identifier("bank_name", "Bank X");
        let bank = NodeRecord::new(NodeType::Entity, "bank-x").with_identifier("bank_name", "Bank X");
        repo.upsert_node(&doc).await.unwrap();
        repo.upsert_node(&bank).await.unwrap();

        let high = shared_id_rule("high_rule", 90, true);
        let mut low = shared_id_rule("low_rule", 10, false);
        low.output_link_type = LinkType::RelatedTo;

        let engine = RuleEngine::new(repo, 100);
        let evaluation = engine
            .evaluate(&doc, &[low.clone(), high.clone()], &SimilarityOverrides::new())
            .await;

        assert_eq!(evaluation.proposals.len(), 1);
        assert_eq!(evaluation.proposals[0].rule_id, high.id);
        assert_eq!(evaluation.stats[&low.id].links_skipped, 1);
    }

    #[tokio::test]
    async fn test_reverse_direction_and_unrecognized_rules() {
        let repo = repository().await;
        let doc = NodeRecord::new(NodeType::Document, "1").with_metadata("publisher", "CBY");
        let publisher = NodeRecord::new(NodeType::Entity, "cby").with_metadata("name", "CBY");
        repo.upsert_node(&doc).await.unwrap();
        repo.upsert_node(&publisher).await.unwrap();

        let mut broken = shared_id_rule("broken", 100, false);
        broken.match_logic = MatchLogic::Unrecognized;
        let publishes = NewRule::new(
            "publishes",
            "Publishes",
            vec![NodeType::Document],
            vec![NodeType::Entity],
            MatchLogic::Metadata {
                fields: vec![crate::domain::graph::rule::FieldSpec::Mapped {
                    record: "publisher".into(),
                    candidate: "name".into(),
                }],
            },
            LinkType::Publishes,
        )
        .direction(RuleDirection::Reverse)
        .into_rule()
        .unwrap();

        let engine = RuleEngine::new(repo, 100);
        let evaluation = engine
            .evaluate(&doc, &[broken, publishes], &SimilarityOverrides::new())
            .await;

        assert_eq!(evaluation.proposals.len(), 1);
        let link = &evaluation.proposals[0].candidate;
        assert_eq!(link.src, publisher.node);
        assert_eq!(link.dst, doc.node);
        assert_eq!(link.strength, 0.5);
    }
}
