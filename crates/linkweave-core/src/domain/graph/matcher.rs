//! Match-logic evaluation
//!
//! Pure functions: given a rule, the record being enriched and one candidate,
//! decide whether they match. No I/O happens here.

use std::collections::{BTreeSet, HashMap};

use super::node::{NodeRecord, NodeRef};
use super::repository::{CandidateFilter, CandidateQuery};
use super::rule::{LinkRule, MatchLogic};

/// What a successful match found
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvidence {
    /// Number of independent hits (keywords, anchors, shared values, tags)
    pub matches: usize,
    pub similarity: Option<f64>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(MatchEvidence),
    NoMatch,
    /// The pair could not be evaluated, e.g. a required field is absent
    Skipped(String),
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched(_))
    }
}

/// Caller-supplied similarity scores keyed by candidate
pub type SimilarityOverrides = HashMap<NodeRef, f64>;

/// Evaluate one (record, candidate) pair against a rule's match logic
pub fn evaluate(
    rule: &LinkRule,
    record: &NodeRecord,
    candidate: &NodeRecord,
    overrides: &SimilarityOverrides,
) -> MatchOutcome {
    match &rule.match_logic {
        MatchLogic::Keyword { keywords } => match_keywords(keywords, candidate),
        MatchLogic::Anchor { anchor_types } => match_anchors(anchor_types, record, candidate),
        MatchLogic::SharedId { fields } => match_shared_ids(fields, record, candidate),
        MatchLogic::Tag { tags } => match_tags(tags, record, candidate),
        MatchLogic::Metadata { fields } => {
            let mut matched = Vec::new();
            for field in fields {
                let Some(ours) = record.metadata.get(field.record_field()) else {
                    return MatchOutcome::Skipped(format!(
                        "record has no metadata field '{}'",
                        field.record_field()
                    ));
                };
                let Some(theirs) = candidate.metadata.get(field.candidate_field()) else {
                    return MatchOutcome::Skipped(format!(
                        "candidate has no metadata field '{}'",
                        field.candidate_field()
                    ));
                };
                if ours != theirs {
                    return MatchOutcome::NoMatch;
                }
                matched.push(format!("{} = {}", field.record_field(), display_value(ours)));
            }
            MatchOutcome::Matched(MatchEvidence {
                matches: matched.len(),
                similarity: None,
                snippet: Some(matched.join("; ")),
            })
        }
        MatchLogic::Embedding { threshold } => {
            let score = overrides
                .get(&candidate.node)
                .copied()
                .or_else(|| record.similarity_to(&candidate.node))
                .or_else(|| candidate.similarity_to(&record.node));
            match score {
                None => MatchOutcome::Skipped("no similarity score supplied".into()),
                Some(score) if score.is_nan() => {
                    MatchOutcome::Skipped("similarity score is not a number".into())
                }
                Some(score) if score >= *threshold => MatchOutcome::Matched(MatchEvidence {
                    matches: 1,
                    similarity: Some(score),
                    snippet: Some(format!("similarity {:.2}", score)),
                }),
                Some(_) => MatchOutcome::NoMatch,
            }
        }
        MatchLogic::Unrecognized => MatchOutcome::Skipped("unrecognized match logic".into()),
    }
}

fn match_keywords(keywords: &[String], candidate: &NodeRecord) -> MatchOutcome {
    if !candidate.has_text() {
        return MatchOutcome::Skipped("candidate has no text".into());
    }
    let text = candidate.searchable_text();
    let hits: Vec<&str> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
        .collect();
    if hits.is_empty() {
        return MatchOutcome::NoMatch;
    }
    MatchOutcome::Matched(MatchEvidence {
        matches: hits.len(),
        similarity: None,
        snippet: Some(format!("keywords: {}", hits.join(", "))),
    })
}

fn match_anchors(anchor_types: &[String], record: &NodeRecord, candidate: &NodeRecord) -> MatchOutcome {
    let forward = record
        .anchors
        .iter()
        .filter(|a| a.target == candidate.node && anchor_types.contains(&a.anchor_type));
    let backward = candidate
        .anchors
        .iter()
        .filter(|a| a.target == record.node && anchor_types.contains(&a.anchor_type));
    let hits: Vec<_> = forward.chain(backward).collect();
    if hits.is_empty() {
        return MatchOutcome::NoMatch;
    }
    let snippet = hits
        .iter()
        .find_map(|a| a.snippet.clone())
        .or_else(|| Some(format!("{} anchor", hits[0].anchor_type)));
    MatchOutcome::Matched(MatchEvidence {
        matches: hits.len(),
        similarity: None,
        snippet,
    })
}

fn match_shared_ids(fields: &[String], record: &NodeRecord, candidate: &NodeRecord) -> MatchOutcome {
    if !fields.iter().any(|f| candidate.identifiers.contains_key(f)) {
        return MatchOutcome::Skipped("candidate has none of the identifier fields".into());
    }
    let mut shared = Vec::new();
    for field in fields {
        let (Some(ours), Some(theirs)) = (record.identifiers.get(field), candidate.identifiers.get(field))
        else {
            continue;
        };
        for value in ours {
            if theirs.contains(value) {
                shared.push(format!("{} = {}", field, value));
            }
        }
    }
    if shared.is_empty() {
        return MatchOutcome::NoMatch;
    }
    MatchOutcome::Matched(MatchEvidence {
        matches: shared.len(),
        similarity: None,
        snippet: Some(shared.join("; ")),
    })
}

fn match_tags(restrict: &[String], record: &NodeRecord, candidate: &NodeRecord) -> MatchOutcome {
    let ours = restricted(tag_surface(record), restrict);
    let theirs = tag_surface(candidate);
    let shared: Vec<&String> = ours.intersection(&theirs).collect();
    if shared.is_empty() {
        return MatchOutcome::NoMatch;
    }
    MatchOutcome::Matched(MatchEvidence {
        matches: shared.len(),
        similarity: None,
        snippet: Some(format!(
            "shared tags: {}",
            shared.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        )),
    })
}

pub fn tag_surface(record: &NodeRecord) -> BTreeSet<String> {
    record.tag_keys()
}

fn restricted(tags: BTreeSet<String>, restrict: &[String]) -> BTreeSet<String> {
    if restrict.is_empty() {
        return tags;
    }
    let allowed: BTreeSet<String> = restrict.iter().map(|t| t.trim().to_lowercase()).collect();
    tags.intersection(&allowed).cloned().collect()
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the bounded store lookup for a rule and record
///
/// Returns `Err(reason)` when the record itself cannot satisfy the rule, in
/// which case the rule is skipped for this record without touching the store.
pub fn candidate_query(
    rule: &LinkRule,
    record: &NodeRecord,
    overrides: &SimilarityOverrides,
    limit: u32,
) -> std::result::Result<CandidateQuery, String> {
    let filter = match &rule.match_logic {
        MatchLogic::Keyword { keywords } => {
            let keywords: Vec<String> = keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            if keywords.is_empty() {
                return Err("rule has no keywords".into());
            }
            CandidateFilter::Keywords(keywords)
        }
        MatchLogic::Anchor { anchor_types } => CandidateFilter::Anchored {
            anchor_types: anchor_types.clone(),
            target: record.node.clone(),
            referenced: record
                .anchors
                .iter()
                .filter(|a| anchor_types.contains(&a.anchor_type))
                .map(|a| a.target.clone())
                .collect(),
        },
        MatchLogic::SharedId { fields } => {
            let pairs: Vec<(String, Vec<String>)> = fields
                .iter()
                .filter_map(|f| {
                    record
                        .identifiers
                        .get(f)
                        .filter(|values| !values.is_empty())
                        .map(|values| (f.clone(), values.clone()))
                })
                .collect();
            if pairs.is_empty() {
                return Err("record has none of the identifier fields".into());
            }
            CandidateFilter::Identifiers(pairs)
        }
        MatchLogic::Tag { tags } => {
            let ours = restricted(tag_surface(record), tags);
            if ours.is_empty() {
                return Err("record has no matching tags".into());
            }
            CandidateFilter::AnyTag(ours.into_iter().collect())
        }
        MatchLogic::Metadata { fields } => {
            let mut pairs = Vec::with_capacity(fields.len());
            for field in fields {
                let Some(value) = record.metadata.get(field.record_field()) else {
                    return Err(format!(
                        "record has no metadata field '{}'",
                        field.record_field()
                    ));
                };
                pairs.push((field.candidate_field().to_string(), value.clone()));
            }
            CandidateFilter::MetadataEquals(pairs)
        }
        MatchLogic::Embedding { .. } => {
            let mut nodes: Vec<NodeRef> = overrides.keys().cloned().collect();
            for score in &record.similarities {
                if !nodes.contains(&score.node) {
                    nodes.push(score.node.clone());
                }
            }
            nodes.retain(|n| rule.candidate_types.contains(&n.node_type));
            if nodes.is_empty() {
                return Err("no similarity scores supplied".into());
            }
            nodes.sort();
            CandidateFilter::Nodes(nodes)
        }
        MatchLogic::Unrecognized => return Err("unrecognized match logic".into()),
    };

    Ok(CandidateQuery {
        node_types: rule.candidate_types.clone(),
        exclude: record.node.clone(),
        filter,
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::rule::{FieldSpec, NewRule};
    use crate::domain::graph::vocab::{LinkType, NodeType};
    use serde_json::json;

    fn rule(logic: MatchLogic, candidates: Vec<NodeType>) -> LinkRule {
        NewRule::new(
            "test_rule",
            "Test rule",
            vec![NodeType::Document],
            candidates,
            logic,
            LinkType::Mentions,
        )
        .into_rule()
        .unwrap()
    }

    fn doc(id: &str) -> NodeRecord {
        NodeRecord::new(NodeType::Document, id)
    }

    fn entity(id: &str) -> NodeRecord {
        NodeRecord::new(NodeType::Entity, id)
    }

    fn none() -> SimilarityOverrides {
        SimilarityOverrides::new()
    }

    #[test]
    fn test_keyword_containment_is_case_insensitive() {
        let r = rule(
            MatchLogic::Keyword {
                keywords: vec!["Central Bank".into(), "liquidity".into()],
            },
            vec![NodeType::Entity],
        );
        let candidate = entity("cby").with_label("The CENTRAL BANK of Yemen");
        let MatchOutcome::Matched(found) = evaluate(&r, &doc("1"), &candidate, &none()) else {
            panic!("expected match");
        };
        assert_eq!(found.matches, 1);

        let silent = entity("x").with_label("Ministry of Finance");
        assert_eq!(evaluate(&r, &doc("1"), &silent, &none()), MatchOutcome::NoMatch);

        let textless = entity("y");
        assert!(matches!(
            evaluate(&r, &doc("1"), &textless, &none()),
            MatchOutcome::Skipped(_)
        ));
    }

    #[test]
    fn test_anchor_matches_either_direction() {
        let r = rule(
            MatchLogic::Anchor {
                anchor_types: vec!["entity_mention".into()],
            },
            vec![NodeType::Entity],
        );
        let target = entity("bank-x");
        let record = doc("1").with_anchor("entity_mention", target.node.clone());
        assert!(evaluate(&r, &record, &target, &none()).is_match());

        let backward = entity("bank-y").with_anchor("entity_mention", doc("1").node);
        assert!(evaluate(&r, &doc("1"), &backward, &none()).is_match());

        let wrong_type = doc("2").with_anchor("table_reference", target.node.clone());
        assert_eq!(
            evaluate(&r, &wrong_type, &target, &none()),
            MatchOutcome::NoMatch
        );
    }

    #[test]
    fn test_shared_id_exact_match() {
        let r = rule(
            MatchLogic::SharedId {
                fields: vec!["bank_name".into()],
            },
            vec![NodeType::Entity],
        );
        let record = doc("1").with_identifier("bank_name", "Bank X");
        let same = entity("bank-x").with_identifier("bank_name", "Bank X");
        let different = entity("bank-y").with_identifier("bank_name", "bank x");
        let missing = entity("bank-z");

        let MatchOutcome::Matched(found) = evaluate(&r, &record, &same, &none()) else {
            panic!("expected match");
        };
        assert_eq!(found.snippet.as_deref(), Some("bank_name = Bank X"));
        assert_eq!(evaluate(&r, &record, &different, &none()), MatchOutcome::NoMatch);
        assert!(matches!(
            evaluate(&r, &record, &missing, &none()),
            MatchOutcome::Skipped(_)
        ));
    }

    #[test]
    fn test_tag_intersection_includes_sector_codes() {
        let r = rule(MatchLogic::Tag { tags: vec![] }, vec![NodeType::Sector]);
        let record = doc("1").with_tags(["Banking", "fx"]);
        let sector = NodeRecord::new(NodeType::Sector, "banking");
        assert!(evaluate(&r, &record, &sector, &none()).is_match());

        let other = NodeRecord::new(NodeType::Sector, "energy");
        assert_eq!(evaluate(&r, &record, &other, &none()), MatchOutcome::NoMatch);

        let restricted = rule(
            MatchLogic::Tag {
                tags: vec!["fx".into()],
            },
            vec![NodeType::Sector],
        );
        assert_eq!(
            evaluate(&restricted, &record, &sector, &none()),
            MatchOutcome::NoMatch
        );
    }

    #[test]
    fn test_metadata_requires_fields_on_both_sides() {
        let r = rule(
            MatchLogic::Metadata {
                fields: vec![FieldSpec::Mapped {
                    record: "publisher".into(),
                    candidate: "name".into(),
                }],
            },
            vec![NodeType::Entity],
        );
        let record = doc("1").with_metadata("publisher", "Central Bank");
        let publisher = entity("cby").with_metadata("name", "Central Bank");
        let other = entity("mof").with_metadata("name", "Ministry of Finance");
        let bare = entity("x");

        assert!(evaluate(&r, &record, &publisher, &none()).is_match());
        assert_eq!(evaluate(&r, &record, &other, &none()), MatchOutcome::NoMatch);
        assert!(matches!(
            evaluate(&r, &record, &bare, &none()),
            MatchOutcome::Skipped(_)
        ));
    }

    #[test]
    fn test_embedding_uses_override_then_stored_scores() {
        let r = rule(
            MatchLogic::Embedding { threshold: 0.7 },
            vec![NodeType::Indicator],
        );
        let indicator = NodeRecord::new(NodeType::Indicator, "fx_rate");
        let record = NodeRecord::new(NodeType::Event, "e1").with_similarity(indicator.node.clone(), 0.75);

        let MatchOutcome::Matched(found) = evaluate(&r, &record, &indicator, &none()) else {
            panic!("expected match");
        };
        assert_eq!(found.similarity, Some(0.75));

        let mut overrides = none();
        overrides.insert(indicator.node.clone(), 0.4);
        assert_eq!(
            evaluate(&r, &record, &indicator, &overrides),
            MatchOutcome::NoMatch
        );

        let unscored = NodeRecord::new(NodeType::Event, "e2");
        assert!(matches!(
            evaluate(&r, &unscored, &indicator, &none()),
            MatchOutcome::Skipped(_)
        ));
    }

    #[test]
    fn test_unrecognized_logic_is_skipped() {
        let mut r = rule(MatchLogic::Tag { tags: vec![] }, vec![NodeType::Sector]);
        r.match_logic = MatchLogic::Unrecognized;
        assert!(matches!(
            evaluate(&r, &doc("1"), &doc("2"), &none()),
            MatchOutcome::Skipped(_)
        ));
        assert!(candidate_query(&r, &doc("1"), &none(), 10).is_err());
    }

    #[test]
    fn test_candidate_query_prefilters() {
        let r = rule(
            MatchLogic::SharedId {
                fields: vec!["bank_name".into(), "swift".into()],
            },
            vec![NodeType::Entity],
        );
        let record = doc("1").with_identifier("bank_name", "Bank X");
        let query = candidate_query(&r, &record, &none(), 50).unwrap();
        assert_eq!(query.node_types, vec![NodeType::Entity]);
        assert_eq!(query.exclude, record.node);
        assert_eq!(query.limit, 50);
        assert_eq!(
            query.filter,
            CandidateFilter::Identifiers(vec![("bank_name".into(), vec!["Bank X".into()])])
        );

        assert!(candidate_query(&r, &doc("2"), &none(), 50).is_err());

        let meta = rule(
            MatchLogic::Metadata {
                fields: vec![FieldSpec::Same("country".into())],
            },
            vec![NodeType::Entity],
        );
        let record = doc("3").with_metadata("country", "YE");
        let query = candidate_query(&meta, &record, &none(), 5).unwrap();
        assert_eq!(
            query.filter,
            CandidateFilter::MetadataEquals(vec![("country".into(), json!("YE"))])
        );
    }
}
