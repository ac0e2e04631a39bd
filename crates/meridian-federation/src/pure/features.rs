//! Cluster feature constraint expressions.
//!
//! Grammar: clauses joined by `&` or `,` (all must hold). A clause is a
//! feature name, a negated name `!name`, or an OR group `a|b|c`. Negation
//! is not allowed inside an OR group.

use std::fmt;

use crate::types::SiblingMask;

/// One conjunct of a feature expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureClause {
    /// At least one of the named features.
    AnyOf(Vec<String>),
    /// The named feature must be absent.
    Not(String),
}

impl fmt::Display for FeatureClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureClause::AnyOf(names) => f.write_str(&names.join("|")),
            FeatureClause::Not(name) => write!(f, "!{name}"),
        }
    }
}

/// Parsed feature expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureExpr {
    pub clauses: Vec<FeatureClause>,
}

/// Why a feature expression rejected every candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureRejection {
    /// No remaining candidate offers the positive clause.
    Unsatisfiable(String),
    /// The negative clause would remove every remaining candidate.
    EliminatesAll(String),
}

impl fmt::Display for FeatureRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureRejection::Unsatisfiable(clause) => write!(f, "no cluster satisfies feature '{clause}'"),
            FeatureRejection::EliminatesAll(clause) => write!(f, "feature '!{clause}' excludes every cluster"),
        }
    }
}

fn valid_feature_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

/// Parse a feature expression. An empty expression has no clauses.
pub fn parse_feature_expression(expression: &str) -> Result<FeatureExpr, String> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Ok(FeatureExpr::default());
    }

    let mut clauses = Vec::new();
    for raw in trimmed.split(['&', ',']) {
        let clause = raw.trim();
        if clause.is_empty() {
            return Err("empty clause".to_string());
        }

        if clause.contains('|') {
            let mut names = Vec::new();
            for alt in clause.split('|') {
                let alt = alt.trim();
                if alt.starts_with('!') {
                    return Err(format!("negation not allowed in OR group '{clause}'"));
                }
                if !valid_feature_name(alt) {
                    return Err(format!("invalid feature name '{alt}'"));
                }
                names.push(alt.to_string());
            }
            clauses.push(FeatureClause::AnyOf(names));
        } else if let Some(negated) = clause.strip_prefix('!') {
            let name = negated.trim();
            if !valid_feature_name(name) {
                return Err(format!("invalid feature name '{name}'"));
            }
            clauses.push(FeatureClause::Not(name.to_string()));
        } else {
            if !valid_feature_name(clause) {
                return Err(format!("invalid feature name '{clause}'"));
            }
            clauses.push(FeatureClause::AnyOf(vec![clause.to_string()]));
        }
    }

    Ok(FeatureExpr { clauses })
}

/// Narrow `candidates` to the clusters satisfying `expr`.
///
/// `clusters_with` maps a feature name to the clusters advertising it.
pub fn apply_feature_expression<F>(
    expr: &FeatureExpr,
    candidates: SiblingMask,
    clusters_with: F,
) -> Result<SiblingMask, FeatureRejection>
where
    F: Fn(&str) -> SiblingMask,
{
    let mut remaining = candidates;
    for clause in &expr.clauses {
        match clause {
            FeatureClause::AnyOf(names) => {
                let offering =
                    names.iter().fold(SiblingMask::empty(), |acc, name| acc.union(clusters_with(name.as_str())));
                let satisfied = remaining.intersection(offering);
                if satisfied.is_empty() {
                    return Err(FeatureRejection::Unsatisfiable(clause.to_string()));
                }
                remaining = satisfied;
            }
            FeatureClause::Not(name) => {
                let kept = remaining.difference(clusters_with(name.as_str()));
                if kept.is_empty() {
                    return Err(FeatureRejection::EliminatesAll(name.clone()));
                }
                remaining = kept;
            }
        }
    }
    Ok(remaining)
}
