use std::collections::BTreeSet;

use crate::category::{CategoryTable, ConstraintSchemaError};
use crate::formula::{FormulaError, QuantityExpr};
use crate::matcher::find_matches;
use crate::{
    CandidateSystem, ConstraintCombination, EvaluationContext, EvaluationOutcome, OutcomeStatus,
    Product, ProductId, Rule, RuleType,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RuleConfigError {
    #[error(transparent)]
    Schema(#[from] ConstraintSchemaError),
    #[error("quantity formula rejected: {0}")]
    Formula(#[from] FormulaError),
}

/// A rule whose constraints passed the category schema and whose formula parsed.
#[derive(Debug, Clone)]
pub struct CompiledRule<'a> {
    pub rule: &'a Rule,
    pub quantity: QuantityExpr,
}

impl Rule {
    /// Authoring-time check: constraint keys against `categories`, then the formula grammar.
    ///
    /// # Errors
    /// Returns [`RuleConfigError::Schema`] for an unknown category or disallowed
    /// constraint keys, or [`RuleConfigError::Formula`] when the formula does not parse.
    pub fn compile(&self, categories: &CategoryTable) -> Result<CompiledRule<'_>, RuleConfigError> {
        categories.check_constraints(&self.object_category, &self.constraints)?;
        let quantity = QuantityExpr::parse(&self.quantity_formula)?;
        Ok(CompiledRule { rule: self, quantity })
    }
}

/// Evaluate one rule against a candidate design.
///
/// Inactive rules (subject absent) are vacuously satisfied. Configuration defects in the
/// rule itself become a `configError` outcome and never escape as an `Err`.
#[must_use]
pub fn evaluate(
    rule: &Rule,
    catalog: &[Product],
    design: &CandidateSystem,
    context: &EvaluationContext,
    categories: &CategoryTable,
) -> EvaluationOutcome {
    let outcome = evaluate_inner(rule, catalog, design, context, categories);
    match outcome.status {
        OutcomeStatus::ConfigError => {
            tracing::warn!(rule_id = %rule.id, message = %outcome.message, "rule configuration error");
        }
        status => {
            tracing::debug!(
                rule_id = %rule.id,
                rule_type = rule.rule_type.as_str(),
                status = status.as_str(),
                required = ?outcome.required,
                present = outcome.present,
                "rule evaluated"
            );
        }
    }
    outcome
}

fn evaluate_inner(
    rule: &Rule,
    catalog: &[Product],
    design: &CandidateSystem,
    context: &EvaluationContext,
    categories: &CategoryTable,
) -> EvaluationOutcome {
    if !design.contains(rule.subject_product_id) {
        return outcome(
            rule,
            OutcomeStatus::Satisfied,
            None,
            0,
            BTreeSet::new(),
            format!("inactive: subject product {} is not in the design", rule.subject_product_id),
        );
    }

    let compiled = match rule.compile(categories) {
        Ok(compiled) => compiled,
        Err(err) => {
            return outcome(rule, OutcomeStatus::ConfigError, None, 0, BTreeSet::new(), err.to_string())
        }
    };

    let required = match compiled.quantity.resolve_quantity(context) {
        Ok(required) => required,
        Err(err) => {
            return outcome(
                rule,
                OutcomeStatus::ConfigError,
                None,
                0,
                BTreeSet::new(),
                format!("quantity formula `{}` rejected: {err}", rule.quantity_formula),
            )
        }
    };

    // A catalogue may list the same id more than once; each design line counts once.
    let matched_ids = find_matches(catalog, &rule.object_category, &rule.constraints, rule.rule_type)
        .iter()
        .map(|product| product.id)
        .collect::<BTreeSet<_>>();
    let present = matched_ids
        .iter()
        .fold(0_u64, |total, id| total.saturating_add(design.quantity_of(*id)));
    let design_ids = design.product_ids();
    let matched_in_design =
        matched_ids.intersection(&design_ids).copied().collect::<BTreeSet<_>>();

    let target = describe_target(rule);
    let (status, message) = match rule.rule_type {
        RuleType::RequiresOne | RuleType::RequiresAll => {
            if present >= required {
                (
                    OutcomeStatus::Satisfied,
                    format!("requires {required} × {target}; {present} present"),
                )
            } else {
                (
                    OutcomeStatus::Violated,
                    format!(
                        "requires {required} × {target}; {present} present, short by {}",
                        required - present
                    ),
                )
            }
        }
        RuleType::Excludes => {
            if present > 0 {
                (
                    OutcomeStatus::Violated,
                    format!(
                        "excludes {target}; design contains product(s) {}",
                        join_ids(&matched_in_design)
                    ),
                )
            } else {
                (OutcomeStatus::Satisfied, format!("excludes {target}; none present"))
            }
        }
        RuleType::Recommends => {
            if present >= required {
                (
                    OutcomeStatus::Satisfied,
                    format!("recommends {required} × {target}; {present} present"),
                )
            } else {
                (
                    OutcomeStatus::RecommendedMissing,
                    format!(
                        "recommends {required} × {target}; {present} present, {} missing",
                        required - present
                    ),
                )
            }
        }
    };

    outcome(rule, status, Some(required), present, matched_in_design, message)
}

fn outcome(
    rule: &Rule,
    status: OutcomeStatus,
    required: Option<u64>,
    present: u64,
    matched_product_ids: BTreeSet<ProductId>,
    message: String,
) -> EvaluationOutcome {
    EvaluationOutcome { rule_id: rule.id, status, required, present, matched_product_ids, message }
}

fn describe_target(rule: &Rule) -> String {
    if rule.constraints.is_empty() {
        return format!("`{}`", rule.object_category);
    }

    let joiner = match rule.rule_type.combination() {
        ConstraintCombination::All => " and ",
        ConstraintCombination::Any => " or ",
    };
    let filters = rule
        .constraints
        .iter()
        .map(|(property, expected)| match expected {
            serde_json::Value::String(text) => format!("{property}={text}"),
            other => format!("{property}={other}"),
        })
        .collect::<Vec<_>>()
        .join(joiner);
    format!("`{}` with {filters}", rule.object_category)
}

fn join_ids(ids: &BTreeSet<ProductId>) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
