use std::cmp::Ordering;

use crate::evaluator::evaluate;
use crate::{
    CandidateSystem, CategoryTable, EvaluationContext, EvaluationReport, OutcomeStatus, Product,
    Rule,
};

#[must_use]
pub fn default_tie_breakers() -> Vec<String> {
    vec![
        "rule_id asc".to_string(),
        "subject_product_id asc".to_string(),
        "rule_type asc".to_string(),
        "object_category asc".to_string(),
        "quantity_formula asc".to_string(),
        "description asc".to_string(),
    ]
}

fn rule_order(lhs: &Rule, rhs: &Rule) -> Ordering {
    lhs.id
        .cmp(&rhs.id)
        .then_with(|| lhs.subject_product_id.cmp(&rhs.subject_product_id))
        .then_with(|| lhs.rule_type.cmp(&rhs.rule_type))
        .then_with(|| lhs.object_category.cmp(&rhs.object_category))
        .then_with(|| lhs.quantity_formula.cmp(&rhs.quantity_formula))
        .then_with(|| lhs.description.cmp(&rhs.description))
}

/// Evaluate every rule against the design and bucket the non-satisfied outcomes.
///
/// Rules are visited in the order given by [`default_tie_breakers`], so the report
/// is identical for any permutation of `rules`. Inputs are only borrowed.
#[must_use]
pub fn validate(
    rules: &[Rule],
    catalog: &[Product],
    design: &CandidateSystem,
    context: &EvaluationContext,
    categories: &CategoryTable,
) -> EvaluationReport {
    let span = tracing::debug_span!(
        "validate",
        rules = rules.len(),
        products = catalog.len(),
        lines = design.lines.len(),
        categories_version = categories.version()
    );
    let _entered = span.enter();

    let mut ordered = rules.iter().collect::<Vec<_>>();
    ordered.sort_by(|lhs, rhs| rule_order(lhs, rhs));

    let mut report = EvaluationReport::default();
    for rule in ordered {
        let outcome = evaluate(rule, catalog, design, context, categories);
        match outcome.status {
            OutcomeStatus::Satisfied => {}
            OutcomeStatus::Violated => report.violations.push(outcome),
            OutcomeStatus::RecommendedMissing => report.recommendations.push(outcome),
            OutcomeStatus::ConfigError => report.config_errors.push(outcome),
        }
    }

    tracing::debug!(
        violations = report.violations.len(),
        recommendations = report.recommendations.len(),
        config_errors = report.config_errors.len(),
        "validation finished"
    );
    report
}
