use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::category::{CategoryTable, ConstraintSchemaError};
use crate::formula::{FormulaError, QuantityExpr};
use crate::{Product, ProductId, Rule, RuleId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticKind {
    UnknownCategory,
    UnknownConstraintKey,
    FormulaSyntax,
    UnknownFormulaVariable,
    DuplicateRuleId,
    UnknownSubjectProduct,
    DuplicateProductId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "camelCase")]
pub struct RuleDiagnostic {
    pub rule_id: RuleId,
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetDiagnostics {
    pub diagnostics: Vec<RuleDiagnostic>,
}

impl RuleSetDiagnostics {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Authoring-time lint of a rule set before it is saved.
///
/// `known_variables` lists the context names callers will supply at evaluation time;
/// pass an empty set to skip the variable check.
#[must_use]
pub fn check_rule_set(
    rules: &[Rule],
    catalog: &[Product],
    categories: &CategoryTable,
    known_variables: &BTreeSet<String>,
) -> RuleSetDiagnostics {
    let product_ids = catalog.iter().map(|product| product.id).collect::<BTreeSet<ProductId>>();
    let mut listings = BTreeMap::<ProductId, usize>::new();
    for product in catalog {
        *listings.entry(product.id).or_default() += 1;
    }
    let repeated = catalog
        .iter()
        .filter(|product| listings.get(&product.id).is_some_and(|count| *count > 1))
        .collect::<Vec<_>>();
    let mut occurrences = BTreeMap::<RuleId, usize>::new();
    let mut diagnostics = Vec::new();

    for rule in rules {
        *occurrences.entry(rule.id).or_default() += 1;
        let mut push = |kind, message: String| {
            diagnostics.push(RuleDiagnostic { rule_id: rule.id, kind, message });
        };

        if !product_ids.contains(&rule.subject_product_id) {
            push(
                DiagnosticKind::UnknownSubjectProduct,
                format!("subject product {} is not in the catalogue", rule.subject_product_id),
            );
        }

        for product in &repeated {
            if product.id == rule.subject_product_id || product.category == rule.object_category {
                push(
                    DiagnosticKind::DuplicateProductId,
                    format!(
                        "catalogue lists product {} {} times",
                        product.id,
                        listings.get(&product.id).copied().unwrap_or_default()
                    ),
                );
            }
        }

        match categories.check_constraints(&rule.object_category, &rule.constraints) {
            Ok(()) => {}
            Err(err @ ConstraintSchemaError::UnknownCategory(_)) => {
                push(DiagnosticKind::UnknownCategory, err.to_string());
            }
            Err(err @ ConstraintSchemaError::UnknownProperties { .. }) => {
                push(DiagnosticKind::UnknownConstraintKey, err.to_string());
            }
        }

        match QuantityExpr::parse(&rule.quantity_formula) {
            Ok(expr) => {
                if known_variables.is_empty() {
                    continue;
                }
                for variable in expr.variables().difference(known_variables) {
                    push(
                        DiagnosticKind::UnknownFormulaVariable,
                        FormulaError::UnknownVariable(variable.clone()).to_string(),
                    );
                }
            }
            Err(err) => push(
                DiagnosticKind::FormulaSyntax,
                format!("quantity formula `{}`: {err}", rule.quantity_formula),
            ),
        }
    }

    for (rule_id, count) in occurrences {
        if count > 1 {
            diagnostics.push(RuleDiagnostic {
                rule_id,
                kind: DiagnosticKind::DuplicateRuleId,
                message: format!("rule id {rule_id} is used by {count} rules"),
            });
        }
    }

    diagnostics.sort();
    diagnostics.dedup();
    RuleSetDiagnostics { diagnostics }
}
