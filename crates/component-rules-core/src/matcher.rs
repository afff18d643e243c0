use serde_json::Value;

use crate::{ConstraintCombination, Constraints, Product, RuleType};

const NUMERIC_TOLERANCE: f64 = 1e-9;

/// Whether `product` belongs to `category` and satisfies `constraints` under the
/// combination policy of `rule_type`. An empty constraint set always matches.
#[must_use]
pub fn matches(
    product: &Product,
    category: &str,
    constraints: &Constraints,
    rule_type: RuleType,
) -> bool {
    if product.category != category {
        return false;
    }

    if constraints.is_empty() {
        return true;
    }

    let mut results = constraints.iter().map(|(property, expected)| {
        product.properties.get(property).is_some_and(|actual| values_equal(actual, expected))
    });
    match rule_type.combination() {
        ConstraintCombination::All => results.all(|hit| hit),
        ConstraintCombination::Any => results.any(|hit| hit),
    }
}

/// Every catalogue product matching the rule's object side, sorted by product id.
#[must_use]
pub fn find_matches<'a>(
    catalog: &'a [Product],
    category: &str,
    constraints: &Constraints,
    rule_type: RuleType,
) -> Vec<&'a Product> {
    let mut matched = catalog
        .iter()
        .filter(|product| matches(product, category, constraints, rule_type))
        .collect::<Vec<_>>();
    matched.sort_by_key(|product| product.id);
    matched
}

/// String-normalized equality: numbers compare numerically (`"48"` equals `48`),
/// everything else compares trimmed and ASCII case-insensitive.
#[must_use]
pub fn values_equal(actual: &Value, expected: &Value) -> bool {
    let (Some(actual), Some(expected)) = (normalized_text(actual), normalized_text(expected))
    else {
        return false;
    };

    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(lhs), Ok(rhs)) if lhs.is_finite() && rhs.is_finite() => {
            (lhs - rhs).abs() <= NUMERIC_TOLERANCE
        }
        _ => actual.eq_ignore_ascii_case(&expected),
    }
}

fn normalized_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
