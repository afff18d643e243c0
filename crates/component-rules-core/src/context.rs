use std::collections::{BTreeMap, BTreeSet};

use crate::{CandidateSystem, CategoryTable, EvaluationContext, Product, ProductId};

/// Category → conventional variable name used by quantity formulas.
pub const STANDARD_CATEGORY_VARIABLES: [(&str, &str); 4] = [
    ("panel", "numPanels"),
    ("inverter", "numInverters"),
    ("battery", "numBatteries"),
    ("charge_controller", "numChargeControllers"),
];

pub const TOTAL_UNITS_VARIABLE: &str = "totalUnits";

#[must_use]
pub fn category_count_variable(category: &str) -> String {
    format!("count_{category}")
}

/// Count units per category in `design` and expose them as formula variables.
///
/// Standard names are always present (zero when the category is absent); `count_<category>`
/// appears only for categories in the design. Lines whose product is not in the catalogue
/// count towards `totalUnits` only.
#[must_use]
pub fn derive_context(catalog: &[Product], design: &CandidateSystem) -> EvaluationContext {
    let categories_by_id = catalog
        .iter()
        .map(|product| (product.id, product.category.as_str()))
        .collect::<BTreeMap<ProductId, &str>>();

    let mut per_category = BTreeMap::<&str, u64>::new();
    let mut total = 0_u64;
    for line in &design.lines {
        let quantity = line.effective_quantity();
        if quantity == 0 {
            continue;
        }
        total = total.saturating_add(quantity);
        if let Some(category) = categories_by_id.get(&line.product_id) {
            let count = per_category.entry(*category).or_default();
            *count = count.saturating_add(quantity);
        }
    }

    let mut context = EvaluationContext::new();
    for (category, variable) in STANDARD_CATEGORY_VARIABLES {
        let count = per_category.get(category).copied().unwrap_or(0);
        context.insert(variable.to_string(), as_f64(count));
    }
    for (category, count) in &per_category {
        context.insert(category_count_variable(category), as_f64(*count));
    }
    context.insert(TOTAL_UNITS_VARIABLE.to_string(), as_f64(total));
    context
}

/// Every variable [`derive_context`] can produce for a design drawn from `categories`.
#[must_use]
pub fn known_context_variables(categories: &CategoryTable) -> BTreeSet<String> {
    STANDARD_CATEGORY_VARIABLES
        .iter()
        .map(|(_, variable)| (*variable).to_string())
        .chain(categories.categories().map(category_count_variable))
        .chain(std::iter::once(TOTAL_UNITS_VARIABLE.to_string()))
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(count: u64) -> f64 {
    count as f64
}
