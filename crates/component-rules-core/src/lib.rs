use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod category;
mod check;
mod context;
mod evaluator;
mod formula;
mod matcher;
mod report;

pub use category::{
    CategoryTable, CategoryTableError, ConstraintSchemaError, DEFAULT_CATEGORY_TABLE_YAML,
};
pub use check::{check_rule_set, DiagnosticKind, RuleDiagnostic, RuleSetDiagnostics};
pub use context::{
    category_count_variable, derive_context, known_context_variables,
    STANDARD_CATEGORY_VARIABLES, TOTAL_UNITS_VARIABLE,
};
pub use evaluator::{evaluate, CompiledRule, RuleConfigError};
pub use formula::{
    resolve, BinaryOp, FormulaError, FormulaErrorKind, QuantityExpr, MAX_FORMULA_LEN,
    MAX_NESTING_DEPTH,
};
pub use matcher::{find_matches, matches, values_equal};
pub use report::{default_tie_breakers, validate};

/// Property name → expected value, in authoring order.
pub type Constraints = serde_json::Map<String, serde_json::Value>;

/// Context variable name → value, derived by the caller from the design.
pub type EvaluationContext = std::collections::BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RuleId(pub u64);

impl Display for RuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ProductId(pub u64);

impl Display for ProductId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    RequiresOne,
    RequiresAll,
    Excludes,
    Recommends,
}

/// How the listed constraints of a rule combine when matching one product.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConstraintCombination {
    All,
    Any,
}

impl RuleType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequiresOne => "REQUIRES_ONE",
            Self::RequiresAll => "REQUIRES_ALL",
            Self::Excludes => "EXCLUDES",
            Self::Recommends => "RECOMMENDS",
        }
    }

    #[must_use]
    pub fn combination(self) -> ConstraintCombination {
        match self {
            Self::RequiresAll | Self::Excludes => ConstraintCombination::All,
            Self::RequiresOne | Self::Recommends => ConstraintCombination::Any,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: RuleId,
    pub subject_product_id: ProductId,
    pub rule_type: RuleType,
    pub object_category: String,
    #[serde(default)]
    pub constraints: Constraints,
    pub quantity_formula: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub category: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DesignLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl DesignLine {
    /// Quantity this line contributes; non-positive lines contribute nothing.
    #[must_use]
    pub fn effective_quantity(&self) -> u64 {
        u64::try_from(self.quantity).unwrap_or(0)
    }
}

/// The candidate system under validation, in the order the caller listed it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(transparent)]
pub struct CandidateSystem {
    pub lines: Vec<DesignLine>,
}

impl CandidateSystem {
    #[must_use]
    pub fn new(lines: Vec<DesignLine>) -> Self {
        Self { lines }
    }

    /// Total positive quantity of `product_id` across all lines.
    #[must_use]
    pub fn quantity_of(&self, product_id: ProductId) -> u64 {
        self.lines
            .iter()
            .filter(|line| line.product_id == product_id)
            .fold(0_u64, |total, line| total.saturating_add(line.effective_quantity()))
    }

    #[must_use]
    pub fn contains(&self, product_id: ProductId) -> bool {
        self.quantity_of(product_id) > 0
    }

    /// Ids of products present with a positive quantity.
    #[must_use]
    pub fn product_ids(&self) -> BTreeSet<ProductId> {
        self.lines
            .iter()
            .filter(|line| line.effective_quantity() > 0)
            .map(|line| line.product_id)
            .collect()
    }
}

impl From<Vec<DesignLine>> for CandidateSystem {
    fn from(lines: Vec<DesignLine>) -> Self {
        Self::new(lines)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum OutcomeStatus {
    Satisfied,
    Violated,
    RecommendedMissing,
    ConfigError,
}

impl OutcomeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Satisfied => "satisfied",
            Self::Violated => "violated",
            Self::RecommendedMissing => "recommendedMissing",
            Self::ConfigError => "configError",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationOutcome {
    pub rule_id: RuleId,
    pub status: OutcomeStatus,
    pub required: Option<u64>,
    pub present: u64,
    pub matched_product_ids: BTreeSet<ProductId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReport {
    pub violations: Vec<EvaluationOutcome>,
    pub recommendations: Vec<EvaluationOutcome>,
    pub config_errors: Vec<EvaluationOutcome>,
}

impl EvaluationReport {
    /// A design is usable downstream when nothing blocks it. Recommendations never block.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty() && self.config_errors.is_empty()
    }
}
