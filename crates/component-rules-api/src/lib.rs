use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use component_rules_core::{
    check_rule_set, derive_context, known_context_variables, validate, CandidateSystem,
    CategoryTable, EvaluationContext, EvaluationReport, FormulaErrorKind, Product, ProductId,
    QuantityExpr, Rule, RuleDiagnostic,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// A versioned snapshot of authored rules, as exported by the rule store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSetDocument {
    pub version: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogDocument {
    pub version: String,
    pub products: Vec<Product>,
}

fn default_derive_context() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidateRequest {
    pub rule_set: RuleSetDocument,
    pub catalog: CatalogDocument,
    pub design: CandidateSystem,
    /// Caller-supplied variables; these win over derived ones.
    #[serde(default)]
    pub context: EvaluationContext,
    #[serde(default = "default_derive_context")]
    pub derive_context: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationRun {
    pub contract_version: String,
    pub ruleset_version: String,
    pub catalog_version: String,
    pub categories_version: String,
    pub cache_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: OffsetDateTime,
    pub valid: bool,
    pub context: EvaluationContext,
    pub report: EvaluationReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckRulesRequest {
    pub rule_set: RuleSetDocument,
    pub catalog: CatalogDocument,
    /// Variables the caller will supply on top of the derived ones.
    #[serde(default)]
    pub extra_variables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleCheckResult {
    pub contract_version: String,
    pub ruleset_version: String,
    pub categories_version: String,
    pub rule_count: usize,
    pub clean: bool,
    pub diagnostics: Vec<RuleDiagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormulaEvalRequest {
    pub formula: String,
    #[serde(default)]
    pub context: EvaluationContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormulaFailure {
    pub kind: FormulaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormulaEvalResult {
    pub contract_version: String,
    pub formula: String,
    pub normalized: Option<String>,
    pub variables: Vec<String>,
    pub required: Option<u64>,
    pub error: Option<FormulaFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoriesView {
    pub contract_version: String,
    pub version: String,
    pub categories: BTreeMap<String, Vec<String>>,
    pub context_variables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ComponentRulesApi {
    categories: CategoryTable,
}

impl ComponentRulesApi {
    #[must_use]
    pub fn new(categories: CategoryTable) -> Self {
        Self { categories }
    }

    /// Use the category table compiled into the engine.
    ///
    /// # Errors
    /// Returns an error when the embedded table fails to parse.
    pub fn with_builtin_categories() -> Result<Self> {
        let categories = CategoryTable::builtin().context("failed to load builtin category table")?;
        Ok(Self::new(categories))
    }

    /// Load a replacement category table from a YAML file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not a valid category table.
    pub fn from_categories_file(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read category table {}", path.display()))?;
        let categories = CategoryTable::from_yaml_str(&body)
            .with_context(|| format!("failed to parse category table {}", path.display()))?;
        Ok(Self::new(categories))
    }

    #[must_use]
    pub fn categories(&self) -> &CategoryTable {
        &self.categories
    }

    /// Validate a candidate design against a rule set snapshot.
    ///
    /// # Errors
    /// Returns an error when the rule set or catalogue version is blank. Rule-level
    /// defects never fail the call; they are reported as `configErrors`.
    pub fn validate(&self, input: ValidateRequest) -> Result<ValidationRun> {
        ensure_version("rule set", &input.rule_set.version)?;
        ensure_version("catalogue", &input.catalog.version)?;

        let mut context = if input.derive_context {
            derive_context(&input.catalog.products, &input.design)
        } else {
            EvaluationContext::new()
        };
        context.extend(input.context);

        let report = validate(
            &input.rule_set.rules,
            &input.catalog.products,
            &input.design,
            &context,
            &self.categories,
        );
        let cache_key = compute_cache_key(
            self.categories.version(),
            &input.rule_set.version,
            &input.catalog.version,
            &input.design,
            &context,
        )?;
        tracing::info!(
            ruleset_version = %input.rule_set.version,
            catalog_version = %input.catalog.version,
            violations = report.violations.len(),
            config_errors = report.config_errors.len(),
            "validation run complete"
        );

        Ok(ValidationRun {
            contract_version: API_CONTRACT_VERSION.to_string(),
            ruleset_version: input.rule_set.version,
            catalog_version: input.catalog.version,
            categories_version: self.categories.version().to_string(),
            cache_key,
            evaluated_at: input.as_of.unwrap_or_else(OffsetDateTime::now_utc),
            valid: report.is_valid(),
            context,
            report,
        })
    }

    /// Lint a rule set before it is saved.
    ///
    /// # Errors
    /// Returns an error when the rule set version is blank.
    pub fn check_rules(&self, input: CheckRulesRequest) -> Result<RuleCheckResult> {
        ensure_version("rule set", &input.rule_set.version)?;

        let mut known = known_context_variables(&self.categories);
        known.extend(input.extra_variables);
        let diagnostics =
            check_rule_set(&input.rule_set.rules, &input.catalog.products, &self.categories, &known);

        Ok(RuleCheckResult {
            contract_version: API_CONTRACT_VERSION.to_string(),
            ruleset_version: input.rule_set.version,
            categories_version: self.categories.version().to_string(),
            rule_count: input.rule_set.rules.len(),
            clean: diagnostics.is_clean(),
            diagnostics: diagnostics.diagnostics,
        })
    }

    /// Parse and resolve a single quantity formula. Formula errors are part of the result.
    #[must_use]
    pub fn evaluate_formula(&self, input: FormulaEvalRequest) -> FormulaEvalResult {
        let mut result = FormulaEvalResult {
            contract_version: API_CONTRACT_VERSION.to_string(),
            formula: input.formula,
            normalized: None,
            variables: Vec::new(),
            required: None,
            error: None,
        };

        let expr = match QuantityExpr::parse(&result.formula) {
            Ok(expr) => expr,
            Err(err) => {
                result.error = Some(FormulaFailure { kind: err.kind(), message: err.to_string() });
                return result;
            }
        };
        result.normalized = Some(expr.to_string());
        result.variables = expr.variables().into_iter().collect();
        match expr.resolve_quantity(&input.context) {
            Ok(required) => result.required = Some(required),
            Err(err) => {
                result.error = Some(FormulaFailure { kind: err.kind(), message: err.to_string() });
            }
        }
        result
    }

    #[must_use]
    pub fn categories_view(&self) -> CategoriesView {
        let categories = self
            .categories
            .categories()
            .map(|name| {
                let properties = self
                    .categories
                    .allowed_properties(name)
                    .map(|allowed| allowed.iter().cloned().collect())
                    .unwrap_or_default();
                (name.to_string(), properties)
            })
            .collect();

        CategoriesView {
            contract_version: API_CONTRACT_VERSION.to_string(),
            version: self.categories.version().to_string(),
            categories,
            context_variables: known_context_variables(&self.categories).into_iter().collect(),
        }
    }
}

/// Read and deserialize a JSON input file.
///
/// # Errors
/// Returns an error when the file cannot be read or does not match `T`.
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("failed to parse {}", path.display()))
}

fn ensure_version(label: &str, version: &str) -> Result<()> {
    if version.trim().is_empty() {
        return Err(anyhow!("{label} version must be non-empty"));
    }
    Ok(())
}

/// Content hash over everything that can change a report.
///
/// Design lines are folded to per-product totals first, so reordering or splitting
/// lines does not change the key.
///
/// # Errors
/// Returns an error if the canonical design or context cannot be serialized.
pub fn compute_cache_key(
    categories_version: &str,
    ruleset_version: &str,
    catalog_version: &str,
    design: &CandidateSystem,
    context: &EvaluationContext,
) -> Result<String> {
    let canonical_design = design
        .product_ids()
        .into_iter()
        .map(|product_id| (product_id, design.quantity_of(product_id)))
        .collect::<BTreeMap<ProductId, u64>>();
    let design_json = serde_json::to_string(&canonical_design)?;
    let context_json = serde_json::to_string(context)?;

    let mut hasher = Sha256::new();
    for part in [
        categories_version,
        ruleset_version,
        catalog_version,
        design_json.as_str(),
        context_json.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0_u8]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
