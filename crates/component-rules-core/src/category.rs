use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::Constraints;

/// Category table shipped with the engine.
pub const DEFAULT_CATEGORY_TABLE_YAML: &str = include_str!("../../../config/categories.v1.yaml");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CategoryTableError {
    #[error("category table parse error: {0}")]
    Parse(String),
    #[error("category table invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConstraintSchemaError {
    #[error("object category `{0}` is not defined in the category table")]
    UnknownCategory(String),
    #[error("constraint properties [{}] are not allowed for category `{category}`", properties.join(", "))]
    UnknownProperties { category: String, properties: Vec<String> },
}

#[derive(Debug, Clone, Deserialize)]
struct RawCategoryTable {
    version: String,
    categories: BTreeMap<String, Vec<String>>,
}

/// Versioned, read-only map of category → allowed constraint properties.
///
/// Built once (usually at process start) and borrowed by every evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(try_from = "RawCategoryTable")]
pub struct CategoryTable {
    version: String,
    categories: BTreeMap<String, BTreeSet<String>>,
}

impl TryFrom<RawCategoryTable> for CategoryTable {
    type Error = CategoryTableError;

    fn try_from(raw: RawCategoryTable) -> Result<Self, Self::Error> {
        let categories = raw
            .categories
            .into_iter()
            .map(|(name, properties)| (name, properties.into_iter().collect()))
            .collect();
        Self::new(raw.version, categories)
    }
}

impl CategoryTable {
    /// Build a table from already-structured data.
    ///
    /// # Errors
    /// Returns [`CategoryTableError::Invalid`] when the version, a category name,
    /// or a property name is blank.
    pub fn new(
        version: impl Into<String>,
        categories: BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Self, CategoryTableError> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(CategoryTableError::Invalid("version MUST be non-empty".to_string()));
        }

        for (name, properties) in &categories {
            if name.trim().is_empty() {
                return Err(CategoryTableError::Invalid(
                    "category names MUST be non-empty".to_string(),
                ));
            }
            if properties.iter().any(|property| property.trim().is_empty()) {
                return Err(CategoryTableError::Invalid(format!(
                    "category `{name}` lists an empty property name"
                )));
            }
        }

        Ok(Self { version, categories })
    }

    /// Parse a YAML document of the form `{ version, categories: { name: [property, ...] } }`.
    ///
    /// # Errors
    /// Returns [`CategoryTableError::Parse`] for malformed YAML, or
    /// [`CategoryTableError::Invalid`] when the content breaks table invariants.
    pub fn from_yaml_str(body: &str) -> Result<Self, CategoryTableError> {
        let raw: RawCategoryTable =
            serde_yaml::from_str(body).map_err(|err| CategoryTableError::Parse(err.to_string()))?;
        Self::try_from(raw)
    }

    /// The table embedded from `config/categories.v1.yaml`.
    ///
    /// # Errors
    /// Returns an error only if the embedded document is broken.
    pub fn builtin() -> Result<Self, CategoryTableError> {
        Self::from_yaml_str(DEFAULT_CATEGORY_TABLE_YAML)
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    #[must_use]
    pub fn allowed_properties(&self, category: &str) -> Option<&BTreeSet<String>> {
        self.categories.get(category)
    }

    /// Check that every constraint key is allowed for `category`.
    ///
    /// # Errors
    /// Returns [`ConstraintSchemaError`] for an unknown category or for keys outside
    /// the category's property set (all offending keys, in authoring order).
    pub fn check_constraints(
        &self,
        category: &str,
        constraints: &Constraints,
    ) -> Result<(), ConstraintSchemaError> {
        let Some(allowed) = self.allowed_properties(category) else {
            return Err(ConstraintSchemaError::UnknownCategory(category.to_string()));
        };

        let unknown = constraints
            .keys()
            .filter(|key| !allowed.contains(key.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(ConstraintSchemaError::UnknownProperties {
                category: category.to_string(),
                properties: unknown,
            })
        }
    }
}
