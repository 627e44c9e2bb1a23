//! Declared field contracts for incoming records.
//!
//! A [`ContractSchema`] declares, per field, the expected runtime type and
//! optional constraints (required, numeric range, string length, regex
//! pattern, allowed values). The [`ContractValidator`](validator::ContractValidator)
//! checks sampled records against a schema and reports every violation it
//! finds.
//!
//! Patterns are compiled when the schema is built, so a malformed regex is a
//! configuration error surfaced at startup rather than a per-record failure.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::FieldValue;
use crate::error::{GuardError, Result};

pub mod validator;

pub use validator::{ContractValidator, ValidationReport};

/// Matches ISO-style timestamps (`2024-03-05 14:30:00` / `2024-03-05T14:30:00`),
/// so sources that serialize timestamps as text still satisfy a `Timestamp`
/// field declaration.
static TIMESTAMP_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}").expect("static timestamp pattern")
});

/// Declarable field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// UTF-8 text.
    String,
    /// 64-bit integer.
    Integer,
    /// 64-bit float. Integer values widen losslessly and are accepted.
    Float,
    /// Boolean.
    Boolean,
    /// UTC timestamp, either native or ISO-formatted text.
    Timestamp,
}

impl FieldType {
    /// Returns a human-readable name for this type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
        }
    }

    /// Whether a runtime value satisfies this declared type.
    pub fn matches(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (Self::String, FieldValue::Text(_)) => true,
            (Self::Integer, FieldValue::Integer(_)) => true,
            (Self::Float, FieldValue::Float(_) | FieldValue::Integer(_)) => true,
            (Self::Boolean, FieldValue::Boolean(_)) => true,
            (Self::Timestamp, FieldValue::Timestamp(_)) => true,
            (Self::Timestamp, FieldValue::Text(text)) => TIMESTAMP_TEXT.is_match(text),
            _ => false,
        }
    }
}

/// Declaration for one contract field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Expected runtime type.
    pub field_type: FieldType,
    /// Whether the field must be present and non-null.
    pub required: bool,
    /// Inclusive lower bound for numeric fields.
    pub min_value: Option<f64>,
    /// Inclusive upper bound for numeric fields.
    pub max_value: Option<f64>,
    /// Minimum string length.
    pub min_length: Option<usize>,
    /// Maximum string length.
    pub max_length: Option<usize>,
    /// Pattern string values must match.
    pub pattern: Option<Regex>,
    /// Closed set of allowed string values.
    pub allowed_values: Option<Vec<String>>,
}

impl FieldSpec {
    /// Creates an optional field of the given type with no constraints.
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            min_value: None,
            max_value: None,
            min_length: None,
            max_length: None,
            pattern: None,
            allowed_values: None,
        }
    }

    /// Marks the field required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets an inclusive numeric range. Either bound may be `None`.
    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }

    /// Sets a minimum string length.
    pub fn with_min_length(mut self, length: usize) -> Self {
        self.min_length = Some(length);
        self
    }

    /// Sets a maximum string length.
    pub fn with_max_length(mut self, length: usize) -> Self {
        self.max_length = Some(length);
        self
    }

    /// Compiles and attaches a regex pattern.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error when the pattern does not compile.
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self> {
        let compiled = Regex::new(pattern).map_err(|e| {
            GuardError::configuration(format!("invalid contract pattern '{pattern}': {e}"))
        })?;
        self.pattern = Some(compiled);
        Ok(self)
    }

    /// Restricts the field to a closed set of values.
    pub fn with_allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// A named contract: the declared schema incoming records must satisfy.
#[derive(Debug, Clone)]
pub struct ContractSchema {
    name: String,
    fields: BTreeMap<String, FieldSpec>,
}

impl ContractSchema {
    /// Creates an empty contract with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Declares a field.
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// The contract's name, used as the alert source identifier.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared fields in name order.
    pub fn fields(&self) -> &BTreeMap<String, FieldSpec> {
        &self.fields
    }
}

/// The classification of one contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViolationKind {
    /// Present value has the wrong runtime type.
    TypeMismatch,
    /// Required field missing or null.
    RequiredMissing,
    /// Numeric value outside its declared range.
    Range,
    /// String too long/short or failing its pattern.
    Pattern,
    /// Value outside the declared allowed set.
    Enum,
}

impl ViolationKind {
    /// Stable wire name for the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TypeMismatch => "TYPE_MISMATCH",
            Self::RequiredMissing => "REQUIRED_MISSING",
            Self::Range => "RANGE",
            Self::Pattern => "PATTERN",
            Self::Enum => "ENUM",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded contract violation. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractViolation {
    /// The violating field.
    pub field_name: String,
    /// What kind of rule was broken.
    pub kind: ViolationKind,
    /// Reference to the violating record in its source.
    pub record_reference: String,
    /// What the contract expected.
    pub expected: String,
    /// What the record actually held.
    pub actual: String,
    /// When the violation was detected.
    pub detected_at: DateTime<Utc>,
}
