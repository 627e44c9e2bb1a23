//! Batch validation of records against a contract schema.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::alert::{AlertCandidate, AlertKind, Severity};
use crate::backend::{FieldValue, SampleRecord};

use super::{ContractSchema, ContractViolation, FieldSpec, ViolationKind};

/// Aggregated result of one validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// The contract the run validated against.
    pub contract: String,
    /// Records inspected.
    pub records_checked: usize,
    /// Records with at least one violation.
    pub violating_records: usize,
    /// Every violation found, in record order.
    pub violations: Vec<ContractViolation>,
    /// Violation counts per kind.
    pub counts_by_kind: BTreeMap<ViolationKind, usize>,
    /// Violation counts per field.
    pub counts_by_field: BTreeMap<String, usize>,
}

impl ValidationReport {
    /// Total violations across all records.
    pub fn total_violations(&self) -> usize {
        self.violations.len()
    }

    /// `true` when no record violated the contract.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Builds the alert candidate for this run, or `None` when clean.
    ///
    /// Contract alerts dedup per contract per validation run: the run token
    /// becomes the dedup bucket.
    pub fn alert_candidate(
        &self,
        observed_at: DateTime<Utc>,
        run_token: &str,
    ) -> Option<AlertCandidate> {
        if self.is_clean() {
            return None;
        }
        let mut candidate = AlertCandidate::new(
            AlertKind::ContractViolation,
            Severity::Critical,
            self.contract.clone(),
            observed_at,
            format!(
                "{} contract violations across {} of {} records",
                self.total_violations(),
                self.violating_records,
                self.records_checked
            ),
        )
        .with_bucket(run_token)
        .with_detail("records_checked", self.records_checked)
        .with_detail("violating_records", self.violating_records)
        .with_detail("total_violations", self.total_violations());

        for (kind, count) in &self.counts_by_kind {
            candidate = candidate.with_detail(kind.as_str(), *count);
        }
        Some(candidate)
    }
}

/// Validates batches of records against one [`ContractSchema`].
///
/// Validation is total: every declared rule is checked for every record, so
/// a single record can contribute several violations. Fields present in a
/// record but absent from the contract are ignored.
pub struct ContractValidator {
    schema: ContractSchema,
}

impl ContractValidator {
    /// Creates a validator for the given schema.
    pub fn new(schema: ContractSchema) -> Self {
        Self { schema }
    }

    /// The contract this validator enforces.
    pub fn contract_name(&self) -> &str {
        self.schema.name()
    }

    /// Validates a batch of records, stamping violations with `detected_at`.
    #[instrument(skip(self, records), fields(
        contract = %self.schema.name(),
        records = records.len(),
    ))]
    pub fn validate_batch(
        &self,
        records: &[SampleRecord],
        detected_at: DateTime<Utc>,
    ) -> ValidationReport {
        let mut violations = Vec::new();
        let mut violating_records = 0usize;

        for record in records {
            let before = violations.len();
            self.validate_record(record, detected_at, &mut violations);
            if violations.len() > before {
                violating_records += 1;
            }
        }

        let mut counts_by_kind: BTreeMap<ViolationKind, usize> = BTreeMap::new();
        let mut counts_by_field: BTreeMap<String, usize> = BTreeMap::new();
        for violation in &violations {
            *counts_by_kind.entry(violation.kind).or_default() += 1;
            *counts_by_field
                .entry(violation.field_name.clone())
                .or_default() += 1;
        }

        if violations.is_empty() {
            debug!("contract validation passed");
        } else {
            warn!(
                total = violations.len(),
                violating_records, "contract violations detected"
            );
        }

        ValidationReport {
            contract: self.schema.name().to_string(),
            records_checked: records.len(),
            violating_records,
            violations,
            counts_by_kind,
            counts_by_field,
        }
    }

    fn validate_record(
        &self,
        record: &SampleRecord,
        detected_at: DateTime<Utc>,
        out: &mut Vec<ContractViolation>,
    ) {
        for (field_name, spec) in self.schema.fields() {
            let value = record.fields.get(field_name);
            match value {
                None => {
                    if spec.required {
                        out.push(self.violation(
                            field_name,
                            ViolationKind::RequiredMissing,
                            record,
                            format!("required {} field", spec.field_type.name()),
                            "missing".to_string(),
                            detected_at,
                        ));
                    }
                }
                Some(value) if value.is_null() => {
                    if spec.required {
                        out.push(self.violation(
                            field_name,
                            ViolationKind::RequiredMissing,
                            record,
                            format!("required {} field", spec.field_type.name()),
                            "null".to_string(),
                            detected_at,
                        ));
                    }
                }
                Some(value) => {
                    if !spec.field_type.matches(value) {
                        out.push(self.violation(
                            field_name,
                            ViolationKind::TypeMismatch,
                            record,
                            spec.field_type.name().to_string(),
                            format!("{} ({})", value.type_name(), value.display()),
                            detected_at,
                        ));
                        // Constraints are meaningless on a wrongly typed
                        // value; the remaining rules are skipped for this
                        // field only.
                        continue;
                    }
                    self.check_constraints(field_name, spec, value, record, detected_at, out);
                }
            }
        }
    }

    fn check_constraints(
        &self,
        field_name: &str,
        spec: &FieldSpec,
        value: &FieldValue,
        record: &SampleRecord,
        detected_at: DateTime<Utc>,
        out: &mut Vec<ContractViolation>,
    ) {
        if let Some(numeric) = numeric_value(value) {
            if let Some(min) = spec.min_value {
                if numeric < min {
                    out.push(self.violation(
                        field_name,
                        ViolationKind::Range,
                        record,
                        format!(">= {min}"),
                        numeric.to_string(),
                        detected_at,
                    ));
                }
            }
            if let Some(max) = spec.max_value {
                if numeric > max {
                    out.push(self.violation(
                        field_name,
                        ViolationKind::Range,
                        record,
                        format!("<= {max}"),
                        numeric.to_string(),
                        detected_at,
                    ));
                }
            }
        }

        if let FieldValue::Text(text) = value {
            if let Some(min_length) = spec.min_length {
                if text.chars().count() < min_length {
                    out.push(self.violation(
                        field_name,
                        ViolationKind::Pattern,
                        record,
                        format!("length >= {min_length}"),
                        format!("length {}", text.chars().count()),
                        detected_at,
                    ));
                }
            }
            if let Some(max_length) = spec.max_length {
                if text.chars().count() > max_length {
                    out.push(self.violation(
                        field_name,
                        ViolationKind::Pattern,
                        record,
                        format!("length <= {max_length}"),
                        format!("length {}", text.chars().count()),
                        detected_at,
                    ));
                }
            }
            if let Some(pattern) = &spec.pattern {
                if !pattern.is_match(text) {
                    out.push(self.violation(
                        field_name,
                        ViolationKind::Pattern,
                        record,
                        format!("matches /{}/", pattern.as_str()),
                        text.clone(),
                        detected_at,
                    ));
                }
            }
            if let Some(allowed) = &spec.allowed_values {
                if !allowed.iter().any(|candidate| candidate == text) {
                    out.push(self.violation(
                        field_name,
                        ViolationKind::Enum,
                        record,
                        format!("one of {allowed:?}"),
                        text.clone(),
                        detected_at,
                    ));
                }
            }
        }
    }

    fn violation(
        &self,
        field_name: &str,
        kind: ViolationKind,
        record: &SampleRecord,
        expected: String,
        actual: String,
        detected_at: DateTime<Utc>,
    ) -> ContractViolation {
        ContractViolation {
            field_name: field_name.to_string(),
            kind,
            record_reference: record.reference.clone(),
            expected,
            actual,
            detected_at,
        }
    }
}

/// Numeric view of a value, widening integers into floats.
fn numeric_value(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::Integer(v) => Some(*v as f64),
        FieldValue::Float(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::FieldType;

    fn order_schema() -> ContractSchema {
        ContractSchema::new("cdc_order_contract")
            .field(
                "order_key",
                FieldSpec::new(FieldType::String)
                    .required()
                    .with_max_length(32)
                    .with_pattern(r"^ORD-\d+$")
                    .unwrap(),
            )
            .field(
                "total_amount",
                FieldSpec::new(FieldType::Float)
                    .required()
                    .with_range(Some(0.0), Some(100_000.0)),
            )
            .field(
                "order_status",
                FieldSpec::new(FieldType::String)
                    .with_allowed_values(["pending", "shipped", "delivered"]),
            )
    }

    fn validator() -> ContractValidator {
        ContractValidator::new(order_schema())
    }

    fn valid_record() -> SampleRecord {
        SampleRecord::new("row-1")
            .with_field("order_key", FieldValue::Text("ORD-1001".into()))
            .with_field("total_amount", FieldValue::Float(59.98))
            .with_field("order_status", FieldValue::Text("shipped".into()))
    }

    #[test]
    fn clean_batch_reports_no_violations() {
        let report = validator().validate_batch(&[valid_record()], Utc::now());
        assert!(report.is_clean());
        assert_eq!(report.records_checked, 1);
        assert_eq!(report.violating_records, 0);
        assert!(report.alert_candidate(Utc::now(), "run-1").is_none());
    }

    #[test]
    fn string_value_in_float_field_is_type_mismatch() {
        let record = SampleRecord::new("row-2")
            .with_field("order_key", FieldValue::Text("ORD-1002".into()))
            .with_field("total_amount", FieldValue::Text("59.98".into()));

        let report = validator().validate_batch(&[record], Utc::now());
        assert_eq!(report.total_violations(), 1);
        let violation = &report.violations[0];
        assert_eq!(violation.field_name, "total_amount");
        assert_eq!(violation.kind, ViolationKind::TypeMismatch);
        assert_eq!(violation.expected, "float");
        assert!(violation.actual.contains("string"));
    }

    #[test]
    fn missing_required_field_is_reported() {
        let record =
            SampleRecord::new("row-3").with_field("total_amount", FieldValue::Float(10.0));
        let report = validator().validate_batch(&[record], Utc::now());
        assert_eq!(report.total_violations(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::RequiredMissing);
        assert_eq!(report.violations[0].field_name, "order_key");
    }

    #[test]
    fn null_required_field_is_reported() {
        let record = SampleRecord::new("row-4")
            .with_field("order_key", FieldValue::Null)
            .with_field("total_amount", FieldValue::Float(10.0));
        let report = validator().validate_batch(&[record], Utc::now());
        assert_eq!(report.total_violations(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::RequiredMissing);
        assert_eq!(report.violations[0].actual, "null");
    }

    #[test]
    fn validation_is_total_across_rules() {
        // Three independent rules broken by one record: pattern on
        // order_key, range on total_amount, enum on order_status.
        let record = SampleRecord::new("row-5")
            .with_field("order_key", FieldValue::Text("bad key".into()))
            .with_field("total_amount", FieldValue::Float(-5.0))
            .with_field("order_status", FieldValue::Text("teleported".into()));

        let report = validator().validate_batch(&[record], Utc::now());
        assert_eq!(report.total_violations(), 3);
        assert_eq!(report.violating_records, 1);
        assert_eq!(report.counts_by_kind[&ViolationKind::Pattern], 1);
        assert_eq!(report.counts_by_kind[&ViolationKind::Range], 1);
        assert_eq!(report.counts_by_kind[&ViolationKind::Enum], 1);
    }

    #[test]
    fn integer_widens_into_float_field() {
        let record = SampleRecord::new("row-6")
            .with_field("order_key", FieldValue::Text("ORD-7".into()))
            .with_field("total_amount", FieldValue::Integer(42));
        let report = validator().validate_batch(&[record], Utc::now());
        assert!(report.is_clean());
    }

    #[test]
    fn integer_out_of_range_is_range_violation() {
        let record = SampleRecord::new("row-7")
            .with_field("order_key", FieldValue::Text("ORD-8".into()))
            .with_field("total_amount", FieldValue::Integer(200_000));
        let report = validator().validate_batch(&[record], Utc::now());
        assert_eq!(report.total_violations(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::Range);
    }

    #[test]
    fn overlong_string_is_pattern_violation() {
        let record = SampleRecord::new("row-8")
            .with_field(
                "order_key",
                FieldValue::Text(format!("ORD-{}", "9".repeat(40))),
            )
            .with_field("total_amount", FieldValue::Float(1.0));
        let report = validator().validate_batch(&[record], Utc::now());
        assert_eq!(report.total_violations(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::Pattern);
        assert!(report.violations[0].expected.contains("length <= 32"));
    }

    #[test]
    fn undeclared_fields_are_ignored() {
        let record = valid_record().with_field("extra_column", FieldValue::Integer(1));
        let report = validator().validate_batch(&[record], Utc::now());
        assert!(report.is_clean());
    }

    #[test]
    fn type_mismatch_suppresses_constraint_checks_for_that_field() {
        // Wrong type AND would fail the range check; only the type mismatch
        // is reported for this field.
        let record = SampleRecord::new("row-9")
            .with_field("order_key", FieldValue::Text("ORD-10".into()))
            .with_field("total_amount", FieldValue::Text("-5".into()));
        let report = validator().validate_batch(&[record], Utc::now());
        assert_eq!(report.total_violations(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::TypeMismatch);
    }

    #[test]
    fn batch_aggregates_across_records() {
        let records = vec![
            valid_record(),
            SampleRecord::new("row-10").with_field("total_amount", FieldValue::Float(1.0)),
            SampleRecord::new("row-11")
                .with_field("order_key", FieldValue::Text("ORD-12".into()))
                .with_field("total_amount", FieldValue::Text("oops".into())),
        ];
        let report = validator().validate_batch(&records, Utc::now());
        assert_eq!(report.records_checked, 3);
        assert_eq!(report.violating_records, 2);
        assert_eq!(report.total_violations(), 2);
        assert_eq!(report.counts_by_field["order_key"], 1);
        assert_eq!(report.counts_by_field["total_amount"], 1);
    }

    #[test]
    fn alert_candidate_carries_run_token_and_counts() {
        let record = SampleRecord::new("row-12").with_field("total_amount", FieldValue::Float(1.0));
        let report = validator().validate_batch(&[record], Utc::now());

        let observed_at = Utc::now();
        let candidate = report.alert_candidate(observed_at, "run-42").unwrap();
        assert_eq!(candidate.kind, AlertKind::ContractViolation);
        assert_eq!(candidate.severity, Severity::Critical);
        assert_eq!(candidate.source, "cdc_order_contract");
        assert_eq!(candidate.bucket.as_deref(), Some("run-42"));
        assert_eq!(
            candidate.details.get("total_violations"),
            Some(&serde_json::Value::from(1))
        );
        assert_eq!(
            candidate.details.get("REQUIRED_MISSING"),
            Some(&serde_json::Value::from(1))
        );
    }
}
