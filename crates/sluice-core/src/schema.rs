//! Input schema validation for task inputs.
//!
//! Task definitions may carry a structured schema describing their input
//! object; pipeline triggers validate against it in `strict`, `warn`, or
//! `none` mode. The same structure drives form generation in UIs, so field
//! kinds include presentational variants (`textarea`, `select`) that
//! validate like their underlying type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How trigger-time validation reacts to schema violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Reject the trigger on any violation.
    #[default]
    Strict,
    /// Log violations, return them as warnings, proceed.
    Warn,
    /// Skip validation entirely.
    None,
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            "none" => Ok(Self::None),
            other => Err(format!("invalid validation mode: {other:?}")),
        }
    }
}

/// One violation, anchored to the offending field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Field kinds a schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Email,
    Url,
    Date,
    Datetime,
    Select,
    Multiselect,
    Textarea,
    Json,
    File,
    Array,
    Object,
}

/// Conditional visibility operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShowIfOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
}

/// A field is only expected (and validated) when its condition holds
/// against the sibling field's submitted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowIf {
    pub field: String,
    pub op: ShowIfOp,
    pub value: Value,
}

/// One declared input field with its constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Literal fragment the value must contain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,
    /// Accepted mime types for `file` fields (informational for UIs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<String>,
    /// Maximum upload size in bytes for `file` fields (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<FieldSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_if: Option<ShowIf>,
}

/// A task's declared input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSchema {
    /// Reject keys not declared by any field.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl InputSchema {
    /// Parse a schema out of the JSON stored on a task definition.
    pub fn parse(value: &Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| format!("invalid input schema: {e}"))
    }

    /// Validate an input object against this schema. Returns every
    /// violation found; an empty vec means the input conforms.
    pub fn validate(&self, input: &Value) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        let Some(object) = input.as_object() else {
            issues.push(ValidationIssue::new("$", "input must be a JSON object"));
            return issues;
        };

        if self.strict {
            for key in object.keys() {
                if !self.fields.iter().any(|f| &f.name == key) {
                    issues.push(ValidationIssue::new(key.clone(), "unknown field"));
                }
            }
        }

        for field in &self.fields {
            if let Some(show_if) = &field.show_if {
                if !show_if_holds(show_if, object) {
                    continue;
                }
            }
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        issues.push(ValidationIssue::new(
                            field.name.clone(),
                            "required field is missing",
                        ));
                    }
                }
                Some(value) => validate_field(field, &field.name, value, &mut issues),
            }
        }

        issues
    }
}

fn validate_field(spec: &FieldSpec, path: &str, value: &Value, issues: &mut Vec<ValidationIssue>) {
    match spec.kind {
        FieldKind::String | FieldKind::Textarea => {
            let Some(s) = value.as_str() else {
                issues.push(ValidationIssue::new(path, "expected a string"));
                return;
            };
            check_string_constraints(spec, path, s, issues);
        }
        FieldKind::Number => {
            let Some(n) = value.as_f64() else {
                issues.push(ValidationIssue::new(path, "expected a number"));
                return;
            };
            check_range(spec, path, n, issues);
        }
        FieldKind::Integer => {
            let Some(n) = value.as_i64() else {
                issues.push(ValidationIssue::new(path, "expected an integer"));
                return;
            };
            check_range(spec, path, n as f64, issues);
        }
        FieldKind::Boolean => {
            if !value.is_boolean() {
                issues.push(ValidationIssue::new(path, "expected a boolean"));
            }
        }
        FieldKind::Email => {
            let ok = value.as_str().is_some_and(|s| {
                s.split_once('@').is_some_and(|(local, domain)| {
                    !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
                })
            });
            if !ok {
                issues.push(ValidationIssue::new(path, "expected an email address"));
            }
        }
        FieldKind::Url => {
            let ok = value.as_str().is_some_and(|s| {
                s.split_once("://")
                    .is_some_and(|(scheme, rest)| !scheme.is_empty() && !rest.is_empty())
            });
            if !ok {
                issues.push(ValidationIssue::new(path, "expected a URL"));
            }
        }
        FieldKind::Date => {
            let ok = value
                .as_str()
                .is_some_and(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok());
            if !ok {
                issues.push(ValidationIssue::new(path, "expected a date (YYYY-MM-DD)"));
            }
        }
        FieldKind::Datetime => {
            let ok = value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok());
            if !ok {
                issues.push(ValidationIssue::new(
                    path,
                    "expected an RFC 3339 datetime",
                ));
            }
        }
        FieldKind::Select => {
            if !spec.options.contains(value) {
                issues.push(ValidationIssue::new(path, "value is not one of the options"));
            }
        }
        FieldKind::Multiselect => {
            let Some(items) = value.as_array() else {
                issues.push(ValidationIssue::new(path, "expected an array"));
                return;
            };
            for (i, item) in items.iter().enumerate() {
                if !spec.options.contains(item) {
                    issues.push(ValidationIssue::new(
                        format!("{path}[{i}]"),
                        "value is not one of the options",
                    ));
                }
            }
        }
        FieldKind::Json => {}
        FieldKind::File => {
            let ok = value
                .as_str()
                .is_some_and(crate::ids::is_temp_upload_id);
            if !ok {
                issues.push(ValidationIssue::new(
                    path,
                    "expected a temp-upload id (tmp_…)",
                ));
            }
        }
        FieldKind::Array => {
            let Some(items) = value.as_array() else {
                issues.push(ValidationIssue::new(path, "expected an array"));
                return;
            };
            check_range(spec, path, items.len() as f64, issues);
            if let Some(item_spec) = &spec.items {
                for (i, item) in items.iter().enumerate() {
                    validate_field(item_spec, &format!("{path}[{i}]"), item, issues);
                }
            }
        }
        FieldKind::Object => {
            let Some(object) = value.as_object() else {
                issues.push(ValidationIssue::new(path, "expected an object"));
                return;
            };
            if let Some(props) = &spec.properties {
                for prop in props {
                    let prop_path = format!("{path}.{}", prop.name);
                    match object.get(&prop.name) {
                        None | Some(Value::Null) => {
                            if prop.required {
                                issues.push(ValidationIssue::new(
                                    prop_path,
                                    "required field is missing",
                                ));
                            }
                        }
                        Some(inner) => validate_field(prop, &prop_path, inner, issues),
                    }
                }
            }
        }
    }
}

fn check_string_constraints(
    spec: &FieldSpec,
    path: &str,
    s: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    if let Some(min) = spec.min_length {
        if s.chars().count() < min {
            issues.push(ValidationIssue::new(path, format!("shorter than {min} chars")));
        }
    }
    if let Some(max) = spec.max_length {
        if s.chars().count() > max {
            issues.push(ValidationIssue::new(path, format!("longer than {max} chars")));
        }
    }
    if let Some(pattern) = &spec.pattern {
        if !s.contains(pattern.as_str()) {
            issues.push(ValidationIssue::new(
                path,
                format!("must contain {pattern:?}"),
            ));
        }
    }
}

fn check_range(spec: &FieldSpec, path: &str, n: f64, issues: &mut Vec<ValidationIssue>) {
    if let Some(min) = spec.min {
        if n < min {
            issues.push(ValidationIssue::new(path, format!("below minimum {min}")));
        }
    }
    if let Some(max) = spec.max {
        if n > max {
            issues.push(ValidationIssue::new(path, format!("above maximum {max}")));
        }
    }
}

fn show_if_holds(cond: &ShowIf, object: &serde_json::Map<String, Value>) -> bool {
    let actual = object.get(&cond.field).unwrap_or(&Value::Null);
    match cond.op {
        ShowIfOp::Eq => actual == &cond.value,
        ShowIfOp::Ne => actual != &cond.value,
        ShowIfOp::Gt => compare(actual, &cond.value).is_some_and(|o| o == std::cmp::Ordering::Greater),
        ShowIfOp::Lt => compare(actual, &cond.value).is_some_and(|o| o == std::cmp::Ordering::Less),
        ShowIfOp::Gte => compare(actual, &cond.value)
            .is_some_and(|o| o != std::cmp::Ordering::Less),
        ShowIfOp::Lte => compare(actual, &cond.value)
            .is_some_and(|o| o != std::cmp::Ordering::Greater),
        ShowIfOp::In => cond
            .value
            .as_array()
            .is_some_and(|opts| opts.contains(actual)),
        ShowIfOp::NotIn => cond
            .value
            .as_array()
            .is_none_or(|opts| !opts.contains(actual)),
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let a = a.as_f64()?;
    let b = b.as_f64()?;
    a.partial_cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(strict: bool, fields: Value) -> InputSchema {
        InputSchema::parse(&json!({ "strict": strict, "fields": fields })).unwrap()
    }

    #[test]
    fn required_field_missing() {
        let schema = schema(
            false,
            json!([{ "name": "x", "type": "number", "required": true }]),
        );
        let issues = schema.validate(&json!({}));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "x");
    }

    #[test]
    fn strict_rejects_unknown_keys() {
        let schema = schema(true, json!([{ "name": "x", "type": "number" }]));
        let issues = schema.validate(&json!({ "x": 1, "extra": true }));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "extra");
    }

    #[test]
    fn non_strict_allows_unknown_keys() {
        let schema = schema(false, json!([{ "name": "x", "type": "number" }]));
        assert!(schema.validate(&json!({ "x": 1, "extra": true })).is_empty());
    }

    #[test]
    fn number_range() {
        let schema = schema(
            false,
            json!([{ "name": "n", "type": "number", "min": 0, "max": 10 }]),
        );
        assert!(schema.validate(&json!({ "n": 5 })).is_empty());
        assert_eq!(schema.validate(&json!({ "n": -1 })).len(), 1);
        assert_eq!(schema.validate(&json!({ "n": 11 })).len(), 1);
        assert_eq!(schema.validate(&json!({ "n": "five" })).len(), 1);
    }

    #[test]
    fn integer_rejects_fraction() {
        let schema = schema(false, json!([{ "name": "n", "type": "integer" }]));
        assert!(schema.validate(&json!({ "n": 3 })).is_empty());
        assert_eq!(schema.validate(&json!({ "n": 3.5 })).len(), 1);
    }

    #[test]
    fn string_length_and_pattern() {
        let schema = schema(
            false,
            json!([{ "name": "s", "type": "string", "minLength": 2, "maxLength": 5, "pattern": "ab" }]),
        );
        assert!(schema.validate(&json!({ "s": "abc" })).is_empty());
        assert_eq!(schema.validate(&json!({ "s": "a" })).len(), 2);
        assert_eq!(schema.validate(&json!({ "s": "abcdef" })).len(), 1);
        assert_eq!(schema.validate(&json!({ "s": "xyz" })).len(), 1);
    }

    #[test]
    fn email_and_url_shapes() {
        let schema = schema(
            false,
            json!([
                { "name": "e", "type": "email" },
                { "name": "u", "type": "url" },
            ]),
        );
        assert!(
            schema
                .validate(&json!({ "e": "a@b.example", "u": "https://example.com" }))
                .is_empty()
        );
        assert_eq!(
            schema
                .validate(&json!({ "e": "not-an-email", "u": "example.com" }))
                .len(),
            2
        );
    }

    #[test]
    fn date_and_datetime() {
        let schema = schema(
            false,
            json!([
                { "name": "d", "type": "date" },
                { "name": "dt", "type": "datetime" },
            ]),
        );
        assert!(
            schema
                .validate(&json!({ "d": "2026-08-01", "dt": "2026-08-01T12:00:00Z" }))
                .is_empty()
        );
        assert_eq!(
            schema
                .validate(&json!({ "d": "08/01/2026", "dt": "noonish" }))
                .len(),
            2
        );
    }

    #[test]
    fn select_and_multiselect() {
        let schema = schema(
            false,
            json!([
                { "name": "s", "type": "select", "options": ["a", "b"] },
                { "name": "m", "type": "multiselect", "options": ["a", "b"] },
            ]),
        );
        assert!(
            schema
                .validate(&json!({ "s": "a", "m": ["a", "b"] }))
                .is_empty()
        );
        let issues = schema.validate(&json!({ "s": "c", "m": ["a", "z"] }));
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[1].field, "m[1]");
    }

    #[test]
    fn file_expects_temp_upload_id() {
        let schema = schema(false, json!([{ "name": "f", "type": "file" }]));
        assert!(schema.validate(&json!({ "f": "tmp_abc123" })).is_empty());
        assert_eq!(schema.validate(&json!({ "f": "/etc/passwd" })).len(), 1);
    }

    #[test]
    fn nested_array_and_object() {
        let schema = schema(
            false,
            json!([
                {
                    "name": "rows",
                    "type": "array",
                    "min": 1,
                    "items": { "name": "row", "type": "integer", "min": 0 }
                },
                {
                    "name": "meta",
                    "type": "object",
                    "properties": [
                        { "name": "label", "type": "string", "required": true }
                    ]
                }
            ]),
        );
        assert!(
            schema
                .validate(&json!({ "rows": [1, 2], "meta": { "label": "ok" } }))
                .is_empty()
        );
        let issues = schema.validate(&json!({ "rows": [1, -2], "meta": {} }));
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].field, "rows[1]");
        assert_eq!(issues[1].field, "meta.label");
    }

    #[test]
    fn show_if_skips_hidden_fields() {
        let schema = schema(
            false,
            json!([
                { "name": "mode", "type": "select", "options": ["basic", "advanced"] },
                {
                    "name": "tuning",
                    "type": "number",
                    "required": true,
                    "showIf": { "field": "mode", "op": "eq", "value": "advanced" }
                }
            ]),
        );
        // Hidden: no issue even though required.
        assert!(schema.validate(&json!({ "mode": "basic" })).is_empty());
        // Visible: required kicks in.
        assert_eq!(schema.validate(&json!({ "mode": "advanced" })).len(), 1);
    }

    #[test]
    fn show_if_numeric_ops() {
        let schema = schema(
            false,
            json!([
                { "name": "count", "type": "number" },
                {
                    "name": "reason",
                    "type": "string",
                    "required": true,
                    "showIf": { "field": "count", "op": "gt", "value": 10 }
                }
            ]),
        );
        assert!(schema.validate(&json!({ "count": 5 })).is_empty());
        assert_eq!(schema.validate(&json!({ "count": 11 })).len(), 1);
    }

    #[test]
    fn non_object_input_rejected() {
        let schema = schema(false, json!([]));
        let issues = schema.validate(&json!([1, 2, 3]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "$");
    }

    #[test]
    fn validation_mode_parse() {
        assert_eq!("strict".parse::<ValidationMode>().unwrap(), ValidationMode::Strict);
        assert_eq!("warn".parse::<ValidationMode>().unwrap(), ValidationMode::Warn);
        assert_eq!("none".parse::<ValidationMode>().unwrap(), ValidationMode::None);
        assert!("loose".parse::<ValidationMode>().is_err());
    }
}
