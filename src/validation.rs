//! Schema validation helpers.
//!
//! Checks a JSON configuration against a [`Schema`] and reports every problem
//! found as a [`Diagnostic`], so the operator sees all of them in one pass.
//!
//! # Example
//!
//! ```
//! use hemmer_provider_strava::schema::{Attribute, Schema};
//! use hemmer_provider_strava::validation::validate;
//! use serde_json::json;
//!
//! let schema = Schema::v0()
//!     .with_attribute("callback_url", Attribute::required_string().with_max_length(255));
//!
//! assert!(validate(&schema, &json!({"callback_url": "https://example.com/hook"})).is_empty());
//!
//! let diagnostics = validate(&schema, &json!({"callback_url": 42}));
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("callback_url".to_string()));
//! ```

use crate::schema::{Attribute, AttributeType, Diagnostic, Schema};
use crate::types::is_unknown;
use serde_json::Value;

/// Validate a JSON value against a schema.
///
/// - Required attributes must be present and non-null
/// - Computed-only attributes are skipped (provider sets these)
/// - Values still unknown to the driver are accepted as-is
/// - Types and string length limits must match the schema
///
/// Attributes are checked in name order.
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let empty = serde_json::Map::new();
    let obj = match value {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            diagnostics.push(
                Diagnostic::error("Expected object")
                    .with_detail(format!("Got {}", value_type_name(other))),
            );
            return diagnostics;
        },
    };

    for name in schema.configurable_attributes() {
        check_attribute(
            &schema.block.attributes[name],
            obj.get(name),
            name,
            &mut diagnostics,
        );
    }

    diagnostics
}

/// Validate a JSON value against a schema, returning Err with diagnostics on failure.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

fn check_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        },
        Some(v) if is_unknown(v) => {},
        Some(v) => {
            if !type_matches(&attr.attr_type, v) {
                diagnostics.push(
                    Diagnostic::error(format!("Invalid type for '{}'", path))
                        .with_detail(format!(
                            "Expected {}, got {}",
                            type_name(&attr.attr_type),
                            value_type_name(v)
                        ))
                        .with_attribute(path),
                );
                return;
            }
            if let (Some(max), Some(s)) = (attr.max_length, v.as_str()) {
                let len = s.chars().count();
                if len > max {
                    diagnostics.push(
                        Diagnostic::error(format!("Value too long for '{}'", path))
                            .with_detail(format!(
                                "Maximum length is {} characters, got {}",
                                max, len
                            ))
                            .with_attribute(path),
                    );
                }
            }
        },
    }
}

fn type_matches(attr_type: &AttributeType, value: &Value) -> bool {
    match attr_type {
        AttributeType::String => value.is_string(),
        AttributeType::Int64 => value.as_i64().is_some(),
        AttributeType::List(element) => value
            .as_array()
            .is_some_and(|items| items.iter().all(|item| type_matches(element, item))),
        AttributeType::Object(attrs) => value.as_object().is_some_and(|obj| {
            attrs.iter().all(|(name, ty)| {
                obj.get(name)
                    .map_or(true, |v| v.is_null() || type_matches(ty, v))
            })
        }),
    }
}

fn type_name(attr_type: &AttributeType) -> &'static str {
    match attr_type {
        AttributeType::String => "string",
        AttributeType::Int64 => "int64",
        AttributeType::List(_) => "list",
        AttributeType::Object(_) => "object",
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNKNOWN_VALUE;
    use serde_json::json;

    fn subscription_schema() -> Schema {
        Schema::v0()
            .with_attribute(
                "callback_url",
                Attribute::required_string().with_max_length(255),
            )
            .with_attribute("verify_token", Attribute::required_string().sensitive())
            .with_attribute("id", Attribute::computed_int64())
    }

    #[test]
    fn test_valid_config() {
        let config = json!({"callback_url": "https://example.com/hook", "verify_token": "t0k3n"});
        assert!(validate(&subscription_schema(), &config).is_empty());
        assert!(validate_result(&subscription_schema(), &config).is_ok());
    }

    #[test]
    fn test_missing_required_attributes_are_all_reported() {
        let diagnostics = validate(&subscription_schema(), &json!({}));
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].attribute.as_deref(), Some("callback_url"));
        assert_eq!(diagnostics[1].attribute.as_deref(), Some("verify_token"));

        let diagnostics = validate(&subscription_schema(), &Value::Null);
        assert_eq!(diagnostics.len(), 2);
    }

    #[test]
    fn test_callback_url_length_limit() {
        let long = format!("https://example.com/{}", "a".repeat(250));
        let diagnostics = validate(
            &subscription_schema(),
            &json!({"callback_url": long, "verify_token": "t"}),
        );
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].summary.contains("too long"));

        let exact = "a".repeat(255);
        assert!(validate(
            &subscription_schema(),
            &json!({"callback_url": exact, "verify_token": "t"})
        )
        .is_empty());
    }

    #[test]
    fn test_wrong_type() {
        let diagnostics = validate(
            &subscription_schema(),
            &json!({"callback_url": 7, "verify_token": "t"}),
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].detail.as_deref(),
            Some("Expected string, got number")
        );
    }

    #[test]
    fn test_unknown_values_pass() {
        let config = json!({"callback_url": UNKNOWN_VALUE, "verify_token": "t"});
        assert!(validate(&subscription_schema(), &config).is_empty());
    }

    #[test]
    fn test_computed_values_ignored() {
        let config = json!({"callback_url": "u", "verify_token": "t", "id": "not-a-number"});
        assert!(validate(&subscription_schema(), &config).is_empty());
    }

    #[test]
    fn test_non_object() {
        let diagnostics = validate(&subscription_schema(), &json!([1, 2]));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].detail.as_deref(), Some("Got array"));
    }
}
