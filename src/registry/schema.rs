//! Template structure trees and declarative rules.
//!
//! A structure is written as a TOML table whose leaves are placeholders:
//!
//! ```toml
//! [templates."ccu.order.request".structure]
//! type = "[RED, WHITE, BLUE]"
//! orderType = "PRODUCTION"
//! timestamp = "<datetime>"
//! "erpOrderId?" = "<string>"
//! ```
//!
//! Non-placeholder leaves are constants the payload must equal. A
//! one-element array describes every item of the list.

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

const ROOT: &str = "payload";

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    String,
    Number,
    Integer,
    Boolean,
    DateTime,
    Uuid,
    Object,
    Any,
    Enum(Vec<String>),
    Const(Value),
    Array(Box<SchemaNode>),
    Map(Vec<SchemaField>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub required: bool,
    pub node: SchemaNode,
}

impl SchemaNode {
    pub fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Ok(Self::parse_leaf(s)),
            Value::Array(items) => match items.as_slice() {
                [] => Ok(SchemaNode::Array(Box::new(SchemaNode::Any))),
                [item] => Ok(SchemaNode::Array(Box::new(Self::parse(item)?))),
                _ => Err(format!(
                    "array schema must have exactly one element, found {}",
                    items.len()
                )),
            },
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (key, node) in map {
                    let (name, required) = match key.strip_suffix('?') {
                        Some(name) => (name.to_string(), false),
                        None => (key.clone(), true),
                    };
                    let node = Self::parse(node).map_err(|e| format!("{}: {}", name, e))?;
                    fields.push(SchemaField {
                        name,
                        required,
                        node,
                    });
                }
                Ok(SchemaNode::Map(fields))
            }
            other => Ok(SchemaNode::Const(other.clone())),
        }
    }

    fn parse_leaf(s: &str) -> Self {
        match s {
            "<string>" => SchemaNode::String,
            "<number>" => SchemaNode::Number,
            "<integer>" => SchemaNode::Integer,
            "<boolean>" => SchemaNode::Boolean,
            "<datetime>" => SchemaNode::DateTime,
            "<uuid>" => SchemaNode::Uuid,
            "<object>" => SchemaNode::Object,
            "<any>" => SchemaNode::Any,
            _ => match s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
                Some(inner) => SchemaNode::Enum(
                    inner
                        .split(',')
                        .map(|v| v.trim().to_string())
                        .filter(|v| !v.is_empty())
                        .collect(),
                ),
                None => SchemaNode::Const(Value::String(s.to_string())),
            },
        }
    }

    /// Checks `value` and appends one message per problem. Every message
    /// names the field path.
    pub fn check(&self, value: &Value, path: &str, errors: &mut Vec<String>) {
        let at = if path.is_empty() { ROOT } else { path };
        match self {
            SchemaNode::Any => {}
            SchemaNode::String => expect(value.is_string(), "string", value, at, errors),
            SchemaNode::Number => expect(value.is_number(), "number", value, at, errors),
            SchemaNode::Integer => expect(
                value.is_i64() || value.is_u64(),
                "integer",
                value,
                at,
                errors,
            ),
            SchemaNode::Boolean => expect(value.is_boolean(), "boolean", value, at, errors),
            SchemaNode::Object => expect(value.is_object(), "object", value, at, errors),
            SchemaNode::DateTime => match value.as_str() {
                Some(s) if is_iso_millis_utc(s) => {}
                Some(s) => errors.push(format!(
                    "field '{}': '{}' is not an ISO-8601 timestamp with milliseconds and Z suffix",
                    at, s
                )),
                None => expect(false, "datetime string", value, at, errors),
            },
            SchemaNode::Uuid => match value.as_str() {
                Some(s) if is_canonical_uuid(s) => {}
                Some(s) => errors.push(format!("field '{}': '{}' is not a uuid", at, s)),
                None => expect(false, "uuid string", value, at, errors),
            },
            SchemaNode::Enum(allowed) => match value.as_str() {
                Some(s) if allowed.iter().any(|a| a == s) => {}
                _ => errors.push(format!(
                    "field '{}': {} is not one of [{}]",
                    at,
                    value,
                    allowed.join(", ")
                )),
            },
            SchemaNode::Const(expected) => {
                if !values_equal(expected, value) {
                    errors.push(format!("field '{}': expected {}, got {}", at, expected, value));
                }
            }
            SchemaNode::Array(item) => match value.as_array() {
                Some(items) => {
                    for (i, v) in items.iter().enumerate() {
                        item.check(v, &format!("{}[{}]", path, i), errors);
                    }
                }
                None => expect(false, "array", value, at, errors),
            },
            SchemaNode::Map(fields) => {
                let Some(map) = value.as_object() else {
                    expect(false, "object", value, at, errors);
                    return;
                };
                for field in fields {
                    let child = join(path, &field.name);
                    match map.get(&field.name) {
                        None | Some(Value::Null) if !field.required => {}
                        None => errors.push(format!("missing required field '{}'", child)),
                        Some(v) => field.node.check(v, &child, errors),
                    }
                }
            }
        }
    }

    /// Renders the tree back into the placeholder notation.
    pub fn describe(&self) -> Value {
        match self {
            SchemaNode::String => json!("<string>"),
            SchemaNode::Number => json!("<number>"),
            SchemaNode::Integer => json!("<integer>"),
            SchemaNode::Boolean => json!("<boolean>"),
            SchemaNode::DateTime => json!("<datetime>"),
            SchemaNode::Uuid => json!("<uuid>"),
            SchemaNode::Object => json!("<object>"),
            SchemaNode::Any => json!("<any>"),
            SchemaNode::Enum(values) => json!(format!("[{}]", values.join(", "))),
            SchemaNode::Const(v) => v.clone(),
            SchemaNode::Array(item) => json!([item.describe()]),
            SchemaNode::Map(fields) => Value::Object(
                fields
                    .iter()
                    .map(|f| {
                        let key = if f.required {
                            f.name.clone()
                        } else {
                            format!("{}?", f.name)
                        };
                        (key, f.node.describe())
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCheck {
    NonEmpty,
    Equals,
    OneOf,
    Min,
    Max,
    MinItems,
    MaxItems,
    Prefix,
}

/// A constraint beyond shape, e.g. `{ field = "actions", check = "min_items", value = 1 }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rule {
    pub field: String,
    pub check: RuleCheck,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Rule {
    /// Rejects rules that can never be evaluated.
    pub fn verify(&self) -> Result<(), String> {
        let ok = match (self.check, &self.value) {
            (RuleCheck::NonEmpty, _) => true,
            (RuleCheck::Equals, Some(_)) => true,
            (RuleCheck::OneOf, Some(Value::Array(_))) => true,
            (RuleCheck::Min | RuleCheck::Max, Some(v)) => v.is_number(),
            (RuleCheck::MinItems | RuleCheck::MaxItems, Some(v)) => v.is_u64(),
            (RuleCheck::Prefix, Some(Value::String(_))) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "rule {:?} on '{}' has a missing or mistyped value",
                self.check, self.field
            ))
        }
    }

    pub fn apply(&self, payload: &Value, errors: &mut Vec<String>) {
        // absent fields are the structure check's business
        for (path, value) in select(payload, &self.field) {
            if let Some(problem) = self.violation(value) {
                errors.push(format!("field '{}': {}", path, problem));
            }
        }
    }

    fn violation(&self, value: &Value) -> Option<String> {
        let expected = self.value.as_ref().unwrap_or(&Value::Null);
        match self.check {
            RuleCheck::NonEmpty => {
                let empty = match value {
                    Value::Null => true,
                    Value::String(s) => s.trim().is_empty(),
                    Value::Array(a) => a.is_empty(),
                    Value::Object(o) => o.is_empty(),
                    _ => false,
                };
                empty.then(|| "must not be empty".to_string())
            }
            RuleCheck::Equals => (!values_equal(expected, value))
                .then(|| format!("must equal {}, got {}", expected, value)),
            RuleCheck::OneOf => {
                let options = expected.as_array().map(Vec::as_slice).unwrap_or_default();
                (!options.iter().any(|o| values_equal(o, value)))
                    .then(|| format!("{} is not one of {}", value, expected))
            }
            RuleCheck::Min | RuleCheck::Max => {
                let (Some(actual), Some(bound)) = (value.as_f64(), expected.as_f64()) else {
                    return Some(format!("expected a number, got {}", value));
                };
                match self.check {
                    RuleCheck::Min if actual < bound => {
                        Some(format!("{} is below minimum {}", value, expected))
                    }
                    RuleCheck::Max if actual > bound => {
                        Some(format!("{} is above maximum {}", value, expected))
                    }
                    _ => None,
                }
            }
            RuleCheck::MinItems | RuleCheck::MaxItems => {
                let Some(items) = value.as_array() else {
                    return Some(format!("expected an array, got {}", value));
                };
                let bound = expected.as_u64().unwrap_or(0) as usize;
                match self.check {
                    RuleCheck::MinItems if items.len() < bound => {
                        Some(format!("needs at least {} items, has {}", bound, items.len()))
                    }
                    RuleCheck::MaxItems if items.len() > bound => {
                        Some(format!("allows at most {} items, has {}", bound, items.len()))
                    }
                    _ => None,
                }
            }
            RuleCheck::Prefix => {
                let prefix = expected.as_str().unwrap_or_default();
                match value.as_str() {
                    Some(s) if s.starts_with(prefix) => None,
                    _ => Some(format!("{} does not start with '{}'", value, prefix)),
                }
            }
        }
    }
}

/// Resolves a rule path such as `actions[].metadata.nodeId` to every
/// matching value, paired with its concrete path.
pub fn select<'a>(root: &'a Value, path: &str) -> Vec<(String, &'a Value)> {
    let mut current: Vec<(String, &Value)> = vec![(String::new(), root)];
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (name, each) = match segment.strip_suffix("[]") {
            Some(name) => (name, true),
            None => (segment, false),
        };
        let mut next = Vec::new();
        for (prefix, value) in current {
            let Some(child) = value.get(name) else {
                continue;
            };
            let child_path = join(&prefix, name);
            if each {
                if let Some(items) = child.as_array() {
                    for (i, item) in items.iter().enumerate() {
                        next.push((format!("{}[{}]", child_path, i), item));
                    }
                }
            } else {
                next.push((child_path, child));
            }
        }
        current = next;
    }
    current
}

/// `YYYY-MM-DDTHH:MM:SS.mmmZ`, exactly three fractional digits.
pub fn is_iso_millis_utc(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 24 || bytes[19] != b'.' || bytes[23] != b'Z' {
        return false;
    }
    if !bytes[20..23].iter().all(u8::is_ascii_digit) {
        return false;
    }
    NaiveDateTime::parse_from_str(&s[..19], "%Y-%m-%dT%H:%M:%S").is_ok()
}

/// Hyphenated 8-4-4-4-12 hex form only.
pub fn is_canonical_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 36
        && [8, 13, 18, 23].iter().all(|&i| bytes[i] == b'-')
        && Uuid::try_parse(s).is_ok()
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Numeric values compare by value so `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn expect(ok: bool, kind: &str, value: &Value, path: &str, errors: &mut Vec<String>) {
    if !ok {
        errors.push(format!(
            "field '{}': expected {}, got {}",
            path,
            kind,
            type_name(value)
        ));
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_schema() -> SchemaNode {
        SchemaNode::parse(&json!({
            "type": "[RED, WHITE, BLUE]",
            "orderType": "PRODUCTION",
            "timestamp": "<datetime>",
            "erpOrderId?": "<string>",
            "actions": [{"actionId": "<uuid>", "count": "<integer>"}]
        }))
        .unwrap()
    }

    fn errors_for(schema: &SchemaNode, value: Value) -> Vec<String> {
        let mut errors = Vec::new();
        schema.check(&value, "", &mut errors);
        errors
    }

    #[test]
    fn accepts_conforming_payload() {
        let errors = errors_for(
            &order_schema(),
            json!({
                "type": "BLUE",
                "orderType": "PRODUCTION",
                "timestamp": "2026-02-24T08:00:00.000Z",
                "actions": [{"actionId": "12345678-1234-1234-1234-123456789abc", "count": 2}]
            }),
        );
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn errors_name_the_field() {
        let errors = errors_for(
            &order_schema(),
            json!({
                "type": "PURPLE",
                "orderType": "STORAGE",
                "timestamp": "2026-02-24T08:00:00Z",
                "actions": [{"actionId": "1234", "count": 1.5}]
            }),
        );
        assert_eq!(errors.len(), 5, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("'actions[0].actionId'")));
        assert!(errors.iter().any(|e| e.contains("'actions[0].count'")));
        assert!(errors.iter().any(|e| e.contains("'type'")));
        assert!(errors.iter().any(|e| e.contains("'orderType'")));
        assert!(errors.iter().any(|e| e.contains("'timestamp'")));
    }

    #[test]
    fn optional_fields_may_be_missing_required_may_not() {
        let errors = errors_for(&order_schema(), json!({"type": "RED"}));
        assert!(errors.contains(&"missing required field 'orderType'".to_string()));
        assert!(!errors.iter().any(|e| e.contains("erpOrderId")));
    }

    #[test]
    fn datetime_requires_millis_and_z() {
        assert!(is_iso_millis_utc("2025-01-27T12:00:00.000Z"));
        assert!(!is_iso_millis_utc("2025-01-27T12:00:00.000+00:00"));
        assert!(!is_iso_millis_utc("2025-01-27T12:00:00.00Z"));
        assert!(!is_iso_millis_utc("2025-13-27T12:00:00.000Z"));
    }

    #[test]
    fn uuid_must_be_hyphenated() {
        assert!(is_canonical_uuid("12345678-1234-1234-1234-123456789abc"));
        assert!(!is_canonical_uuid("12345678123412341234123456789abc"));
        assert!(!is_canonical_uuid("12345678-1234-1234-1234-123456789abz"));
    }

    #[test]
    fn rules_resolve_array_paths() {
        let rule = Rule {
            field: "actions[].actionType".into(),
            check: RuleCheck::OneOf,
            value: Some(json!(["findInitialDockPosition", "cancelOrder"])),
        };
        rule.verify().unwrap();
        let mut errors = Vec::new();
        rule.apply(
            &json!({"actions": [{"actionType": "cancelOrder"}, {"actionType": "jump"}]}),
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("field 'actions[1].actionType'"));
    }

    #[test]
    fn numeric_and_length_rules() {
        let payload = json!({"orderUpdateId": 0, "actions": [], "serialNumber": ""});
        let rules = [
            Rule { field: "orderUpdateId".into(), check: RuleCheck::Min, value: Some(json!(1)) },
            Rule { field: "actions".into(), check: RuleCheck::MinItems, value: Some(json!(1)) },
            Rule { field: "serialNumber".into(), check: RuleCheck::NonEmpty, value: None },
            Rule { field: "missing".into(), check: RuleCheck::NonEmpty, value: None },
            Rule { field: "orderUpdateId".into(), check: RuleCheck::Max, value: Some(json!(10)) },
        ];
        let mut errors = Vec::new();
        for rule in &rules {
            rule.apply(&payload, &mut errors);
        }
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }

    #[test]
    fn rule_without_value_is_rejected() {
        let rule = Rule { field: "x".into(), check: RuleCheck::Prefix, value: None };
        assert!(rule.verify().is_err());
    }

    #[test]
    fn describe_round_trips_notation() {
        let raw = json!({"a?": "<uuid>", "b": ["<string>"], "c": "[X, Y]"});
        assert_eq!(SchemaNode::parse(&raw).unwrap().describe(), raw);
    }
}
