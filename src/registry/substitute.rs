//! `{{name}}` token substitution for topic strings and payload trees.

use serde_json::Value;
use std::collections::BTreeMap;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Named values for placeholder substitution. Names are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarContext {
    vars: BTreeMap<String, String>,
}

impl VarContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for VarContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut ctx = VarContext::new();
        for (k, v) in iter {
            ctx.set(k, v);
        }
        ctx
    }
}

/// Replaces every known `{{name}}` token. Unknown tokens and an
/// unterminated `{{` are kept as written.
pub fn substitute_str(template: &str, ctx: &VarContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            out.push_str(&rest[start..]);
            return out;
        };

        let name = &after_open[..end];
        match ctx.get(name) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str(OPEN);
                out.push_str(name);
                out.push_str(CLOSE);
            }
        }
        rest = &after_open[end + CLOSE.len()..];
    }
    out.push_str(rest);
    out
}

/// Substitutes inside every string value, recursing into objects and
/// arrays. Object keys are left alone.
pub fn substitute_value(value: &Value, ctx: &VarContext) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Names of all terminated `{{name}}` tokens, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        names.push(after_open[..end].to_string());
        rest = &after_open[end + CLOSE.len()..];
    }
    names
}
