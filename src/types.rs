//! Field declarations, record values and type inference
//!
//! Column types are carried as engine type names (`text`, `int4`, `_text`,
//! `nested`, ...). Callers may say `json`; it is stored as the `nested`
//! composite and reported back as `json`.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Composite type used for JSON-like columns
pub const NESTED_TYPE: &str = "nested";

/// Caller-facing name of the nested type
pub const JSON_TYPE: &str = "json";

/// Type reported for the `_id` system column
pub const ID_TYPE: &str = "int";

/// Patterns tried, in order, when guessing whether a string is a timestamp
pub const DATE_FORMATS: [&str; 8] = [
    "%Y-%m-%d",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%m-%d-%Y",
];

/// A column declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Column name
    pub id: String,

    /// Engine type name; guessed from the first record when absent
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,

    /// Free-form metadata persisted in the column comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<JsonValue>,
}

impl Field {
    /// A field whose type will be guessed
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            field_type: None,
            info: None,
        }
    }

    /// A field with an explicit type
    pub fn typed(id: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            field_type: Some(field_type.into()),
            info: None,
        }
    }

    pub fn with_info(mut self, info: JsonValue) -> Self {
        self.info = Some(info);
        self
    }

    /// Declared type, or an empty string when it still has to be guessed
    pub fn type_name(&self) -> &str {
        self.field_type.as_deref().unwrap_or("")
    }

    /// Map a caller-facing `json` type onto the stored `nested` type
    pub(crate) fn into_storage(mut self) -> Self {
        if self.field_type.as_deref() == Some(JSON_TYPE) {
            self.field_type = Some(NESTED_TYPE.to_string());
        }
        self
    }

    /// Map the stored `nested` type back to `json`
    pub(crate) fn into_display(mut self) -> Self {
        if self.field_type.as_deref() == Some(NESTED_TYPE) {
            self.field_type = Some(JSON_TYPE.to_string());
        }
        self
    }
}

/// Ordered column name → type mapping for a resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTypes {
    entries: Vec<(String, String)>,
}

impl FieldTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from live fields, prepending the `_id` system column
    pub fn with_id(fields: &[Field]) -> Self {
        let mut types = Self::new();
        types.insert("_id", ID_TYPE);
        for field in fields {
            types.insert(&field.id, field.type_name());
        }
        types
    }

    /// Insert or replace, keeping the original position on replace
    pub fn insert(&mut self, id: &str, type_name: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == id) {
            Some(entry) => entry.1 = type_name.to_string(),
            None => self.entries.push((id.to_string(), type_name.to_string())),
        }
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == id)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether the engine type name denotes an array (`_int4` or `int4[]`)
pub fn is_array_type(type_name: &str) -> bool {
    type_name.starts_with('_') || type_name.ends_with("[]")
}

/// Element type of an array type name
pub fn array_element_type(type_name: &str) -> &str {
    type_name
        .strip_prefix('_')
        .or_else(|| type_name.strip_suffix("[]"))
        .unwrap_or(type_name)
}

pub fn is_nested_type(type_name: &str) -> bool {
    type_name.eq_ignore_ascii_case(NESTED_TYPE)
}

/// Guess a column type from a sample value.
///
/// Structural values first, then JSON numbers, then numeric strings, then
/// the fixed date patterns, with `text` as the fallback.
pub fn guess_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Object(_) | JsonValue::Array(_) => "nested",
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => "int",
        JsonValue::Number(_) => "float",
        JsonValue::Bool(_) => "bool",
        JsonValue::String(s) => guess_string_type(s),
        JsonValue::Null => "text",
    }
}

fn guess_string_type(s: &str) -> &'static str {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix(['+', '-']).unwrap_or(trimmed);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return "integer";
    }
    if trimmed.parse::<f64>().is_ok() {
        return "numeric";
    }
    if parse_timestamp(s).is_some() {
        return "timestamp";
    }
    "text"
}

/// Parse a string with the first matching pattern in [`DATE_FORMATS`]
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    DATE_FORMATS.iter().find_map(|format| {
        if format.contains("%H") {
            NaiveDateTime::parse_from_str(s, format).ok()
        } else {
            NaiveDate::parse_from_str(s, format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        }
    })
}

/// A record value, typed against its target column
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Nested(JsonValue),
    Array(Vec<Value>),
}

impl Value {
    /// Convert a wire value without column context
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::Text(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(_) => Value::Nested(value.clone()),
        }
    }

    /// Convert a wire value destined for a column of `type_name`.
    ///
    /// Nested columns take any JSON shape and empty strings become null on
    /// non-text columns. Other strings, timestamps included, go to the
    /// engine unchanged so its own date parsing and offsets apply.
    pub fn for_column(value: &JsonValue, type_name: &str) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            _ if is_nested_type(type_name) => Value::Nested(value.clone()),
            JsonValue::String(s) if s.is_empty() && type_name != "text" => Value::Null,
            JsonValue::Array(items) if is_array_type(type_name) => {
                let element = array_element_type(type_name);
                Value::Array(items.iter().map(|v| Value::for_column(v, element)).collect())
            }
            JsonValue::Object(_) => Value::Text(value.to_string()),
            _ => Value::from_json(value),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Timestamp(ts) => JsonValue::String(format_timestamp(ts)),
            Value::Nested(v) => v.clone(),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    /// Text form accepted by the engine's input function for the target type.
    ///
    /// Returns `None` for SQL NULL.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(format_float(*f)),
            Value::Text(s) => Some(s.clone()),
            Value::Timestamp(ts) => Some(format_timestamp(ts)),
            Value::Nested(v) => Some(format!("({},\"\")", quote_element(&v.to_string()))),
            Value::Array(items) => Some(array_literal(items)),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        f.to_string()
    }
}

fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Double-quote an element of an array or composite literal
fn quote_element(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn array_literal(items: &[Value]) -> String {
    let elements: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Array(inner) => array_literal(inner),
            other => quote_element(&other.to_sql_text().unwrap_or_default()),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}
