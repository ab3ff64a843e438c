//! Resource definition types
//!
//! Requests and responses for creating, altering and describing resources.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::types::Field;

/// A trigger to attach to a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Name of an existing trigger function
    pub function: String,
}

/// Request to create a resource, or extend an existing one
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    pub resource_id: String,

    #[serde(default)]
    pub fields: Vec<Field>,

    /// Records to insert; the first also drives type guessing
    #[serde(default)]
    pub records: Vec<JsonValue>,

    /// Secondary indexes, each a list of field ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Vec<Vec<String>>>,

    /// Unique key used by update/upsert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Vec<TriggerSpec>>,

    /// Replaces every existing alias when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,

    /// Drop live columns missing from `fields`
    #[serde(default)]
    pub delete_fields: bool,

    /// Text search configuration for the full-text indexes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Extra column-comment data keyed by position in `fields`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_data: BTreeMap<usize, Map<String, JsonValue>>,
}

impl CreateRequest {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            ..Default::default()
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    pub fn records(mut self, records: Vec<JsonValue>) -> Self {
        self.records = records;
        self
    }

    /// Add a secondary index over `fields`
    pub fn index<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes
            .get_or_insert_with(Vec::new)
            .push(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn primary_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn trigger(mut self, function: impl Into<String>) -> Self {
        self.triggers.get_or_insert_with(Vec::new).push(TriggerSpec {
            function: function.into(),
        });
        self
    }

    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = Some(aliases.into_iter().map(Into::into).collect());
        self
    }

    pub fn delete_fields(mut self, enabled: bool) -> Self {
        self.delete_fields = enabled;
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Attach extra column-comment data to the field at `position`
    pub fn plugin_data(mut self, position: usize, data: Map<String, JsonValue>) -> Self {
        self.plugin_data.insert(position, data);
        self
    }
}

/// Index names touched by one `create_indexes` pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexChanges {
    pub created: Vec<String>,
    pub dropped: Vec<String>,
}

impl IndexChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.dropped.is_empty()
    }
}

/// Result of `create`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource_id: String,
    /// Live fields after the call, `nested` reported as `json`
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Vec<Vec<String>>>,
    pub aliases: Vec<String>,
    pub records_written: usize,
    pub index_changes: IndexChanges,
}

/// Argument of a trigger function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionArg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argmode: Option<ArgMode>,
    pub argname: String,
    pub argtype: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgMode {
    In,
    Out,
    InOut,
}

impl ArgMode {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ArgMode::In => "IN",
            ArgMode::Out => "OUT",
            ArgMode::InOut => "INOUT",
        }
    }
}

/// Request to create a plpgsql function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<FunctionArg>,
    pub rettype: String,
    /// Function body, without the surrounding dollar quoting
    pub definition: String,
    #[serde(default)]
    pub or_replace: bool,
}

impl FunctionDefinition {
    /// A trigger function with no arguments
    pub fn trigger(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            rettype: "trigger".to_string(),
            definition: definition.into(),
            or_replace: false,
        }
    }

    pub fn or_replace(mut self, enabled: bool) -> Self {
        self.or_replace = enabled;
        self
    }
}

/// Table-level statistics returned by `resource_fields`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub id: String,
    pub count: i64,
    pub table_type: String,
    pub size: i64,
    pub db_size: i64,
    pub idx_size: i64,
    pub aliases: Vec<String>,
}

/// Physical column details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub native_type: String,
    pub notnull: bool,
    pub index_name: Option<String>,
    pub is_index: bool,
    pub uniquekey: bool,
}

/// One field in a `resource_fields` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescription {
    pub id: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ColumnSchema>,
}

/// Response of `resource_fields`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResourceMeta>,
    pub fields: Vec<FieldDescription>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_request_builder() {
        let request = CreateRequest::new("res")
            .field(Field::typed("name", "text"))
            .field(Field::new("age"))
            .records(vec![json!({"name": "a", "age": 3})])
            .index(["name"])
            .index(["name", "age"])
            .primary_key(["name"])
            .trigger("audit")
            .aliases(["people"])
            .delete_fields(true);

        assert_eq!(request.fields.len(), 2);
        assert_eq!(request.indexes.as_ref().map(Vec::len), Some(2));
        assert_eq!(request.primary_key, Some(vec!["name".to_string()]));
        assert_eq!(request.triggers.as_ref().map(|t| t[0].function.as_str()), Some("audit"));
        assert_eq!(request.aliases, Some(vec!["people".to_string()]));
        assert!(request.delete_fields);
    }

    #[test]
    fn test_create_request_from_json() {
        let request: CreateRequest = serde_json::from_value(json!({
            "resource_id": "res",
            "fields": [{"id": "doc", "type": "json", "info": {"label": "Doc"}}],
            "primary_key": ["doc"],
            "triggers": [{"function": "audit"}]
        }))
        .unwrap();

        assert_eq!(request.fields[0].type_name(), "json");
        assert!(request.records.is_empty());
        assert!(request.aliases.is_none());
        assert!(!request.delete_fields);
    }

    #[test]
    fn test_index_changes_empty() {
        assert!(IndexChanges::default().is_empty());
        let changes = IndexChanges {
            created: vec!["abc".to_string()],
            dropped: vec![],
        };
        assert!(!changes.is_empty());
    }

    #[test]
    fn test_arg_mode_sql() {
        let arg: FunctionArg =
            serde_json::from_value(json!({"argmode": "inout", "argname": "x", "argtype": "int4"}))
                .unwrap();
        assert_eq!(arg.argmode.map(|m| m.as_sql()), Some("INOUT"));
    }
}
