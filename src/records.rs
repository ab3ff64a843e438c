//! Record-level request and response types
//!
//! Writes (insert/update/upsert), searches, SQL passthrough results and
//! filtered deletes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::types::Field;

/// How `upsert` treats each record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMethod {
    /// Append every record
    Insert,
    /// Modify existing rows located by `_id` or the unique key
    Update,
    /// Update, then insert when no row matched
    #[default]
    Upsert,
}

/// Request to write records into an existing resource
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertRequest {
    pub resource_id: String,
    #[serde(default)]
    pub method: WriteMethod,
    #[serde(default)]
    pub records: Vec<JsonValue>,
    /// Run every statement, then roll back
    #[serde(default)]
    pub dry_run: bool,
}

impl UpsertRequest {
    pub fn new(resource_id: impl Into<String>, method: WriteMethod) -> Self {
        Self {
            resource_id: resource_id.into(),
            method,
            ..Default::default()
        }
    }

    pub fn records(mut self, records: Vec<JsonValue>) -> Self {
        self.records = records;
        self
    }

    pub fn record(mut self, record: JsonValue) -> Self {
        self.records.push(record);
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }
}

/// Echo of a write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertResult {
    pub resource_id: String,
    pub method: WriteMethod,
    pub records: Vec<JsonValue>,
    pub dry_run: bool,
}

/// Free-text query: either one string against `_full_text`, or one string
/// per column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextQuery {
    Text(String),
    Fields(BTreeMap<String, String>),
}

impl TextQuery {
    pub fn is_empty(&self) -> bool {
        match self {
            TextQuery::Text(s) => s.is_empty(),
            TextQuery::Fields(map) => map.is_empty(),
        }
    }
}

/// Output encoding of search records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordsFormat {
    /// One JSON object per row
    #[default]
    Objects,
    /// One JSON array per row
    Lists,
    Csv,
    Tsv,
}

fn default_true() -> bool {
    true
}

/// Search request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub resource_id: String,

    /// Columns to return; all when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,

    /// Exact-match filters; list values match any element
    #[serde(default)]
    pub filters: Map<String, JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<TextQuery>,

    /// Search `_full_text` independently of `q`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,

    /// `plainto_tsquery` when true, `to_tsquery` otherwise
    #[serde(default = "default_true")]
    pub plain: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Sort clauses such as `name desc` or `"My Field" asc nulls last`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,

    #[serde(default)]
    pub offset: i64,

    #[serde(default)]
    pub distinct: bool,

    #[serde(default)]
    pub records_format: RecordsFormat,

    #[serde(default = "default_true")]
    pub include_total: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_estimation_threshold: Option<i64>,

    /// URL of the incoming request, used to build `_links`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links_base: Option<String>,
}

impl SearchRequest {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            fields: None,
            filters: Map::new(),
            q: None,
            full_text: None,
            plain: true,
            language: None,
            sort: None,
            limit: None,
            offset: 0,
            distinct: false,
            records_format: RecordsFormat::Objects,
            include_total: true,
            total_estimation_threshold: None,
            links_base: None,
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn q(mut self, text: impl Into<String>) -> Self {
        self.q = Some(TextQuery::Text(text.into()));
        self
    }

    pub fn q_field(mut self, field: impl Into<String>, text: impl Into<String>) -> Self {
        match &mut self.q {
            Some(TextQuery::Fields(map)) => {
                map.insert(field.into(), text.into());
            }
            _ => {
                let mut map = BTreeMap::new();
                map.insert(field.into(), text.into());
                self.q = Some(TextQuery::Fields(map));
            }
        }
        self
    }

    pub fn full_text(mut self, text: impl Into<String>) -> Self {
        self.full_text = Some(text.into());
        self
    }

    pub fn plain(mut self, plain: bool) -> Self {
        self.plain = plain;
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn sort<I, S>(mut self, clauses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = Some(clauses.into_iter().map(Into::into).collect());
        self
    }

    /// Comma-separated sort clauses, e.g. `"name desc, age"`
    pub fn sort_str(self, clauses: &str) -> Self {
        let parts: Vec<String> = clauses
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.sort(parts)
    }

    /// Set limit and offset
    pub fn paginate(mut self, offset: i64, limit: i64) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn distinct(mut self, enabled: bool) -> Self {
        self.distinct = enabled;
        self
    }

    pub fn records_format(mut self, format: RecordsFormat) -> Self {
        self.records_format = format;
        self
    }

    pub fn include_total(mut self, enabled: bool) -> Self {
        self.include_total = enabled;
        self
    }

    pub fn total_estimation_threshold(mut self, threshold: i64) -> Self {
        self.total_estimation_threshold = Some(threshold);
        self
    }

    pub fn links_base(mut self, url: impl Into<String>) -> Self {
        self.links_base = Some(url.into());
        self
    }
}

/// Records in the requested encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Records {
    Objects(Vec<Map<String, JsonValue>>),
    Lists(Vec<Vec<JsonValue>>),
    /// CSV or TSV text without a header row
    Delimited(String),
}

impl Records {
    /// Number of records; delimited output counts lines
    pub fn len(&self) -> usize {
        match self {
            Records::Objects(rows) => rows.len(),
            Records::Lists(rows) => rows.len(),
            Records::Delimited(text) => text.lines().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_objects(&self) -> Option<&[Map<String, JsonValue>]> {
        match self {
            Records::Objects(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Pagination links
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
}

/// Result of `search` and `search_sql`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub fields: Vec<Field>,
    pub records: Records,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_was_estimated: Option<bool>,
    /// Set by `search_sql` when the row cap cut the result short
    #[serde(default)]
    pub records_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
    #[serde(rename = "_links", default)]
    pub links: Links,
}

/// Request to drop a resource or delete some of its rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub resource_id: String,
    /// Absent: drop the table. Present (even empty): delete matching rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Map<String, JsonValue>>,
}

impl DeleteRequest {
    /// Drop the whole resource
    pub fn drop(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            filters: None,
        }
    }

    /// Delete rows matching `filters`
    pub fn rows(resource_id: impl Into<String>, filters: Map<String, JsonValue>) -> Self {
        Self {
            resource_id: resource_id.into(),
            filters: Some(filters),
        }
    }
}

/// Result of `delete`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResult {
    pub resource_id: String,
    /// Rows removed by a filtered delete; `None` when the table was dropped
    pub rows_deleted: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_search_defaults_from_json() {
        let request: SearchRequest = serde_json::from_value(json!({"resource_id": "r"})).unwrap();
        assert!(request.plain);
        assert!(request.include_total);
        assert_eq!(request.offset, 0);
        assert_eq!(request.records_format, RecordsFormat::Objects);
        assert!(request.limit.is_none());
    }

    #[test]
    fn test_text_query_untagged() {
        let request: SearchRequest =
            serde_json::from_value(json!({"resource_id": "r", "q": "water"})).unwrap();
        assert_eq!(request.q, Some(TextQuery::Text("water".to_string())));

        let request: SearchRequest =
            serde_json::from_value(json!({"resource_id": "r", "q": {"name": "bob"}})).unwrap();
        assert!(matches!(request.q, Some(TextQuery::Fields(ref m)) if m["name"] == "bob"));
    }

    #[test]
    fn test_search_builder() {
        let request = SearchRequest::new("r")
            .fields(["a", "b"])
            .filter("a", 1)
            .q_field("a", "x")
            .q_field("b", "y")
            .sort_str("a desc, b")
            .paginate(10, 5)
            .records_format(RecordsFormat::Csv);

        assert_eq!(request.fields.as_ref().map(Vec::len), Some(2));
        assert_eq!(request.filters["a"], json!(1));
        assert!(matches!(request.q, Some(TextQuery::Fields(ref m)) if m.len() == 2));
        assert_eq!(request.sort, Some(vec!["a desc".to_string(), "b".to_string()]));
        assert_eq!(request.offset, 10);
        assert_eq!(request.limit, Some(5));
    }

    #[test]
    fn test_write_method_serde() {
        let request: UpsertRequest =
            serde_json::from_value(json!({"resource_id": "r", "method": "insert"})).unwrap();
        assert_eq!(request.method, WriteMethod::Insert);
        let request: UpsertRequest = serde_json::from_value(json!({"resource_id": "r"})).unwrap();
        assert_eq!(request.method, WriteMethod::Upsert);
    }

    #[test]
    fn test_records_len() {
        assert_eq!(Records::Delimited("1,a\n2,b\n".to_string()).len(), 2);
        assert!(Records::Objects(vec![]).is_empty());
    }

    #[test]
    fn test_links_serialize_under_underscore_key() {
        let result = SearchResult {
            resource_id: Some("r".to_string()),
            fields: vec![],
            records: Records::Objects(vec![]),
            total: Some(0),
            total_was_estimated: Some(false),
            records_truncated: false,
            limit: Some(100),
            offset: 0,
            links: Links {
                start: Some("?limit=100".to_string()),
                next: None,
                prev: None,
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["_links"]["start"], "?limit=100");
    }

    #[test]
    fn test_delete_request_modes() {
        assert!(DeleteRequest::drop("r").filters.is_none());
        assert!(DeleteRequest::rows("r", Map::new()).filters.is_some());
    }
}
