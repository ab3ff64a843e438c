//! Extension points
//!
//! [`DatastorePlugin`] lets other code validate requests and contribute
//! WHERE/SELECT/ORDER BY fragments to searches and filtered deletes. The
//! built-in compiler is itself a plugin and always runs first; registered
//! plugins follow in registration order.
//!
//! [`FieldPolicy`] decides which names are acceptable and which column types
//! get full-text indexes. [`AccessCheck`] authorizes the tables a
//! `search_sql` statement touches.

use crate::config::StoreConfig;
use crate::error::{DatastoreError, Result};
use crate::records::{DeleteRequest, SearchRequest, TextQuery};
use crate::sql::query::{
    QueryParts, filter_clauses, select_columns, sort_clauses, sort_expression,
    text_search_clauses, textsearch_query,
};
use crate::sql::sanitize;
use crate::types::FieldTypes;

/// Request handed to [`DatastorePlugin::validate`]
#[derive(Debug, Clone, Copy)]
pub enum RequestRef<'a> {
    Search(&'a SearchRequest),
    Delete(&'a DeleteRequest),
}

/// Hooks invoked around searches and filtered deletes.
///
/// Every method has a no-op default, so implementors override only what
/// they need.
pub trait DatastorePlugin: Send + Sync {
    /// Reject a request before any SQL is built
    fn validate(&self, _request: RequestRef<'_>, _types: &FieldTypes) -> Result<()> {
        Ok(())
    }

    /// Add fragments to a search.
    ///
    /// Values must go through `parts.params` so they are bound (or escaped
    /// for COPY) like the built-in filters.
    fn contribute_search(
        &self,
        _request: &SearchRequest,
        _types: &FieldTypes,
        _parts: &mut QueryParts,
    ) -> Result<()> {
        Ok(())
    }

    /// Add WHERE fragments to a filtered delete
    fn contribute_delete(
        &self,
        _request: &DeleteRequest,
        _types: &FieldTypes,
        _parts: &mut QueryParts,
    ) -> Result<()> {
        Ok(())
    }
}

/// Name and indexing rules
pub trait FieldPolicy: Send + Sync {
    fn is_valid_field_name(&self, name: &str) -> bool {
        sanitize::is_valid_field_name(name)
    }

    fn is_valid_table_name(&self, name: &str) -> bool {
        sanitize::is_valid_table_name(name)
    }

    /// Whether columns of this type get their own full-text index
    fn should_fts_index_field_type(&self, type_name: &str) -> bool {
        matches!(
            type_name.to_ascii_lowercase().as_str(),
            "tsvector" | "text" | "number"
        )
    }
}

/// The stock [`FieldPolicy`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFieldPolicy;

impl FieldPolicy for DefaultFieldPolicy {}

/// Authorization of tables referenced by passthrough SQL
pub trait AccessCheck: Send + Sync {
    fn check_table_access(&self, tables: &[String]) -> Result<()>;
}

impl<F> AccessCheck for F
where
    F: Fn(&[String]) -> Result<()> + Send + Sync,
{
    fn check_table_access(&self, tables: &[String]) -> Result<()> {
        self(tables)
    }
}

/// Permits every table
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn check_table_access(&self, _tables: &[String]) -> Result<()> {
        Ok(())
    }
}

/// The built-in search compiler
pub(crate) struct CoreSearch<'a> {
    config: &'a StoreConfig,
    policy: &'a dyn FieldPolicy,
}

impl<'a> CoreSearch<'a> {
    pub(crate) fn new(config: &'a StoreConfig, policy: &'a dyn FieldPolicy) -> Self {
        Self { config, policy }
    }

    fn language<'r>(&'r self, request: &'r SearchRequest) -> &'r str {
        request
            .language
            .as_deref()
            .unwrap_or(&self.config.default_fts_lang)
    }

    fn validate_search(&self, request: &SearchRequest, types: &FieldTypes) -> Result<()> {
        let (_, ranks) = textsearch_query(
            self.language(request),
            request.q.as_ref(),
            request.plain,
            request.full_text.as_deref(),
        );
        let is_rank = |id: &str| ranks.iter().any(|(alias, _)| alias == id);

        if let Some(fields) = &request.fields {
            if let Some(unknown) = fields.iter().find(|f| !types.contains(f) && !is_rank(f)) {
                return Err(invalid("fields", unknown));
            }
        }

        validate_filters(request.filters.keys(), types)?;

        if let Some(TextQuery::Fields(map)) = &request.q {
            if let Some(unknown) = map.keys().find(|f| !types.contains(f)) {
                return Err(invalid("q", unknown));
            }
        }

        if let Some(sort) = &request.sort {
            for clause in sort {
                if sort_expression(clause, types, &ranks).is_none() {
                    return Err(invalid("sort", clause));
                }
            }
        }

        if request.limit.is_some_and(|l| l < 0) {
            return Err(DatastoreError::validation(
                "limit",
                "Must be a natural number",
            ));
        }
        if request.offset < 0 {
            return Err(DatastoreError::validation(
                "offset",
                "Must be a natural number",
            ));
        }
        Ok(())
    }
}

impl DatastorePlugin for CoreSearch<'_> {
    fn validate(&self, request: RequestRef<'_>, types: &FieldTypes) -> Result<()> {
        match request {
            RequestRef::Search(search) => self.validate_search(search, types),
            RequestRef::Delete(delete) => match &delete.filters {
                Some(filters) => validate_filters(filters.keys(), types),
                None => Ok(()),
            },
        }
    }

    fn contribute_search(
        &self,
        request: &SearchRequest,
        types: &FieldTypes,
        parts: &mut QueryParts,
    ) -> Result<()> {
        let lang = self.language(request);
        let (ts_query, ranks) = textsearch_query(
            lang,
            request.q.as_ref(),
            request.plain,
            request.full_text.as_deref(),
        );

        let field_ids: Vec<&str> = match &request.fields {
            Some(fields) => fields.iter().map(String::as_str).collect(),
            None => types
                .ids()
                .chain(ranks.iter().map(|(alias, _)| alias.as_str()))
                .collect(),
        };

        parts.select.extend(select_columns(
            field_ids,
            types,
            &ranks,
            request.records_format,
            self.config.ms_in_timestamp,
        ));
        parts.where_clauses.extend(filter_clauses(&request.filters, types, &mut parts.params));
        parts.where_clauses.extend(text_search_clauses(
            request.q.as_ref(),
            request.full_text.as_deref(),
            lang,
            types,
            self.policy,
        ));
        parts
            .sort
            .extend(sort_clauses(request.sort.as_deref(), types, &ranks));
        parts.ts_query = ts_query;
        parts.distinct = request.distinct;
        parts.limit = request
            .limit
            .unwrap_or(self.config.default_limit)
            .min(self.config.rows_max);
        parts.offset = request.offset;
        parts.rank_columns = ranks;
        Ok(())
    }

    fn contribute_delete(
        &self,
        request: &DeleteRequest,
        types: &FieldTypes,
        parts: &mut QueryParts,
    ) -> Result<()> {
        if let Some(filters) = &request.filters {
            parts
                .where_clauses
                .extend(filter_clauses(filters, types, &mut parts.params));
        }
        Ok(())
    }
}

fn validate_filters<'k, I>(keys: I, types: &FieldTypes) -> Result<()>
where
    I: IntoIterator<Item = &'k String>,
{
    for key in keys {
        if !types.contains(key) {
            return Err(invalid("filters", key));
        }
    }
    Ok(())
}

fn invalid(key: &str, value: &str) -> DatastoreError {
    DatastoreError::validation(key, format!("invalid value \"{}\"", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordsFormat;
    use crate::sql::query::ParamStyle;
    use crate::types::Field;
    use serde_json::{Map, json};

    fn config() -> StoreConfig {
        StoreConfig::builder("postgres://w", "postgres://r")
            .default_limit(50)
            .rows_max(500)
            .build()
    }

    fn types() -> FieldTypes {
        FieldTypes::with_id(&[Field::typed("name", "text"), Field::typed("age", "int4")])
    }

    // =========================================================================
    // FieldPolicy / AccessCheck Tests
    // =========================================================================

    #[test]
    fn test_default_policy() {
        let policy = DefaultFieldPolicy;
        assert!(policy.should_fts_index_field_type("TEXT"));
        assert!(policy.should_fts_index_field_type("tsvector"));
        assert!(!policy.should_fts_index_field_type("int4"));
        assert!(policy.is_valid_field_name("name"));
        assert!(!policy.is_valid_field_name("_hidden"));
        assert!(!policy.is_valid_table_name("50%"));
    }

    #[test]
    fn test_closure_access_check() {
        let check = |tables: &[String]| -> Result<()> {
            if tables.iter().any(|t| t == "secret") {
                Err(DatastoreError::not_authorized("no"))
            } else {
                Ok(())
            }
        };
        assert!(check.check_table_access(&["public".to_string()]).is_ok());
        assert!(check.check_table_access(&["secret".to_string()]).is_err());
        assert!(AllowAll.check_table_access(&["secret".to_string()]).is_ok());
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validate_accepts_known_names() {
        let config = config();
        let core = CoreSearch::new(&config, &DefaultFieldPolicy);
        let request = SearchRequest::new("r")
            .fields(["name", "rank"])
            .filter("age", 3)
            .q("bob")
            .sort(["rank desc", "name"]);
        assert!(core.validate(RequestRef::Search(&request), &types()).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_names() {
        let config = config();
        let core = CoreSearch::new(&config, &DefaultFieldPolicy);

        let cases = [
            (SearchRequest::new("r").fields(["nope"]), "fields"),
            (SearchRequest::new("r").filter("nope", 1), "filters"),
            (SearchRequest::new("r").q_field("nope", "x"), "q"),
            (SearchRequest::new("r").sort(["nope desc"]), "sort"),
            (SearchRequest::new("r").paginate(-1, 10), "offset"),
            (SearchRequest::new("r").paginate(0, -10), "limit"),
        ];
        for (request, key) in cases {
            let err = core.validate(RequestRef::Search(&request), &types()).unwrap_err();
            assert_eq!(err.key(), Some(key));
        }
    }

    #[test]
    fn test_validate_delete_filters() {
        let config = config();
        let core = CoreSearch::new(&config, &DefaultFieldPolicy);
        let mut filters = Map::new();
        filters.insert("nope".to_string(), json!(1));
        let request = DeleteRequest::rows("r", filters);
        let err = core.validate(RequestRef::Delete(&request), &types()).unwrap_err();
        assert_eq!(err.key(), Some("filters"));
        assert!(core.validate(RequestRef::Delete(&DeleteRequest::drop("r")), &types()).is_ok());
    }

    // =========================================================================
    // Contribution Tests
    // =========================================================================

    #[test]
    fn test_contribute_search_defaults() {
        let config = config();
        let core = CoreSearch::new(&config, &DefaultFieldPolicy);
        let mut parts = QueryParts::new(ParamStyle::Bound);
        core.contribute_search(&SearchRequest::new("r"), &types(), &mut parts)
            .unwrap();

        assert_eq!(parts.select.len(), 3);
        assert_eq!(parts.limit, 50);
        assert!(parts.where_clauses.is_empty());
        assert!(parts.sort.is_empty());
    }

    #[test]
    fn test_contribute_search_caps_limit_and_adds_rank() {
        let config = config();
        let core = CoreSearch::new(&config, &DefaultFieldPolicy);
        let request = SearchRequest::new("r")
            .q("bob")
            .paginate(0, 10_000)
            .records_format(RecordsFormat::Objects);
        let mut parts = QueryParts::new(ParamStyle::Bound);
        core.contribute_search(&request, &types(), &mut parts).unwrap();

        assert_eq!(parts.limit, 500);
        assert_eq!(parts.select.len(), 4);
        assert!(parts.select[3].ends_with("AS \"rank\""));
        assert_eq!(parts.sort, vec!["ts_rank(_full_text, \"query\", 32) DESC".to_string()]);
        assert_eq!(parts.where_clauses, vec!["_full_text @@ \"query\"".to_string()]);
        assert!(matches!(request.q, Some(TextQuery::Text(_))));
    }

    struct OnlyAdults;

    impl DatastorePlugin for OnlyAdults {
        fn contribute_search(
            &self,
            _request: &SearchRequest,
            _types: &FieldTypes,
            parts: &mut QueryParts,
        ) -> Result<()> {
            let placeholder = parts.params.push(Some("18".to_string()), "int4");
            parts.where_clauses.push(format!("\"age\" >= {}", placeholder));
            Ok(())
        }
    }

    #[test]
    fn test_plugin_placeholders_follow_core() {
        let config = config();
        let core = CoreSearch::new(&config, &DefaultFieldPolicy);
        let request = SearchRequest::new("r").filter("name", "bob");
        let mut parts = QueryParts::new(ParamStyle::Bound);
        let plugins: [&dyn DatastorePlugin; 2] = [&core, &OnlyAdults];
        for plugin in plugins {
            plugin.contribute_search(&request, &types(), &mut parts).unwrap();
        }
        assert_eq!(parts.where_clauses[1], "\"age\" >= CAST($2 AS int4)");
        assert_eq!(parts.params.len(), 2);
    }
}
