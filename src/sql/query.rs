//! Search query compilation
//!
//! Builds WHERE/SELECT/ORDER BY fragments from a search request and renders
//! them into the final statement for each records format. Values never
//! appear in the SQL text on the bound path: every one goes through
//! [`Params::push`] and comes back as a placeholder cast to the column type.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use sqlx::Postgres;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;

use crate::plugin::FieldPolicy;
use crate::records::{RecordsFormat, TextQuery};
use crate::sql::sanitize::{identifier, literal_string};
use crate::types::{FieldTypes, Value, is_array_type, is_nested_type};

/// Planner row estimate for an unfiltered resource
pub const ESTIMATE_SQL: &str = "SELECT reltuples::BIGINT FROM pg_class WHERE relname = $1";

/// Render a type name for use inside `CAST(.. AS type)` or a column list.
///
/// Plain lowercase names (`int4`, `_text`, `timestamp with time zone`,
/// `text[]`) are emitted as-is so built-in aliases such as `int` keep
/// working; anything else is quoted.
pub fn cast_type(type_name: &str) -> String {
    static PLAIN_TYPE: OnceLock<Regex> = OnceLock::new();
    let plain = PLAIN_TYPE.get_or_init(|| {
        Regex::new(r"^_?[a-z][a-z0-9_]*( [a-z][a-z0-9_]*)*(\[\])?$").expect("valid type regex")
    });
    if plain.is_match(type_name) {
        type_name.to_string()
    } else {
        identifier(type_name)
    }
}

/// How values reach the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `$n` placeholders with values bound separately
    Bound,
    /// Escaped literals written into the statement (for `COPY`)
    Inline,
}

/// Accumulates query values in placeholder order
#[derive(Debug, Clone)]
pub struct Params {
    style: ParamStyle,
    values: Vec<Option<String>>,
}

impl Params {
    pub fn new(style: ParamStyle) -> Self {
        Self {
            style,
            values: Vec::new(),
        }
    }

    pub fn bound() -> Self {
        Self::new(ParamStyle::Bound)
    }

    pub fn inline() -> Self {
        Self::new(ParamStyle::Inline)
    }

    pub fn style(&self) -> ParamStyle {
        self.style
    }

    /// Register a value and return the SQL expression standing for it
    pub fn push(&mut self, value: Option<String>, type_name: &str) -> String {
        let cast = cast_type(type_name);
        match self.style {
            ParamStyle::Bound => {
                self.values.push(value);
                format!("CAST(${} AS {})", self.values.len(), cast)
            }
            ParamStyle::Inline => match value {
                Some(v) => format!("CAST({} AS {})", literal_string(&v), cast),
                None => format!("CAST(NULL AS {})", cast),
            },
        }
    }

    /// Register a record value destined for a column of `type_name`
    pub fn push_value(&mut self, value: &JsonValue, type_name: &str) -> String {
        let text = Value::for_column(value, type_name).to_sql_text();
        self.push(text, type_name)
    }

    /// Values to bind, in placeholder order; empty for inline params
    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Prepare `sql` with every value bound as text, in placeholder order
    pub fn bind_to<'q>(&'q self, sql: &'q str) -> Query<'q, Postgres, PgArguments> {
        self.values
            .iter()
            .fold(sqlx::query(sql), |query, value| query.bind(value.as_deref()))
    }
}

/// Query fragments accumulated by the built-in compiler and plugins
#[derive(Debug, Clone)]
pub struct QueryParts {
    pub select: Vec<String>,
    /// Conditions joined with AND; each is parenthesised on render
    pub where_clauses: Vec<String>,
    pub sort: Vec<String>,
    /// Text-search query sources appended to the FROM list
    pub ts_query: String,
    pub distinct: bool,
    pub limit: i64,
    pub offset: i64,
    pub params: Params,
    /// `(alias, rank expression)` pairs, in query order
    pub rank_columns: Vec<(String, String)>,
}

impl QueryParts {
    pub fn new(style: ParamStyle) -> Self {
        Self {
            select: Vec::new(),
            where_clauses: Vec::new(),
            sort: Vec::new(),
            ts_query: String::new(),
            distinct: false,
            limit: 0,
            offset: 0,
            params: Params::new(style),
            rank_columns: Vec::new(),
        }
    }

    pub fn where_sql(&self) -> String {
        where_sql(&self.where_clauses)
    }

    fn distinct_sql(&self) -> &'static str {
        if self.distinct { "DISTINCT" } else { "" }
    }

    fn order_by(&self) -> String {
        if !self.sort.is_empty() {
            format!("ORDER BY {}", self.sort.join(", "))
        } else if !self.distinct {
            "ORDER BY \"_id\"".to_string()
        } else {
            String::new()
        }
    }

    fn inner_query(&self, resource_id: &str) -> String {
        format!(
            "SELECT * FROM {} {} {} {} LIMIT {} OFFSET {}",
            identifier(resource_id),
            self.ts_query,
            self.where_sql(),
            self.order_by(),
            self.limit,
            self.offset
        )
    }

    /// Statement producing the records in `format`.
    ///
    /// Objects and lists yield one text row holding a JSON array; CSV and
    /// TSV are `COPY .. TO STDOUT` statements.
    pub fn render(&self, resource_id: &str, format: RecordsFormat) -> String {
        let inner = self.inner_query(resource_id);
        let distinct = self.distinct_sql();
        match format {
            RecordsFormat::Objects => format!(
                "SELECT array_to_json(array_agg(j))::text FROM (\
                 SELECT {distinct} {select} FROM ({inner}) AS z) AS j",
                select = self.select.join(", "),
            ),
            RecordsFormat::Lists => format!(
                "SELECT '[' || array_to_string(array_agg(j.v), ',') || ']' FROM (\
                 SELECT {distinct} '[' || {select} || ']' v FROM ({inner}) AS z) AS j",
                select = self.select.join(" || ',' || "),
            ),
            RecordsFormat::Csv => format!(
                "COPY (SELECT {distinct} {select} FROM ({inner}) AS z) TO STDOUT csv DELIMITER ','",
                select = self.select.join(", "),
            ),
            RecordsFormat::Tsv => format!(
                "COPY (SELECT {distinct} {select} FROM ({inner}) AS z) TO STDOUT csv DELIMITER E'\\t'",
                select = self.select.join(", "),
            ),
        }
    }

    /// Exact total over the filtered query, ignoring limit and offset
    pub fn count_sql(&self, resource_id: &str) -> String {
        format!(
            "SELECT count(*) FROM (SELECT {} {} FROM {} {} {}) AS t",
            self.distinct_sql(),
            self.select.join(", "),
            identifier(resource_id),
            self.ts_query,
            self.where_sql()
        )
    }
}

/// `WHERE (a) AND (b)`, or an empty string
pub fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = clauses.iter().map(|c| format!("({})", c)).collect();
    format!("WHERE {}", joined.join(" AND "))
}

// =============================================================================
// Filters and text search
// =============================================================================

/// Equality filters on known fields.
///
/// List values on non-array columns become `IN (..)`; an empty list matches
/// nothing. JSON null matches SQL NULL.
pub fn filter_clauses(
    filters: &Map<String, JsonValue>,
    types: &FieldTypes,
    params: &mut Params,
) -> Vec<String> {
    let mut clauses = Vec::new();
    for (field, value) in filters {
        let Some(type_name) = types.get(field) else {
            continue;
        };
        let column = identifier(field);
        match value {
            JsonValue::Array(items) if !is_array_type(type_name) => {
                if items.is_empty() {
                    clauses.push("FALSE".to_string());
                    continue;
                }
                let placeholders: Vec<String> = items
                    .iter()
                    .map(|item| params.push_value(item, type_name))
                    .collect();
                clauses.push(format!("{} IN ({})", column, placeholders.join(",")));
            }
            JsonValue::Null => clauses.push(format!("{} IS NULL", column)),
            _ => {
                let placeholder = params.push_value(value, type_name);
                clauses.push(format!("{} = {}", column, placeholder));
            }
        }
    }
    clauses
}

/// Alias of the text-search query for `field`, or the `_full_text` query
pub fn ts_query_alias(field: Option<&str>) -> String {
    match field {
        Some(field) => identifier(&format!("query {}", field)),
        None => identifier("query"),
    }
}

/// Alias of the rank column for `field`, or the `_full_text` rank
pub fn rank_alias(field: Option<&str>) -> String {
    match field {
        Some(field) => format!("rank {}", field),
        None => "rank".to_string(),
    }
}

/// Conditions matching `q` and `full_text` against their query aliases
pub fn text_search_clauses(
    q: Option<&TextQuery>,
    full_text: Option<&str>,
    lang: &str,
    types: &FieldTypes,
    policy: &dyn FieldPolicy,
) -> Vec<String> {
    let mut clauses = Vec::new();
    match q {
        Some(TextQuery::Text(text)) if !text.is_empty() => {
            clauses.push(format!("_full_text @@ {}", ts_query_alias(None)));
        }
        Some(TextQuery::Fields(map)) => {
            for field in map.keys() {
                let Some(type_name) = types.get(field) else {
                    continue;
                };
                let alias = ts_query_alias(Some(field));
                if !policy.should_fts_index_field_type(type_name) {
                    // narrow with the general index first
                    clauses.push(format!("_full_text @@ {}", alias));
                }
                clauses.push(format!(
                    "to_tsvector({}, cast({} as text)) @@ {}",
                    literal_string(lang),
                    identifier(field),
                    alias
                ));
            }
        }
        _ => {}
    }
    if full_text.is_some_and(|t| !t.is_empty()) {
        clauses.push(format!("_full_text @@ {}", ts_query_alias(None)));
    }
    clauses
}

fn query_and_rank(lang: &str, text: &str, plain: bool, field: Option<&str>) -> (String, String) {
    let alias = ts_query_alias(field);
    let lang_literal = literal_string(lang);
    let function = if plain { "plainto_tsquery" } else { "to_tsquery" };
    let statement = format!(
        "{}({}, {}) {}",
        function,
        lang_literal,
        literal_string(text),
        alias
    );
    let rank_source = match field {
        Some(field) => format!("to_tsvector({}, cast({} as text))", lang_literal, identifier(field)),
        None => "_full_text".to_string(),
    };
    (statement, format!("ts_rank({}, {}, 32)", rank_source, alias))
}

/// Query sources for the FROM list plus the rank columns they produce.
///
/// A `full_text` term takes the `"query"`/`"rank"` pair, so a string `q`
/// alongside it only narrows through the WHERE clause.
pub fn textsearch_query(
    lang: &str,
    q: Option<&TextQuery>,
    plain: bool,
    full_text: Option<&str>,
) -> (String, Vec<(String, String)>) {
    let q = q.filter(|q| !q.is_empty());
    let full_text = full_text.filter(|t| !t.is_empty());

    let mut terms: Vec<(Option<&str>, &str)> = Vec::new();
    if let Some(text) = full_text {
        terms.push((None, text));
    }
    match q {
        Some(TextQuery::Text(text)) if full_text.is_none() => terms.push((None, text)),
        Some(TextQuery::Fields(map)) => {
            terms.extend(map.iter().map(|(field, text)| (Some(field.as_str()), text.as_str())));
        }
        _ => {}
    }

    if terms.is_empty() {
        return (String::new(), Vec::new());
    }

    let mut statements = Vec::with_capacity(terms.len());
    let mut ranks = Vec::with_capacity(terms.len());
    for (field, text) in terms {
        let (statement, rank) = query_and_rank(lang, text, plain, field);
        statements.push(statement);
        ranks.push((rank_alias(field), rank));
    }
    (format!(", {}", statements.join(", ")), ranks)
}

// =============================================================================
// Sorting
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

/// One parsed sort clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortClause {
    pub field: String,
    pub direction: SortDirection,
    pub nulls: Option<NullsOrder>,
}

impl SortClause {
    /// Parse `field [asc|desc] [nulls first|last]`; the field may be
    /// double-quoted. Returns `None` when nothing resembling a field is left.
    pub fn parse(clause: &str) -> Option<Self> {
        static SORT: OnceLock<Regex> = OnceLock::new();
        let re = SORT.get_or_init(|| {
            Regex::new(r"(?i)^\s*(.+?)(?:\s+(asc|desc))?(?:\s+nulls\s+(first|last))?\s*$")
                .expect("valid sort regex")
        });
        let caps = re.captures(clause)?;
        let raw = caps.get(1)?.as_str().trim();
        let field = match raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            Some(inner) => inner.replace("\"\"", "\""),
            None => raw.to_string(),
        };
        if field.is_empty() {
            return None;
        }
        let direction = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(d) if d == "desc" => SortDirection::Desc,
            _ => SortDirection::Asc,
        };
        let nulls = caps
            .get(3)
            .map(|m| match m.as_str().to_ascii_lowercase().as_str() {
                "first" => NullsOrder::First,
                _ => NullsOrder::Last,
            });
        Some(Self {
            field,
            direction,
            nulls,
        })
    }

    /// Render against `target`, an identifier or rank expression
    fn to_sql(&self, target: &str) -> String {
        let mut sql = format!(
            "{} {}",
            target,
            match self.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            }
        );
        match self.nulls {
            Some(NullsOrder::First) => sql.push_str(" NULLS FIRST"),
            Some(NullsOrder::Last) => sql.push_str(" NULLS LAST"),
            None => {}
        }
        sql
    }
}

/// Resolve one sort clause against the known fields and rank aliases
pub fn sort_expression(
    clause: &str,
    types: &FieldTypes,
    rank_columns: &[(String, String)],
) -> Option<String> {
    let parsed = SortClause::parse(clause)?;
    if let Some((_, rank)) = rank_columns.iter().find(|(alias, _)| *alias == parsed.field) {
        return Some(parsed.to_sql(rank));
    }
    if types.contains(&parsed.field) {
        return Some(parsed.to_sql(&identifier(&parsed.field)));
    }
    None
}

/// ORDER BY terms: the explicit clauses, or the ranks descending.
///
/// Clauses that do not resolve are skipped; requests are validated before
/// they get here.
pub fn sort_clauses(
    sort: Option<&[String]>,
    types: &FieldTypes,
    rank_columns: &[(String, String)],
) -> Vec<String> {
    match sort {
        Some(clauses) if !clauses.is_empty() => clauses
            .iter()
            .filter_map(|c| sort_expression(c, types, rank_columns))
            .collect(),
        _ => rank_columns
            .iter()
            .map(|(_, rank)| format!("{} DESC", rank))
            .collect(),
    }
}

// =============================================================================
// Projection
// =============================================================================

/// SELECT expressions for `field_ids` in the requested format
pub fn select_columns<'a, I>(
    field_ids: I,
    types: &FieldTypes,
    rank_columns: &[(String, String)],
    format: RecordsFormat,
    ms_in_timestamp: bool,
) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let timestamp_fmt = if ms_in_timestamp {
        "to_char({}, 'YYYY-MM-DD\"T\"HH24:MI:SS.MS')"
    } else {
        "to_char({}, 'YYYY-MM-DD\"T\"HH24:MI:SS')"
    };
    let lists = format == RecordsFormat::Lists;

    field_ids
        .into_iter()
        .map(|id| {
            let rank = rank_columns.iter().find(|(alias, _)| alias == id);
            let source = match rank {
                Some((_, expr)) => expr.clone(),
                None => identifier(id),
            };
            let type_name = match rank {
                Some(_) => "float",
                None => types.get(id).unwrap_or(""),
            };

            let expr = if is_nested_type(type_name) {
                format!("coalesce(({}).json,'null')", source)
            } else if type_name == "timestamp" {
                let formatted = timestamp_fmt.replace("{}", &source);
                if lists {
                    format!("coalesce(to_json({}),'null')", formatted)
                } else {
                    formatted
                }
            } else if is_array_type(type_name) {
                format!("coalesce(array_to_json({}),'null')", source)
            } else if lists {
                format!("coalesce(to_json({}),'null')", source)
            } else {
                source
            };

            if lists {
                expr
            } else if rank.is_some() || format == RecordsFormat::Objects {
                format!("{} AS {}", expr, identifier(id))
            } else {
                expr
            }
        })
        .collect()
}
