//! Configuration for the Datastore
//!
//! Provides a builder pattern for configuring the datastore, plus loading
//! from environment variables and the SQL function allow-list file.

use std::collections::HashSet;
use std::path::Path;

use tracing::warn;

use crate::error::{DatastoreError, Result};

pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_FTS_LANG: &str = "english";
pub const DEFAULT_FTS_INDEX_METHOD: &str = "gist";
pub const DEFAULT_ROWS_MAX: i64 = 32_000;
pub const DEFAULT_LIMIT: i64 = 100;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Configuration for the datastore
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection URL used for writes and schema changes
    pub write_url: String,
    /// Connection URL used for searches
    pub read_url: String,
    /// Per-statement timeout in milliseconds
    pub query_timeout_ms: u64,
    /// Text search configuration used when a request names none
    pub default_fts_lang: String,
    /// Index access method for full-text indexes
    pub default_fts_index_method: String,
    /// Render timestamps with millisecond precision
    pub ms_in_timestamp: bool,
    /// Row cap for `search_sql`
    pub rows_max: i64,
    /// Limit applied when a search names none
    pub default_limit: i64,
    /// Pool size per connection URL
    pub max_connections: u32,
    /// Whether `search_sql` is available at all
    pub sql_search_enabled: bool,
    /// Functions `search_sql` may call
    pub allowed_sql_functions: HashSet<String>,
}

impl StoreConfig {
    /// Create a new configuration builder
    pub fn builder(write_url: impl Into<String>, read_url: impl Into<String>) -> StoreConfigBuilder {
        StoreConfigBuilder::new(write_url, read_url)
    }

    /// Load from `DATASTORE_*` environment variables.
    ///
    /// `DATASTORE_WRITE_URL` and `DATASTORE_READ_URL` are required. Optional:
    /// `DATASTORE_QUERY_TIMEOUT_MS`, `DATASTORE_FTS_LANG`,
    /// `DATASTORE_FTS_INDEX_METHOD`, `DATASTORE_MS_IN_TIMESTAMP`,
    /// `DATASTORE_ROWS_MAX`, `DATASTORE_SQL_SEARCH_ENABLED`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let write_url = lookup("DATASTORE_WRITE_URL").ok_or_else(|| {
            DatastoreError::configuration("DATASTORE_WRITE_URL not found in environment")
        })?;
        let read_url = lookup("DATASTORE_READ_URL").ok_or_else(|| {
            DatastoreError::configuration("DATASTORE_READ_URL not found in environment")
        })?;

        let mut builder = Self::builder(write_url, read_url);
        if let Some(ms) = lookup("DATASTORE_QUERY_TIMEOUT_MS") {
            builder = builder.query_timeout_ms(parse_setting("DATASTORE_QUERY_TIMEOUT_MS", &ms)?);
        }
        if let Some(lang) = lookup("DATASTORE_FTS_LANG") {
            builder = builder.default_fts_lang(lang);
        }
        if let Some(method) = lookup("DATASTORE_FTS_INDEX_METHOD") {
            builder = builder.default_fts_index_method(method);
        }
        if let Some(flag) = lookup("DATASTORE_MS_IN_TIMESTAMP") {
            builder = builder.ms_in_timestamp(parse_flag(&flag));
        }
        if let Some(rows) = lookup("DATASTORE_ROWS_MAX") {
            builder = builder.rows_max(parse_setting("DATASTORE_ROWS_MAX", &rows)?);
        }
        if let Some(flag) = lookup("DATASTORE_SQL_SEARCH_ENABLED") {
            builder = builder.sql_search(parse_flag(&flag));
        }
        Ok(builder.build())
    }

    /// Check the settings needed to activate the backend
    pub fn validate(&self) -> Result<()> {
        if self.write_url.trim().is_empty() {
            return Err(DatastoreError::configuration("write_url is not set"));
        }
        if self.read_url.trim().is_empty() {
            return Err(DatastoreError::configuration("read_url is not set"));
        }
        if self.rows_max < 1 {
            return Err(DatastoreError::configuration("rows_max must be positive"));
        }
        if self.read_url == self.write_url {
            warn!("read_url and write_url are identical; searches run with write privileges");
        }
        Ok(())
    }
}

fn parse_setting<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| DatastoreError::configuration(format!("{} has an invalid value: {}", key, raw)))
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Normalise one allow-list entry.
///
/// Whitespace is trimmed and the entry is lowercased unless it is written in
/// double quotes.
pub fn format_function_entry(line: &str) -> String {
    let entry = line.trim();
    if entry.starts_with('"') {
        entry.to_string()
    } else {
        entry.to_lowercase()
    }
}

/// Read the SQL function allow-list, one function per line
pub async fn load_allowed_functions(path: impl AsRef<Path>) -> Result<HashSet<String>> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        DatastoreError::configuration(format!(
            "cannot read allowed functions file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(contents
        .lines()
        .map(format_function_entry)
        .filter(|entry| !entry.is_empty())
        .collect())
}

/// Builder for StoreConfig
#[derive(Debug)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Create a new builder with the write and read URLs
    pub fn new(write_url: impl Into<String>, read_url: impl Into<String>) -> Self {
        Self {
            config: StoreConfig {
                write_url: write_url.into(),
                read_url: read_url.into(),
                query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
                default_fts_lang: DEFAULT_FTS_LANG.to_string(),
                default_fts_index_method: DEFAULT_FTS_INDEX_METHOD.to_string(),
                ms_in_timestamp: false,
                rows_max: DEFAULT_ROWS_MAX,
                default_limit: DEFAULT_LIMIT,
                max_connections: DEFAULT_MAX_CONNECTIONS,
                sql_search_enabled: false,
                allowed_sql_functions: HashSet::new(),
            },
        }
    }

    /// Set the statement timeout (default: 60000 ms)
    pub fn query_timeout_ms(mut self, ms: u64) -> Self {
        self.config.query_timeout_ms = ms;
        self
    }

    /// Set the default text search configuration (default: "english")
    pub fn default_fts_lang(mut self, lang: impl Into<String>) -> Self {
        self.config.default_fts_lang = lang.into();
        self
    }

    /// Set the full-text index method (default: "gist")
    pub fn default_fts_index_method(mut self, method: impl Into<String>) -> Self {
        self.config.default_fts_index_method = method.into();
        self
    }

    pub fn ms_in_timestamp(mut self, enabled: bool) -> Self {
        self.config.ms_in_timestamp = enabled;
        self
    }

    /// Set the `search_sql` row cap (default: 32000)
    pub fn rows_max(mut self, rows: i64) -> Self {
        self.config.rows_max = rows;
        self
    }

    pub fn default_limit(mut self, limit: i64) -> Self {
        self.config.default_limit = limit;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Enable or disable `search_sql` (default: disabled)
    pub fn sql_search(mut self, enabled: bool) -> Self {
        self.config.sql_search_enabled = enabled;
        self
    }

    /// Allow `search_sql` to call these functions
    pub fn allowed_sql_functions<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.allowed_sql_functions = functions
            .into_iter()
            .map(|f| format_function_entry(f.as_ref()))
            .filter(|f| !f.is_empty())
            .collect();
        self
    }

    /// Build the configuration
    pub fn build(self) -> StoreConfig {
        self.config
    }
}
