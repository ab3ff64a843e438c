//! Process-wide type catalog
//!
//! Maps engine type OIDs to type names, one entry per connection target.
//! The first load for a target also makes sure the `nested` composite type
//! exists, creating it through the write pool when it does not.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::{pg_code, sql_state, Result};
use crate::types::NESTED_TYPE;

/// First server version with a native `json` type
const NATIVE_JSON_VERSION: i64 = 90200;

static CATALOGS: OnceLock<RwLock<HashMap<String, Arc<TypeCatalog>>>> = OnceLock::new();

fn catalogs() -> &'static RwLock<HashMap<String, Arc<TypeCatalog>>> {
    CATALOGS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Cached OID → type name table for one database
#[derive(Debug, Default)]
pub struct TypeCatalog {
    names: HashMap<u32, String>,
    /// Catalog names plus names that passed a cast check
    valid: RwLock<HashSet<String>>,
}

impl TypeCatalog {
    /// Build a catalog from `(oid, typname)` pairs
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, String)>,
    {
        let names: HashMap<u32, String> = entries.into_iter().collect();
        let valid = names.values().cloned().collect();
        Self {
            names,
            valid: RwLock::new(valid),
        }
    }

    /// Return the catalog for `target`, loading it on first use.
    ///
    /// Loading is idempotent: concurrent first calls may both query the
    /// server, and the last one to finish wins the cache slot.
    pub async fn load(target: &str, read: &PgPool, write: &PgPool) -> Result<Arc<TypeCatalog>> {
        if let Some(catalog) = Self::cached(target) {
            return Ok(catalog);
        }

        let mut catalog = Self::fetch(read).await?;
        if !catalog.is_known(NESTED_TYPE) {
            create_nested_type(write).await?;
            catalog = Self::fetch(read).await?;
        }

        let catalog = Arc::new(catalog);
        catalogs()
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target.to_string(), Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Drop every cached catalog
    pub fn reset() {
        catalogs().write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn cached(target: &str) -> Option<Arc<TypeCatalog>> {
        catalogs()
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .cloned()
    }

    async fn fetch(pool: &PgPool) -> Result<TypeCatalog> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT oid::bigint, typname::text FROM pg_type")
                .fetch_all(pool)
                .await?;
        debug!(types = rows.len(), "Loaded type catalog");
        Ok(Self::from_entries(
            rows.into_iter()
                .filter_map(|(oid, name)| u32::try_from(oid).ok().map(|oid| (oid, name))),
        ))
    }

    pub fn type_name(&self, oid: u32) -> Option<&str> {
        self.names.get(&oid).map(String::as_str)
    }

    pub fn is_known(&self, type_name: &str) -> bool {
        self.valid
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(type_name)
    }

    /// Record a type name that passed a cast check
    pub fn remember(&self, type_name: &str) {
        self.valid
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(type_name.to_string());
    }
}

async fn create_nested_type(write: &PgPool) -> Result<()> {
    let version: String = sqlx::query_scalar("SHOW server_version_num")
        .fetch_one(write)
        .await?;
    let native_json = version.trim().parse::<i64>().unwrap_or(0) >= NATIVE_JSON_VERSION;
    info!(native_json, "Creating nested type");

    let sql = format!(
        "CREATE TYPE \"{}\" AS (json {}, extra text)",
        NESTED_TYPE,
        if native_json { "json" } else { "text" }
    );
    match sqlx::query(&sql).execute(write).await {
        Ok(_) => Ok(()),
        // another process got there first
        Err(err) if sql_state(&err).as_deref() == Some(pg_code::DUPLICATE_OBJECT) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TypeCatalog {
        TypeCatalog::from_entries(vec![
            (23, "int4".to_string()),
            (25, "text".to_string()),
            (1009, "_text".to_string()),
        ])
    }

    #[test]
    fn test_type_name_lookup() {
        let catalog = sample();
        assert_eq!(catalog.type_name(23), Some("int4"));
        assert_eq!(catalog.type_name(1009), Some("_text"));
        assert_eq!(catalog.type_name(9999), None);
    }

    #[test]
    fn test_known_names_include_catalog() {
        let catalog = sample();
        assert!(catalog.is_known("text"));
        assert!(!catalog.is_known("int"));
        assert!(!catalog.is_known(NESTED_TYPE));
    }

    #[test]
    fn test_remember_cast_checked_name() {
        let catalog = sample();
        catalog.remember("int");
        assert!(catalog.is_known("int"));
    }

    #[test]
    fn test_reset_clears_cache() {
        catalogs()
            .write()
            .unwrap()
            .insert("postgres://reset-test".to_string(), Arc::new(sample()));
        assert!(TypeCatalog::cached("postgres://reset-test").is_some());

        TypeCatalog::reset();
        assert!(TypeCatalog::cached("postgres://reset-test").is_none());
    }
}
