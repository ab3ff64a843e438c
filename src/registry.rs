//! Process-wide connection pool registry
//!
//! One pool per (role, URL). Pools connect lazily, so registering one never
//! touches the network. Await [`dispose`] before forking so that neither
//! parent nor children share sockets.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use sqlx::Executor;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use crate::error::{DatastoreError, Result};

/// Which side of the datastore a pool serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolRole {
    /// Queries; sessions default to READ UNCOMMITTED
    Read,
    /// Mutations
    Write,
}

static POOLS: OnceLock<Mutex<HashMap<(PoolRole, String), PgPool>>> = OnceLock::new();

fn pools() -> &'static Mutex<HashMap<(PoolRole, String), PgPool>> {
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the pool for `url` in the given role
pub fn pool_for(url: &str, role: PoolRole, max_connections: u32) -> Result<PgPool> {
    let mut pools = pools().lock().unwrap_or_else(|e| e.into_inner());
    let key = (role, url.to_string());
    if let Some(pool) = pools.get(&key) {
        return Ok(pool.clone());
    }

    let mut options = PgPoolOptions::new()
        .max_connections(max_connections)
        .test_before_acquire(true);
    if role == PoolRole::Read {
        options = options.after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute(
                    "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL READ UNCOMMITTED",
                )
                .await?;
                Ok(())
            })
        });
    }

    let pool = options.connect_lazy(url).map_err(|e| {
        DatastoreError::configuration(format!("invalid {:?} connection URL: {}", role, e))
    })?;
    debug!(?role, "Registered connection pool");
    pools.insert(key, pool.clone());
    Ok(pool)
}

/// Close and forget every registered pool.
///
/// Handles cloned from a disposed pool fail with `PoolClosed`; later
/// [`pool_for`] calls build fresh pools.
pub async fn dispose() {
    let disposed: Vec<PgPool> = {
        let mut pools = pools().lock().unwrap_or_else(|e| e.into_inner());
        pools.drain().map(|(_, pool)| pool).collect()
    };
    debug!(count = disposed.len(), "Disposing connection pools");
    for pool in disposed {
        pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Registry Tests
    // =========================================================================

    #[tokio::test]
    async fn test_pools_are_shared_then_closed_on_dispose() {
        let url = "postgres://registry@localhost:1/registry_test";
        let read = pool_for(url, PoolRole::Read, 2).unwrap();
        let again = pool_for(url, PoolRole::Read, 2).unwrap();
        let write = pool_for(url, PoolRole::Write, 2).unwrap();
        assert!(!read.is_closed());

        dispose().await;
        assert!(read.is_closed());
        assert!(again.is_closed());
        assert!(write.is_closed());

        let fresh = pool_for(url, PoolRole::Read, 2).unwrap();
        assert!(!fresh.is_closed());
        dispose().await;
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let err = pool_for("not a url", PoolRole::Write, 1).unwrap_err();
        assert!(matches!(err, DatastoreError::Configuration(_)));
    }
}
