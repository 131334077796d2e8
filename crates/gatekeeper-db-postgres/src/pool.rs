//! Pool creation and startup checks.

use std::time::Duration;

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info, instrument};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, Result, is_undefined_table};

/// Tables the gatekeeper reads or writes. All must exist before serving.
pub const REQUIRED_TABLES: [&str; 7] = [
    "organization",
    "api_endpoint",
    "subscription",
    "organization_permission",
    "tier_base_pricing",
    "custom_endpoint_pricing",
    "api_usage_summary",
];

const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

#[instrument(skip(config), fields(url = %mask_password(&config.url)))]
pub async fn create_pool(config: &PostgresConfig) -> Result<PgPool> {
    if config.url.trim().is_empty() {
        return Err(PostgresError::config("database url is empty"));
    }
    if config.pool_size == 0 {
        return Err(PostgresError::config("pool_size must be greater than zero"));
    }

    // Lookups are cached, so a small warm floor is enough.
    let min_connections = config
        .min_connections
        .unwrap_or(1)
        .min(config.pool_size);
    let max_lifetime = config
        .max_lifetime_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_MAX_LIFETIME);

    let mut options = PoolOptions::<Postgres>::new()
        .max_connections(config.pool_size)
        .min_connections(min_connections)
        .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
        .max_lifetime(max_lifetime);
    if let Some(idle) = config.idle_timeout_ms {
        options = options.idle_timeout(Duration::from_millis(idle));
    }

    let pool = options.connect(&config.url).await?;
    info!(
        max_connections = config.pool_size,
        min_connections, "PostgreSQL pool ready"
    );
    Ok(pool)
}

/// Probes every table in [`REQUIRED_TABLES`] with a zero-row select.
///
/// A missing table is reported by name as a configuration error instead of
/// surfacing later as a failed lookup on the request path.
#[instrument(skip(pool))]
pub async fn check_schema(pool: &PgPool) -> Result<()> {
    for table in REQUIRED_TABLES {
        let probe = format!("SELECT 1 FROM {table} LIMIT 0");
        match sqlx_core::query::query(&probe).execute(pool).await {
            Ok(_) => debug!(table, "table present"),
            Err(e) if is_undefined_table(&e) => {
                return Err(PostgresError::config(format!("missing table {table}")));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Replaces the password of a connection URL with `****`.
///
/// Only the authority part (between `://` and the first `/`, `?` or `#`) is
/// inspected; anything that does not parse that way is returned unchanged.
pub fn mask_password(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let start = scheme_end + 3;
    let end = url[start..]
        .find(['/', '?', '#'])
        .map_or(url.len(), |p| start + p);
    let authority = &url[start..end];

    let Some(at) = authority.rfind('@') else {
        return url.to_string();
    };
    match authority[..at].find(':') {
        Some(colon) => format!(
            "{}:****{}",
            &url[..start + colon],
            &url[start + at..]
        ),
        None => url.to_string(),
    }
}
