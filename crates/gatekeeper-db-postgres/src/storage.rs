//! PostgreSQL implementation of [`GatekeeperStorage`].

use async_trait::async_trait;
use sqlx_postgres::PgPool;
use tracing::{debug, info, instrument};

use gatekeeper_core::{
    AccessType, ApiEndpoint, CostMode, Organization, Pricing, QuotaUsage, Subscription,
    UsageSummary,
};
use gatekeeper_storage::{GatekeeperStorage, StorageError};

use crate::error::PostgresError;

type EndpointRow = (i32, String, String, String, i32, String, String);

const ENDPOINT_COLUMNS: &str = r#"
    api_endpoint_id, endpoint_name, http_method, path_template,
    resource_type_id, permission_code, access_type
"#;

/// Gatekeeper storage on top of the administrative PostgreSQL schema.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Waits for checked-out connections to return, then closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }

    /// Creates the unique index the additive usage upsert relies on.
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), PostgresError> {
        sqlx_core::query::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_api_usage_summary_bucket
            ON api_usage_summary (organization_id, subscription_id, api_endpoint_id, usage_end_date)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Ensured api_usage_summary bucket index");
        Ok(())
    }

    fn endpoint_from_row(row: EndpointRow) -> Result<ApiEndpoint, StorageError> {
        let (id, code, method, path_template, resource_type_id, permission_code, access_type) =
            row;
        Ok(ApiEndpoint {
            id,
            code,
            method,
            path_template,
            resource_type_id,
            permission_code,
            access_type: access_type.parse::<AccessType>()?,
        })
    }
}

fn db_err(err: sqlx_core::error::Error) -> StorageError {
    PostgresError::from(err).into()
}

#[async_trait]
impl GatekeeperStorage for PostgresStorage {
    #[instrument(skip(self))]
    async fn get_organization_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Organization>, StorageError> {
        let row: Option<(i32, String)> = sqlx_core::query_as::query_as(
            r#"
            SELECT organization_id, organization_name
            FROM organization
            WHERE organization_name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|(id, name)| Organization { id, name }))
    }

    #[instrument(skip(self))]
    async fn get_api_endpoint_by_name(
        &self,
        code: &str,
    ) -> Result<Option<ApiEndpoint>, StorageError> {
        let sql = format!("SELECT {ENDPOINT_COLUMNS} FROM api_endpoint WHERE endpoint_name = $1");
        let row: Option<EndpointRow> = sqlx_core::query_as::query_as(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Self::endpoint_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_active_subscription(
        &self,
        organization_id: i32,
        endpoint_id: i32,
    ) -> Result<Option<Subscription>, StorageError> {
        let row: Option<(i32, i32, i64, i64, bool)> = sqlx_core::query_as::query_as(
            r#"
            SELECT s.subscription_id,
                   s.organization_id,
                   COALESCE(s.subscription_api_limit, 0)::BIGINT,
                   COALESCE(EXTRACT(EPOCH FROM s.subscription_expiry_date), 0)::BIGINT,
                   COALESCE(s.subscription_status, FALSE)
            FROM subscription s
            JOIN tier_base_pricing tbp
              ON tbp.subscription_tier_id = s.subscription_tier_id
            WHERE s.organization_id = $1
              AND tbp.api_endpoint_id = $2
            ORDER BY s.subscription_status DESC, s.subscription_id DESC
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(
            |(id, organization_id, api_limit, expiry_timestamp, active)| Subscription {
                id,
                organization_id,
                api_limit,
                expiry_timestamp,
                active,
            },
        ))
    }

    #[instrument(skip(self))]
    async fn check_org_permission(
        &self,
        organization_id: i32,
        resource_type_id: i32,
        permission_code: &str,
    ) -> Result<bool, StorageError> {
        let (granted,): (bool,) = sqlx_core::query_as::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM organization_permission
                WHERE organization_id = $1
                  AND resource_type_id = $2
                  AND permission_code = $3
            )
            "#,
        )
        .bind(organization_id)
        .bind(resource_type_id)
        .bind(permission_code)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(granted)
    }

    #[instrument(skip(self))]
    async fn get_pricing(
        &self,
        subscription_id: i32,
        endpoint_id: i32,
    ) -> Result<Option<Pricing>, StorageError> {
        let row: Option<(f64, String)> = sqlx_core::query_as::query_as(
            r#"
            SELECT COALESCE(cep.custom_cost_per_call, tbp.base_cost_per_call)::FLOAT8,
                   COALESCE(tbp.cost_mode, 'fixed')
            FROM subscription s
            JOIN tier_base_pricing tbp
              ON tbp.subscription_tier_id = s.subscription_tier_id
             AND tbp.api_endpoint_id = $2
            LEFT JOIN custom_endpoint_pricing cep
              ON cep.subscription_id = s.subscription_id
             AND cep.tier_base_pricing_id = tbp.tier_base_pricing_id
            WHERE s.subscription_id = $1
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|(cost_per_call, cost_mode)| -> Result<Pricing, StorageError> {
            Ok(Pricing {
                cost_per_call,
                cost_mode: cost_mode.parse::<CostMode>()?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn get_quota_usage_by_subscription_id(
        &self,
        subscription_id: i32,
    ) -> Result<QuotaUsage, StorageError> {
        let (total_calls, total_cost): (i64, f64) = sqlx_core::query_as::query_as(
            r#"
            SELECT COALESCE(SUM(total_calls), 0)::BIGINT,
                   COALESCE(SUM(total_cost), 0)::FLOAT8
            FROM api_usage_summary
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(QuotaUsage {
            total_calls,
            total_cost,
        })
    }

    #[instrument(skip(self, summary), fields(
        organization_id = summary.organization_id,
        subscription_id = summary.subscription_id,
        endpoint_id = summary.api_endpoint_id,
        usage_end_date = summary.usage_end_date,
    ))]
    async fn create_api_usage_summary(&self, summary: &UsageSummary) -> Result<(), StorageError> {
        sqlx_core::query::query(
            r#"
            INSERT INTO api_usage_summary (
                usage_start_date, usage_end_date, total_calls, total_cost,
                subscription_id, api_endpoint_id, organization_id
            )
            VALUES (to_timestamp($1::BIGINT), to_timestamp($2::BIGINT), $3, $4, $5, $6, $7)
            ON CONFLICT (organization_id, subscription_id, api_endpoint_id, usage_end_date)
            DO UPDATE SET
                total_calls = api_usage_summary.total_calls + EXCLUDED.total_calls,
                total_cost = api_usage_summary.total_cost + EXCLUDED.total_cost
            "#,
        )
        .bind(summary.usage_start_date)
        .bind(summary.usage_end_date)
        .bind(summary.total_calls)
        .bind(summary.total_cost)
        .bind(summary.subscription_id)
        .bind(summary.api_endpoint_id)
        .bind(summary.organization_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!("usage summary upserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_api_endpoints(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ApiEndpoint>, StorageError> {
        let sql = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM api_endpoint ORDER BY api_endpoint_id LIMIT $1 OFFSET $2"
        );
        let rows: Vec<EndpointRow> = sqlx_core::query_as::query_as(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(Self::endpoint_from_row).collect()
    }
}
