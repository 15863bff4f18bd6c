use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{
    errors::{FleetError, Result},
    models::{ChannelKind, NewTenant, PlanTier, StatusTransition, Tenant, TenantStatus},
    traits::TenantRepository,
};
use sqlx::{PgPool, Row};
use tracing::debug;

pub(crate) const TENANT_COLUMNS: &str = "id, plan_tier, status, assigned_host_id, container_name, \
     contact, channels, last_active_at, created_at, grace_period_end, cancelled_at, updated_at";

/// 将数据库行转换为Tenant模型
pub(crate) fn row_to_tenant(row: &sqlx::postgres::PgRow) -> Result<Tenant> {
    let plan: String = row.try_get("plan_tier")?;
    let channels: Vec<String> = row.try_get("channels")?;
    let channels = channels
        .iter()
        .map(|channel| channel.parse::<ChannelKind>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(FleetError::Serialization)?;

    Ok(Tenant {
        id: row.try_get("id")?,
        plan_tier: plan.parse::<PlanTier>().map_err(FleetError::Serialization)?,
        status: row.try_get("status")?,
        assigned_host_id: row.try_get("assigned_host_id")?,
        container_name: row.try_get("container_name")?,
        contact: row.try_get("contact")?,
        channels,
        last_active_at: row.try_get("last_active_at")?,
        created_at: row.try_get("created_at")?,
        grace_period_end: row.try_get("grace_period_end")?,
        cancelled_at: row.try_get("cancelled_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn status_strings(statuses: &[TenantStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// PostgreSQL 租户仓储实现
pub struct PostgresTenantRepository {
    pool: PgPool,
}

impl PostgresTenantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantRepository for PostgresTenantRepository {
    async fn create(&self, new_tenant: &NewTenant) -> Result<Tenant> {
        let tenant = Tenant::new(new_tenant.clone());
        let channels: Vec<String> = tenant
            .channels
            .iter()
            .map(|c| c.as_str().to_string())
            .collect();

        let sql = format!(
            r#"
            INSERT INTO tenants (id, plan_tier, status, contact, channels, last_active_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6, $6)
            RETURNING {TENANT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&tenant.id)
            .bind(tenant.plan_tier.as_str())
            .bind(tenant.status)
            .bind(&tenant.contact)
            .bind(&channels)
            .bind(tenant.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        debug!("创建租户成功: {}", tenant.id);
        row_to_tenant(&row)
    }

    async fn get_by_id(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let sql = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        row.as_ref().map(row_to_tenant).transpose()
    }

    async fn transition(&self, transition: &StatusTransition) -> Result<Option<Tenant>> {
        let (set_grace, grace_value) = transition.grace_period_end.as_binding();
        let (set_cancelled, cancelled_value) = transition.cancelled_at.as_binding();

        let sql = format!(
            r#"
            UPDATE tenants
            SET status = $2,
                grace_period_end = CASE WHEN $3 THEN $4::timestamptz ELSE grace_period_end END,
                cancelled_at = CASE WHEN $5 THEN $6::timestamptz ELSE cancelled_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($7)
              AND ($8::timestamptz IS NULL OR last_active_at <= $8)
              AND ($9::timestamptz IS NULL OR updated_at <= $9)
            RETURNING {TENANT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&transition.tenant_id)
            .bind(transition.to)
            .bind(set_grace)
            .bind(grace_value.copied())
            .bind(set_cancelled)
            .bind(cancelled_value.copied())
            .bind(status_strings(&transition.from))
            .bind(transition.idle_since)
            .bind(transition.updated_before)
            .fetch_optional(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        match row {
            Some(row) => {
                debug!("租户 {} 状态转换为 {}", transition.tenant_id, transition.to);
                Ok(Some(row_to_tenant(&row)?))
            }
            None => Ok(None),
        }
    }

    async fn list_by_status(&self, statuses: &[TenantStatus]) -> Result<Vec<Tenant>> {
        let sql = format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE status = ANY($1) ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(status_strings(statuses))
            .fetch_all(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        rows.iter().map(row_to_tenant).collect()
    }

    async fn count_by_status(&self, status: TenantStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenants WHERE status = $1")
            .bind(status)
            .fetch_one(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        Ok(count)
    }

    async fn list_stalled(
        &self,
        statuses: &[TenantStatus],
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Tenant>> {
        let sql = format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE status = ANY($1) AND updated_at < $2 ORDER BY updated_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(status_strings(statuses))
            .bind(updated_before)
            .fetch_all(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        rows.iter().map(row_to_tenant).collect()
    }

    async fn touch_activity(&self, tenant_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tenants SET last_active_at = GREATEST(last_active_at, $2) WHERE id = $1",
        )
        .bind(tenant_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(FleetError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}
