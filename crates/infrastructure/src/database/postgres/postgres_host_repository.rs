use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{
    errors::{FleetError, Result},
    models::{
        HostRegistration, HostStatus, PlanRamTable, PlanTier, RegisteredHost, Tenant,
        TenantStatus, WorkerHost,
    },
    traits::{HostRemoval, HostRepository, TenantReservation, WakeReservation},
};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use super::postgres_tenant_repository::{row_to_tenant, TENANT_COLUMNS};

pub(crate) const HOST_COLUMNS: &str = "id, address, hostname, ram_total_mb, ram_used_mb, \
     measured_ram_used_mb, status, provider_id, registered_at, last_seen_at";

/// 条件预订：候选主机被锁定后再次校验余量，保证 ram_used_mb 不超过 ram_total_mb
const RESERVE_SQL: &str = r#"
    UPDATE worker_hosts
    SET ram_used_mb = ram_used_mb + $1
    WHERE id = (
        SELECT id FROM worker_hosts
        WHERE status = 'active' AND ram_total_mb - ram_used_mb >= $1
        ORDER BY ram_used_mb DESC, registered_at ASC
        LIMIT 1
        FOR UPDATE
    )
    AND status = 'active'
    AND ram_used_mb + $1 <= ram_total_mb
"#;

/// PostgreSQL 主机仓储实现
pub struct PostgresHostRepository {
    pool: PgPool,
    retry_attempts: u32,
}

impl PostgresHostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_attempts: 3,
        }
    }

    /// 设置候选主机被并发抢走时的重试次数
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub(crate) fn row_to_host(row: &sqlx::postgres::PgRow) -> Result<WorkerHost> {
        Ok(WorkerHost {
            id: row.try_get("id")?,
            address: row.try_get("address")?,
            hostname: row.try_get("hostname")?,
            ram_total_mb: row.try_get("ram_total_mb")?,
            ram_used_mb: row.try_get("ram_used_mb")?,
            measured_ram_used_mb: row.try_get("measured_ram_used_mb")?,
            status: row.try_get("status")?,
            provider_id: row.try_get("provider_id")?,
            registered_at: row.try_get("registered_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
        })
    }

    fn booked_statuses() -> Vec<String> {
        TenantStatus::BOOKED
            .iter()
            .map(|status| status.as_str().to_string())
            .collect()
    }

    /// 在事务内执行带重试的条件预订
    ///
    /// `FOR UPDATE` 子查询在候选行被并发修改后可能返回空，此时只要仍有主机
    /// 有余量就重新选择。
    async fn reserve_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        required_mb: i64,
    ) -> Result<Option<WorkerHost>> {
        let sql = format!("{RESERVE_SQL} RETURNING {HOST_COLUMNS}");

        for attempt in 1..=self.retry_attempts {
            let row = sqlx::query(&sql)
                .bind(required_mb)
                .fetch_optional(&mut **tx)
                .await
                .map_err(FleetError::Database)?;

            if let Some(row) = row {
                return Ok(Some(Self::row_to_host(&row)?));
            }

            let has_headroom: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM worker_hosts WHERE status = 'active' AND ram_total_mb - ram_used_mb >= $1)",
            )
            .bind(required_mb)
            .fetch_one(&mut **tx)
            .await
            .map_err(FleetError::Database)?;

            if !has_headroom {
                return Ok(None);
            }
            debug!("候选主机已被并发预订占用，重新选择 (第{}次)", attempt);
        }

        warn!("预订 {}MB 重试 {} 次后仍未成功", required_mb, self.retry_attempts);
        Ok(None)
    }

    async fn lock_tenant_status(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
    ) -> Result<(TenantStatus, Option<String>)> {
        let row = sqlx::query(
            "SELECT status, assigned_host_id FROM tenants WHERE id = $1 FOR UPDATE",
        )
        .bind(tenant_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(FleetError::Database)?
        .ok_or_else(|| FleetError::TenantNotFound {
            id: tenant_id.to_string(),
        })?;

        Ok((row.try_get("status")?, row.try_get("assigned_host_id")?))
    }
}

#[async_trait]
impl HostRepository for PostgresHostRepository {
    async fn register(&self, registration: &HostRegistration) -> Result<RegisteredHost> {
        let candidate = WorkerHost::new(registration.clone());
        let sql = format!(
            r#"
            INSERT INTO worker_hosts (id, address, hostname, ram_total_mb, ram_used_mb, status, provider_id, registered_at, last_seen_at)
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $7)
            ON CONFLICT (address) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                ram_total_mb = EXCLUDED.ram_total_mb,
                provider_id = COALESCE(EXCLUDED.provider_id, worker_hosts.provider_id),
                last_seen_at = EXCLUDED.last_seen_at,
                status = CASE WHEN worker_hosts.status = 'offline' THEN 'active' ELSE worker_hosts.status END
            RETURNING {HOST_COLUMNS}, (xmax = 0) AS inserted
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&candidate.id)
            .bind(&candidate.address)
            .bind(&candidate.hostname)
            .bind(candidate.ram_total_mb)
            .bind(candidate.status)
            .bind(&candidate.provider_id)
            .bind(candidate.registered_at)
            .fetch_one(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        let host = Self::row_to_host(&row)?;
        let is_new: bool = row.try_get("inserted")?;
        debug!("主机注册成功: {} ({}), 首次注册: {}", host.id, host.address, is_new);
        Ok(RegisteredHost { host, is_new })
    }

    async fn get_by_id(&self, host_id: &str) -> Result<Option<WorkerHost>> {
        let sql = format!("SELECT {HOST_COLUMNS} FROM worker_hosts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        row.as_ref().map(Self::row_to_host).transpose()
    }

    async fn list(&self) -> Result<Vec<WorkerHost>> {
        let sql = format!("SELECT {HOST_COLUMNS} FROM worker_hosts ORDER BY registered_at ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        rows.iter().map(Self::row_to_host).collect()
    }

    async fn reserve(&self, required_mb: i64) -> Result<Option<WorkerHost>> {
        let mut tx = self.pool.begin().await.map_err(FleetError::Database)?;
        let host = self.reserve_in_tx(&mut tx, required_mb).await?;
        tx.commit().await.map_err(FleetError::Database)?;
        Ok(host)
    }

    async fn reserve_for_tenant(
        &self,
        tenant_id: &str,
        required_mb: i64,
        container_name: &str,
    ) -> Result<TenantReservation> {
        let mut tx = self.pool.begin().await.map_err(FleetError::Database)?;

        let (status, _) = Self::lock_tenant_status(&mut tx, tenant_id).await?;
        if status != TenantStatus::Pending {
            tx.rollback().await.map_err(FleetError::Database)?;
            return Ok(TenantReservation::NotPending(status));
        }

        let Some(host) = self.reserve_in_tx(&mut tx, required_mb).await? else {
            tx.rollback().await.map_err(FleetError::Database)?;
            return Ok(TenantReservation::Exhausted);
        };

        let sql = format!(
            r#"
            UPDATE tenants
            SET status = 'provisioning', assigned_host_id = $2, container_name = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {TENANT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(&host.id)
            .bind(container_name)
            .fetch_one(&mut *tx)
            .await
            .map_err(FleetError::Database)?;
        let tenant: Tenant = row_to_tenant(&row)?;

        tx.commit().await.map_err(FleetError::Database)?;
        debug!("租户 {} 预订 {}MB 于主机 {}", tenant_id, required_mb, host.id);
        Ok(TenantReservation::Assigned { host, tenant })
    }

    async fn wake_on_assigned_host(
        &self,
        tenant_id: &str,
        required_mb: i64,
    ) -> Result<WakeReservation> {
        let mut tx = self.pool.begin().await.map_err(FleetError::Database)?;

        let (status, host_id) = Self::lock_tenant_status(&mut tx, tenant_id).await?;
        if status != TenantStatus::Sleeping {
            tx.rollback().await.map_err(FleetError::Database)?;
            return Ok(WakeReservation::NotSleeping(status));
        }
        let host_id = host_id.ok_or_else(|| {
            FleetError::Internal(format!("休眠租户 {tenant_id} 没有绑定主机"))
        })?;

        let sql = format!("SELECT {HOST_COLUMNS} FROM worker_hosts WHERE id = $1 FOR UPDATE");
        let host_row = sqlx::query(&sql)
            .bind(&host_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(FleetError::Database)?
            .ok_or_else(|| FleetError::HostNotFound { id: host_id.clone() })?;
        let host = Self::row_to_host(&host_row)?;

        if host.headroom_mb() < required_mb {
            tx.rollback().await.map_err(FleetError::Database)?;
            return Ok(WakeReservation::InsufficientCapacity {
                host_id,
                required_mb,
            });
        }

        let sql = format!(
            "UPDATE worker_hosts SET ram_used_mb = ram_used_mb + $2 WHERE id = $1 RETURNING {HOST_COLUMNS}"
        );
        let host_row = sqlx::query(&sql)
            .bind(&host_id)
            .bind(required_mb)
            .fetch_one(&mut *tx)
            .await
            .map_err(FleetError::Database)?;
        let host = Self::row_to_host(&host_row)?;

        let sql = format!(
            r#"
            UPDATE tenants
            SET status = 'active', last_active_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'sleeping'
            RETURNING {TENANT_COLUMNS}
            "#
        );
        let tenant_row = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(FleetError::Database)?;
        let tenant = row_to_tenant(&tenant_row)?;

        tx.commit().await.map_err(FleetError::Database)?;
        Ok(WakeReservation::Claimed { host, tenant })
    }

    async fn recompute_ram(&self, host_id: &str, plans: &PlanRamTable) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await.map_err(FleetError::Database)?;

        // 先锁主机行，再在新语句中读取租户快照
        let locked = sqlx::query("SELECT id FROM worker_hosts WHERE id = $1 FOR UPDATE")
            .bind(host_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(FleetError::Database)?;
        if locked.is_none() {
            tx.rollback().await.map_err(FleetError::Database)?;
            return Ok(None);
        }

        let rows = sqlx::query(
            r#"
            SELECT plan_tier, COUNT(*) AS tenant_count
            FROM tenants
            WHERE assigned_host_id = $1 AND status = ANY($2)
            GROUP BY plan_tier
            "#,
        )
        .bind(host_id)
        .bind(Self::booked_statuses())
        .fetch_all(&mut *tx)
        .await
        .map_err(FleetError::Database)?;

        let mut booked = 0i64;
        for row in &rows {
            let plan: String = row.try_get("plan_tier")?;
            let plan = plan
                .parse::<PlanTier>()
                .map_err(FleetError::Serialization)?;
            let count: i64 = row.try_get("tenant_count")?;
            booked += plans.ram_for(plan) * count;
        }

        sqlx::query("UPDATE worker_hosts SET ram_used_mb = $2 WHERE id = $1")
            .bind(host_id)
            .bind(booked)
            .execute(&mut *tx)
            .await
            .map_err(FleetError::Database)?;

        tx.commit().await.map_err(FleetError::Database)?;
        debug!("主机 {} 预订内存重新计算为 {}MB", host_id, booked);
        Ok(Some(booked))
    }

    async fn has_headroom(&self, required_mb: i64) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM worker_hosts WHERE status = 'active' AND ram_total_mb - ram_used_mb >= $1)",
        )
        .bind(required_mb)
        .fetch_one(&self.pool)
        .await
        .map_err(FleetError::Database)?;

        Ok(exists)
    }

    async fn set_status(&self, host_id: &str, status: HostStatus) -> Result<Option<WorkerHost>> {
        let sql =
            format!("UPDATE worker_hosts SET status = $2 WHERE id = $1 RETURNING {HOST_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(host_id)
            .bind(status)
            .fetch_optional(&self.pool)
            .await
            .map_err(FleetError::Database)?;

        row.as_ref().map(Self::row_to_host).transpose()
    }

    async fn record_probe(
        &self,
        host_id: &str,
        measured_ram_used_mb: Option<i64>,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE worker_hosts
            SET last_seen_at = $2,
                measured_ram_used_mb = COALESCE($3, measured_ram_used_mb)
            WHERE id = $1
            "#,
        )
        .bind(host_id)
        .bind(seen_at)
        .bind(measured_ram_used_mb)
        .execute(&self.pool)
        .await
        .map_err(FleetError::Database)?;

        Ok(())
    }

    async fn remove_if_unassigned(&self, host_id: &str) -> Result<HostRemoval> {
        let mut tx = self.pool.begin().await.map_err(FleetError::Database)?;

        let locked = sqlx::query("SELECT id FROM worker_hosts WHERE id = $1 FOR UPDATE")
            .bind(host_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(FleetError::Database)?;
        if locked.is_none() {
            tx.rollback().await.map_err(FleetError::Database)?;
            return Ok(HostRemoval::NotFound);
        }

        let assigned: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tenants WHERE assigned_host_id = $1 AND status <> 'purged'",
        )
        .bind(host_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(FleetError::Database)?;
        if assigned > 0 {
            tx.rollback().await.map_err(FleetError::Database)?;
            return Ok(HostRemoval::InUse { assigned });
        }

        let sql = format!("DELETE FROM worker_hosts WHERE id = $1 RETURNING {HOST_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(host_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(FleetError::Database)?;
        let host = Self::row_to_host(&row)?;

        tx.commit().await.map_err(FleetError::Database)?;
        debug!("主机已移除: {}", host_id);
        Ok(HostRemoval::Removed(host))
    }
}
