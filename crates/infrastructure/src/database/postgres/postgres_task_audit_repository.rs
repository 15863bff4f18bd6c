use async_trait::async_trait;
use fleet_core::{
    errors::{FleetError, Result},
    models::{TaskAuditRecord, WatchdogAction},
    traits::TaskAuditRepository,
};
use sqlx::{PgPool, Row};

/// PostgreSQL 看门狗审计记录仓储
pub struct PostgresTaskAuditRepository {
    pool: PgPool,
}

impl PostgresTaskAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TaskAuditRecord> {
        let action = match row.try_get::<String, _>("action")?.as_str() {
            "kill" => WatchdogAction::Kill,
            "pause" => WatchdogAction::Pause,
            other => {
                return Err(FleetError::Serialization(format!(
                    "未知的看门狗动作: {other}"
                )))
            }
        };
        let recent_actions: serde_json::Value = row.try_get("recent_actions")?;
        let tokens_used: i64 = row.try_get("tokens_used")?;

        Ok(TaskAuditRecord {
            tenant_id: row.try_get("tenant_id")?,
            task_id: row.try_get("task_id")?,
            action,
            reason: row.try_get("reason")?,
            runtime_secs: row.try_get("runtime_secs")?,
            tokens_used: tokens_used.max(0) as u64,
            recent_actions: serde_json::from_value(recent_actions)?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

#[async_trait]
impl TaskAuditRepository for PostgresTaskAuditRepository {
    async fn record(&self, record: &TaskAuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_audit_log (tenant_id, task_id, action, reason, runtime_secs, tokens_used, recent_actions, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&record.task_id)
        .bind(record.action.as_str())
        .bind(&record.reason)
        .bind(record.runtime_secs)
        .bind(i64::try_from(record.tokens_used).unwrap_or(i64::MAX))
        .bind(serde_json::to_value(&record.recent_actions)?)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(FleetError::Database)?;

        Ok(())
    }

    async fn list_for_task(&self, tenant_id: &str, task_id: &str) -> Result<Vec<TaskAuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, task_id, action, reason, runtime_secs, tokens_used, recent_actions, recorded_at
            FROM task_audit_log
            WHERE tenant_id = $1 AND task_id = $2
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(FleetError::Database)?;

        rows.iter().map(Self::row_to_record).collect()
    }
}
