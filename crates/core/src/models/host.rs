use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 工作主机信息
///
/// `ram_used_mb` 是预订量而非实测值：它等于分配到该主机且处于预订状态的
/// 租户套餐内存之和。实测内存只写入 `measured_ram_used_mb`，仅用于诊断展示。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerHost {
    pub id: String,
    pub address: String,
    pub hostname: String,
    pub ram_total_mb: i64,
    pub ram_used_mb: i64,
    pub measured_ram_used_mb: Option<i64>,
    pub status: HostStatus,
    pub provider_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// 主机状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Active,
    Provisioning,
    Draining,
    Offline,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Active => "active",
            HostStatus::Provisioning => "provisioning",
            HostStatus::Draining => "draining",
            HostStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(HostStatus::Active),
            "provisioning" => Ok(HostStatus::Provisioning),
            "draining" => Ok(HostStatus::Draining),
            "offline" => Ok(HostStatus::Offline),
            _ => Err(format!("Invalid host status: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for HostStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for HostStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(s.parse::<HostStatus>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for HostStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 主机自注册请求（由主机启动回调发起）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRegistration {
    pub address: String,
    pub ram_total_mb: i64,
    pub hostname: String,
    #[serde(default)]
    pub provider_id: Option<String>,
}

/// 注册结果，`is_new` 表示这是该主机的首次注册
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredHost {
    pub host: WorkerHost,
    pub is_new: bool,
}

impl WorkerHost {
    /// 根据注册请求创建新的主机信息
    pub fn new(registration: HostRegistration) -> Self {
        let now = Utc::now();
        Self {
            id: format!("host-{}", uuid::Uuid::new_v4().simple()),
            address: registration.address,
            hostname: registration.hostname,
            ram_total_mb: registration.ram_total_mb,
            ram_used_mb: 0,
            measured_ram_used_mb: None,
            status: HostStatus::Active,
            provider_id: registration.provider_id,
            registered_at: now,
            last_seen_at: now,
        }
    }

    pub fn headroom_mb(&self) -> i64 {
        self.ram_total_mb - self.ram_used_mb
    }

    /// 主机是否可以接纳指定内存的预订
    pub fn can_reserve(&self, required_mb: i64) -> bool {
        self.status == HostStatus::Active && self.headroom_mb() >= required_mb
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.ram_total_mb == 0 {
            0.0
        } else {
            (self.ram_used_mb as f64 / self.ram_total_mb as f64) * 100.0
        }
    }
}

/// 装箱选择：在可接纳的主机中挑选预订量最高的一台，相同时取注册最早的
///
/// 保持空闲主机为空，便于后续回收。
pub fn pick_fullest_fit(hosts: &[WorkerHost], required_mb: i64) -> Option<&WorkerHost> {
    hosts
        .iter()
        .filter(|host| host.can_reserve(required_mb))
        .max_by(|a, b| {
            a.ram_used_mb
                .cmp(&b.ram_used_mb)
                .then_with(|| b.registered_at.cmp(&a.registered_at))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn host(id: &str, total: i64, used: i64, status: HostStatus) -> WorkerHost {
        let now = Utc::now();
        WorkerHost {
            id: id.to_string(),
            address: format!("10.0.0.{}", id.len()),
            hostname: id.to_string(),
            ram_total_mb: total,
            ram_used_mb: used,
            measured_ram_used_mb: None,
            status,
            provider_id: None,
            registered_at: now,
            last_seen_at: now,
        }
    }

    #[test]
    fn test_pick_fullest_fit_prefers_busiest_host() {
        let hosts = vec![
            host("empty", 8192, 0, HostStatus::Active),
            host("busy", 8192, 6144, HostStatus::Active),
            host("half", 8192, 4096, HostStatus::Active),
        ];

        let selected = pick_fullest_fit(&hosts, 2048).unwrap();
        assert_eq!(selected.id, "busy");

        // busy 放不下 4096，选择 half
        let selected = pick_fullest_fit(&hosts, 4096).unwrap();
        assert_eq!(selected.id, "half");
    }

    #[test]
    fn test_pick_fullest_fit_skips_inactive_hosts() {
        let hosts = vec![
            host("draining", 8192, 4096, HostStatus::Draining),
            host("offline", 8192, 6000, HostStatus::Offline),
            host("active", 8192, 1024, HostStatus::Active),
        ];

        let selected = pick_fullest_fit(&hosts, 1024).unwrap();
        assert_eq!(selected.id, "active");
        assert!(pick_fullest_fit(&hosts, 8000).is_none());
    }

    #[test]
    fn test_pick_fullest_fit_tie_breaks_on_oldest() {
        let mut older = host("older", 8192, 2048, HostStatus::Active);
        older.registered_at = Utc::now() - Duration::hours(2);
        let newer = host("newer", 8192, 2048, HostStatus::Active);

        let hosts = vec![newer, older];
        assert_eq!(pick_fullest_fit(&hosts, 1024).unwrap().id, "older");
    }

    #[test]
    fn test_exact_fit_is_allowed() {
        let h = host("a", 8192, 6144, HostStatus::Active);
        assert!(h.can_reserve(2048));
        assert!(!h.can_reserve(2049));
        assert_eq!(h.headroom_mb(), 2048);
    }

    #[test]
    fn test_host_status_round_trip_str() {
        for status in [
            HostStatus::Active,
            HostStatus::Provisioning,
            HostStatus::Draining,
            HostStatus::Offline,
        ] {
            assert_eq!(status.as_str().parse::<HostStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<HostStatus>().is_err());
    }
}
