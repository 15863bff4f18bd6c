use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 租户（一个客户独立的智能体实例及其生命周期状态）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: String,
    pub plan_tier: PlanTier,
    pub status: TenantStatus,
    pub assigned_host_id: Option<String>,
    pub container_name: Option<String>,
    pub contact: String,
    pub channels: Vec<ChannelKind>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// 租户状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Pending,
    Provisioning,
    Starting,
    Active,
    Sleeping,
    Paused,
    Cancelled,
    GracePeriod,
    Purged,
}

impl TenantStatus {
    /// 占用主机内存预订的状态集合（容器正在运行或即将运行）
    pub const BOOKED: [TenantStatus; 4] = [
        TenantStatus::Provisioning,
        TenantStatus::Starting,
        TenantStatus::Active,
        TenantStatus::GracePeriod,
    ];

    /// 可以被显式取消的状态
    pub const CANCELLABLE: [TenantStatus; 7] = [
        TenantStatus::Pending,
        TenantStatus::Provisioning,
        TenantStatus::Starting,
        TenantStatus::Active,
        TenantStatus::Sleeping,
        TenantStatus::Paused,
        TenantStatus::GracePeriod,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Pending => "pending",
            TenantStatus::Provisioning => "provisioning",
            TenantStatus::Starting => "starting",
            TenantStatus::Active => "active",
            TenantStatus::Sleeping => "sleeping",
            TenantStatus::Paused => "paused",
            TenantStatus::Cancelled => "cancelled",
            TenantStatus::GracePeriod => "grace_period",
            TenantStatus::Purged => "purged",
        }
    }

    pub fn is_booked(&self) -> bool {
        Self::BOOKED.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TenantStatus::Cancelled | TenantStatus::Purged)
    }

    /// 容器应该在运行的状态
    pub fn expects_running_container(&self) -> bool {
        matches!(
            self,
            TenantStatus::Starting | TenantStatus::Active | TenantStatus::GracePeriod
        )
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TenantStatus::Pending),
            "provisioning" => Ok(TenantStatus::Provisioning),
            "starting" => Ok(TenantStatus::Starting),
            "active" => Ok(TenantStatus::Active),
            "sleeping" => Ok(TenantStatus::Sleeping),
            "paused" => Ok(TenantStatus::Paused),
            "cancelled" => Ok(TenantStatus::Cancelled),
            "grace_period" => Ok(TenantStatus::GracePeriod),
            "purged" => Ok(TenantStatus::Purged),
            _ => Err(format!("Invalid tenant status: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for TenantStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TenantStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(s.parse::<TenantStatus>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TenantStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 套餐等级，对应的预订内存由配置中的静态套餐表决定
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Starter,
    Pro,
    Business,
}

impl PlanTier {
    pub const ALL: [PlanTier; 3] = [PlanTier::Starter, PlanTier::Pro, PlanTier::Business];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Business => "business",
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starter" => Ok(PlanTier::Starter),
            "pro" => Ok(PlanTier::Pro),
            "business" => Ok(PlanTier::Business),
            _ => Err(format!("Invalid plan tier: {s}")),
        }
    }
}

/// 套餐预订内存表（MB）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanRamTable {
    pub starter_mb: i64,
    pub pro_mb: i64,
    pub business_mb: i64,
}

impl Default for PlanRamTable {
    fn default() -> Self {
        Self {
            starter_mb: 1024,
            pro_mb: 2048,
            business_mb: 4096,
        }
    }
}

impl PlanRamTable {
    pub fn ram_for(&self, plan: PlanTier) -> i64 {
        match plan {
            PlanTier::Starter => self.starter_mb,
            PlanTier::Pro => self.pro_mb,
            PlanTier::Business => self.business_mb,
        }
    }

    pub fn largest_mb(&self) -> i64 {
        PlanTier::ALL
            .iter()
            .map(|plan| self.ram_for(*plan))
            .max()
            .unwrap_or(0)
    }
}

/// 租户接入的消息渠道
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Telegram,
    Discord,
    Slack,
    WhatsApp,
    Web,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Telegram => "telegram",
            ChannelKind::Discord => "discord",
            ChannelKind::Slack => "slack",
            ChannelKind::WhatsApp => "whatsapp",
            ChannelKind::Web => "web",
        }
    }

    /// 需要常驻长连接（轮询或websocket）的渠道，容器休眠会导致消息丢失
    pub fn is_always_on(&self) -> bool {
        !matches!(self, ChannelKind::Web)
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(ChannelKind::Telegram),
            "discord" => Ok(ChannelKind::Discord),
            "slack" => Ok(ChannelKind::Slack),
            "whatsapp" => Ok(ChannelKind::WhatsApp),
            "web" => Ok(ChannelKind::Web),
            _ => Err(format!("Invalid channel kind: {s}")),
        }
    }
}

/// 字段更新语义：设置、置空或保持不变
#[derive(Debug, Clone, PartialEq, Default)]
pub enum UpdateValue<T> {
    Set(T),
    Unset,
    #[default]
    NoChange,
}

impl<T> UpdateValue<T> {
    pub fn is_change(&self) -> bool {
        !matches!(self, UpdateValue::NoChange)
    }

    /// 转换为 (是否修改, 新值) 二元组，便于SQL绑定
    pub fn as_binding(&self) -> (bool, Option<&T>) {
        match self {
            UpdateValue::Set(value) => (true, Some(value)),
            UpdateValue::Unset => (true, None),
            UpdateValue::NoChange => (false, None),
        }
    }

    pub fn apply_to(self, field: &mut Option<T>) {
        match self {
            UpdateValue::Set(value) => *field = Some(value),
            UpdateValue::Unset => *field = None,
            UpdateValue::NoChange => {}
        }
    }
}

/// 条件状态转换请求
///
/// 只有当租户当前状态属于 `from` 时才会生效；存储层返回 `None` 表示
/// 没有行被修改（其他调用方已经完成了转换）。
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub tenant_id: String,
    pub from: Vec<TenantStatus>,
    pub to: TenantStatus,
    pub grace_period_end: UpdateValue<DateTime<Utc>>,
    pub cancelled_at: UpdateValue<DateTime<Utc>>,
    /// 仅当 `last_active_at` 不晚于该时间时转换
    pub idle_since: Option<DateTime<Utc>>,
    /// 仅当 `updated_at` 不晚于该时间时转换
    pub updated_before: Option<DateTime<Utc>>,
}

impl StatusTransition {
    pub fn new(tenant_id: &str, from: &[TenantStatus], to: TenantStatus) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            from: from.to_vec(),
            to,
            grace_period_end: UpdateValue::NoChange,
            cancelled_at: UpdateValue::NoChange,
            idle_since: None,
            updated_before: None,
        }
    }

    /// 要求转换时租户自 `cutoff` 起没有新的活跃记录
    pub fn idle_since(mut self, cutoff: DateTime<Utc>) -> Self {
        self.idle_since = Some(cutoff);
        self
    }

    /// 要求转换时租户在 `cutoff` 之后没有被其他调用方修改
    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    pub fn with_grace_period_end(mut self, value: UpdateValue<DateTime<Utc>>) -> Self {
        self.grace_period_end = value;
        self
    }

    pub fn with_cancelled_at(mut self, value: UpdateValue<DateTime<Utc>>) -> Self {
        self.cancelled_at = value;
        self
    }

    /// 在内存中应用转换（存储层实现与测试共用）
    pub fn apply(&self, tenant: &mut Tenant, now: DateTime<Utc>) -> bool {
        if !self.from.contains(&tenant.status) {
            return false;
        }
        if self.idle_since.is_some_and(|cutoff| tenant.last_active_at > cutoff) {
            return false;
        }
        if self.updated_before.is_some_and(|cutoff| tenant.updated_at > cutoff) {
            return false;
        }
        tenant.status = self.to;
        self.grace_period_end
            .clone()
            .apply_to(&mut tenant.grace_period_end);
        self.cancelled_at.clone().apply_to(&mut tenant.cancelled_at);
        tenant.updated_at = now;
        true
    }
}

/// 新租户注册信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTenant {
    pub id: String,
    pub plan_tier: PlanTier,
    pub contact: String,
    #[serde(default)]
    pub channels: Vec<ChannelKind>,
}

impl Tenant {
    pub fn new(new_tenant: NewTenant) -> Self {
        let now = Utc::now();
        Self {
            id: new_tenant.id,
            plan_tier: new_tenant.plan_tier,
            status: TenantStatus::Pending,
            assigned_host_id: None,
            container_name: None,
            contact: new_tenant.contact,
            channels: new_tenant.channels,
            last_active_at: now,
            created_at: now,
            grace_period_end: None,
            cancelled_at: None,
            updated_at: now,
        }
    }

    /// 默认容器名
    pub fn default_container_name(tenant_id: &str) -> String {
        format!("agent-{tenant_id}")
    }

    pub fn has_always_on_channel(&self) -> bool {
        self.channels.iter().any(ChannelKind::is_always_on)
    }

    pub fn idle_duration(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_active_at
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn container(&self) -> String {
        self.container_name
            .clone()
            .unwrap_or_else(|| Self::default_container_name(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(status: TenantStatus) -> Tenant {
        let mut t = Tenant::new(NewTenant {
            id: "t-1".to_string(),
            plan_tier: PlanTier::Pro,
            contact: "owner@example.com".to_string(),
            channels: vec![],
        });
        t.status = status;
        t
    }

    #[test]
    fn test_booked_set() {
        assert!(TenantStatus::Provisioning.is_booked());
        assert!(TenantStatus::Starting.is_booked());
        assert!(TenantStatus::Active.is_booked());
        assert!(TenantStatus::GracePeriod.is_booked());
        assert!(!TenantStatus::Sleeping.is_booked());
        assert!(!TenantStatus::Paused.is_booked());
        assert!(!TenantStatus::Cancelled.is_booked());
    }

    #[test]
    fn test_always_on_channels() {
        let mut t = tenant(TenantStatus::Active);
        assert!(!t.has_always_on_channel());

        t.channels = vec![ChannelKind::Web];
        assert!(!t.has_always_on_channel());

        t.channels.push(ChannelKind::Telegram);
        assert!(t.has_always_on_channel());
    }

    #[test]
    fn test_transition_only_applies_from_expected_state() {
        let now = Utc::now();
        let transition =
            StatusTransition::new("t-1", &[TenantStatus::Sleeping], TenantStatus::Active);

        let mut sleeping = tenant(TenantStatus::Sleeping);
        assert!(transition.apply(&mut sleeping, now));
        assert_eq!(sleeping.status, TenantStatus::Active);

        // 第二次应用不再生效
        assert!(!transition.apply(&mut sleeping, now));
    }

    #[test]
    fn test_transition_updates_optional_fields() {
        let now = Utc::now();
        let mut t = tenant(TenantStatus::Active);
        let transition =
            StatusTransition::new("t-1", &[TenantStatus::Active], TenantStatus::GracePeriod)
                .with_grace_period_end(UpdateValue::Set(now + Duration::days(7)));

        assert!(transition.apply(&mut t, now));
        assert_eq!(t.grace_period_end, Some(now + Duration::days(7)));

        let clear = StatusTransition::new("t-1", &[TenantStatus::GracePeriod], TenantStatus::Active)
            .with_grace_period_end(UpdateValue::Unset);
        assert!(clear.apply(&mut t, now));
        assert_eq!(t.grace_period_end, None);
    }

    #[test]
    fn test_transition_guards() {
        let now = Utc::now();
        let cutoff = now - Duration::minutes(30);

        let sleep = StatusTransition::new("t-1", &[TenantStatus::Active], TenantStatus::Sleeping)
            .idle_since(cutoff);
        let mut touched = tenant(TenantStatus::Active);
        touched.last_active_at = now;
        assert!(!sleep.apply(&mut touched, now));
        assert_eq!(touched.status, TenantStatus::Active);

        let mut idle = tenant(TenantStatus::Active);
        idle.last_active_at = cutoff - Duration::minutes(1);
        assert!(sleep.apply(&mut idle, now));

        let retry = StatusTransition::new("t-1", &[TenantStatus::Starting], TenantStatus::Starting)
            .updated_before(cutoff);
        let mut stalled = tenant(TenantStatus::Starting);
        stalled.updated_at = cutoff - Duration::minutes(1);
        assert!(retry.apply(&mut stalled, now));
        // 第一次重试刷新了 updated_at，同一批次的第二次重试失败
        assert!(!retry.apply(&mut stalled, now));
    }

    #[test]
    fn test_plan_ram_table_defaults() {
        let table = PlanRamTable::default();
        assert_eq!(table.ram_for(PlanTier::Starter), 1024);
        assert_eq!(table.ram_for(PlanTier::Pro), 2048);
        assert_eq!(table.largest_mb(), 4096);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "grace_period".parse::<TenantStatus>().unwrap(),
            TenantStatus::GracePeriod
        );
        assert_eq!(TenantStatus::GracePeriod.to_string(), "grace_period");
        assert!("bogus".parse::<TenantStatus>().is_err());
    }
}
