//! Fleet Dispatcher
//!
//! 容量分配与容器生命周期编排的核心组件：
//! 容量登记、主机创建协调、容器生命周期、宽限期调度、失控任务看门狗、
//! 主机健康检查，以及把它们组合在一起的 `FleetController`。

pub mod capacity_registry;
pub mod commands;
pub mod controller;
pub mod grace_period;
pub mod host_health_monitor;
pub mod lease;
pub mod lifecycle;
pub mod provisioning;
pub mod runaway_monitor;

pub use capacity_registry::{CapacityRegistry, FleetCapacity};
pub use controller::{FleetController, FleetDependencies};
pub use grace_period::{GracePeriodScheduler, GraceStage, GraceSweepReport};
pub use host_health_monitor::{HostHealthMonitor, HostHealthReport};
pub use lifecycle::{ContainerLifecycleManager, SleepDecision, SleepSweepReport, WakeOutcome};
pub use provisioning::{ProvisioningCoordinator, ProvisioningFailure};
pub use runaway_monitor::RunawayTaskMonitor;
