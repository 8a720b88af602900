//! # events 模块说明
//!
//! ## 角色定位（Why）
//! - 核心的所有运营性状态变化（桶开闭、拓扑收敛、停机）以**类型化事件**对外
//!   广播，而不是散落的日志语句，便于测试断言与外部聚合；
//! - 事件总线是注入点：默认实现桥接到 `tracing`，测试替身可完整捕获。
//!
//! ## 设计要求（What）
//! - [`CoreEvent`] 为闭合枚举，变体集合与对外契约一一对应；
//! - 每个事件自带默认严重级别（[`CoreEvent::severity`]），个别事件（如
//!   `BucketOpenFailed`）按上下文覆盖级别——停机中失败降级为 `Debug`；
//! - `publish` 不允许阻塞，也不允许向调用方抛错。

use std::fmt;
use std::time::Duration;

use crate::error::GlobalConfigFailure;
use crate::node::NodeIdentifier;
use crate::service::ServiceType;

/// 事件默认严重级别，映射到 `tracing` 的日志层级。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum EventSeverity {
    Debug,
    Info,
    Warn,
    Error,
}

/// 核心对外广播的类型化事件全集。
///
/// # 教案式说明
/// - **契约 (What)**：变体携带的上下文足以独立成一条告警（桶名、耗时、
///   失败详情），事件本身不保留错误对象，只保留渲染后的文本；
/// - **风险 (Trade-offs)**：文本化牺牲了下游再分类能力，换取事件可
///   `Clone`、可跨线程自由投递。
#[derive(Clone, Debug, PartialEq)]
pub enum CoreEvent {
    /// 核心构造完成，携带实例标识。
    CoreCreated { core_id: u64 },
    /// 桶打开流程启动。
    BucketOpenInitiated { name: String },
    /// 桶打开成功。
    BucketOpened { name: String, elapsed: Duration },
    /// 桶打开失败；停机路径上的失败降级为 `Debug`。
    BucketOpenFailed {
        name: String,
        severity: EventSeverity,
        detail: String,
    },
    /// 桶关闭完成。
    BucketClosed { name: String },
    /// 全局配置初始化失败（已归类，不向调用方抛出）。
    InitGlobalConfigFailed { reason: GlobalConfigFailure },
    /// 停机流程启动。
    ShutdownInitiated,
    /// 停机流程完成。
    ShutdownCompleted { elapsed: Duration },
    /// 一轮拓扑收敛成功结束。
    ReconfigurationCompleted { elapsed: Duration },
    /// 一轮拓扑收敛以错误结束（下一份配置会再次驱动收敛）。
    ReconfigurationErrorDetected { detail: String },
    /// 已有收敛在执行，本次触发被合并。
    ReconfigurationIgnored,
    /// 单个服务的增删失败被吞掉，不阻断整轮收敛。
    ServiceReconfigurationFailed {
        node: NodeIdentifier,
        service: ServiceType,
        detail: String,
    },
}

impl CoreEvent {
    /// 事件的默认严重级别。
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::CoreCreated { .. }
            | CoreEvent::BucketOpenInitiated { .. }
            | CoreEvent::BucketOpened { .. }
            | CoreEvent::BucketClosed { .. }
            | CoreEvent::ShutdownInitiated
            | CoreEvent::ShutdownCompleted { .. }
            | CoreEvent::ReconfigurationCompleted { .. } => EventSeverity::Debug,
            CoreEvent::ReconfigurationIgnored => EventSeverity::Debug,
            CoreEvent::BucketOpenFailed { severity, .. } => *severity,
            CoreEvent::InitGlobalConfigFailed { reason } => match reason {
                GlobalConfigFailure::Shutdown => EventSeverity::Debug,
                _ => EventSeverity::Warn,
            },
            CoreEvent::ReconfigurationErrorDetected { .. }
            | CoreEvent::ServiceReconfigurationFailed { .. } => EventSeverity::Warn,
        }
    }
}

impl fmt::Display for CoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreEvent::CoreCreated { core_id } => {
                write!(f, "core created (id 0x{core_id:x})")
            }
            CoreEvent::BucketOpenInitiated { name } => write!(f, "bucket `{name}` open initiated"),
            CoreEvent::BucketOpened { name, elapsed } => {
                write!(f, "bucket `{name}` opened in {elapsed:?}")
            }
            CoreEvent::BucketOpenFailed { name, detail, .. } => {
                write!(f, "bucket `{name}` open failed: {detail}")
            }
            CoreEvent::BucketClosed { name } => write!(f, "bucket `{name}` closed"),
            CoreEvent::InitGlobalConfigFailed { reason } => {
                write!(f, "init global config failed: {reason}")
            }
            CoreEvent::ShutdownInitiated => f.write_str("shutdown initiated"),
            CoreEvent::ShutdownCompleted { elapsed } => {
                write!(f, "shutdown completed in {elapsed:?}")
            }
            CoreEvent::ReconfigurationCompleted { elapsed } => {
                write!(f, "reconfiguration completed in {elapsed:?}")
            }
            CoreEvent::ReconfigurationErrorDetected { detail } => {
                write!(f, "reconfiguration error detected: {detail}")
            }
            CoreEvent::ReconfigurationIgnored => f.write_str("reconfiguration ignored"),
            CoreEvent::ServiceReconfigurationFailed {
                node,
                service,
                detail,
            } => write!(
                f,
                "service {service:?} reconfiguration failed on {node}: {detail}"
            ),
        }
    }
}

/// 事件总线注入点。
///
/// 实现必须非阻塞、不抛错；投递失败只能内部消化。
pub trait EventBus: Send + Sync + fmt::Debug {
    fn publish(&self, event: CoreEvent);
}

/// 默认事件总线：按事件级别桥接到 `tracing`。
#[derive(Debug, Default)]
pub struct TracingEventBus;

impl EventBus for TracingEventBus {
    fn publish(&self, event: CoreEvent) {
        match event.severity() {
            EventSeverity::Debug => tracing::debug!(target: "reef::events", "{event}"),
            EventSeverity::Info => tracing::info!(target: "reef::events", "{event}"),
            EventSeverity::Warn => tracing::warn!(target: "reef::events", "{event}"),
            EventSeverity::Error => tracing::error!(target: "reef::events", "{event}"),
        }
    }
}
