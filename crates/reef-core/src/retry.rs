//! # retry 模块说明
//!
//! ## 角色定位（Why）
//! - 调度期失败（节点未注册、服务未启用、桶配置缺失）不是终态：拓扑可能正在
//!   收敛，稍后重投往往就会成功。是否重投、隔多久重投由请求携带的策略决定；
//! - 编排器负责执行策略结论：重投走 `Core::send_with(request, false)`，
//!   **不重复注册计时器**，原始截止时间始终有效。
//!
//! ## 设计要求（What）
//! - 策略接口保持同步、无阻塞；延迟由编排器用运行时定时任务实现；
//! - 策略拒绝时请求以 [`CancellationReason::NoMoreRetries`] 取消，原因随错误
//!   送达调用方。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::Core;
use crate::error::CancellationReason;
use crate::request::Request;

/// 触发重试判定的调度期原因。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RetryReason {
    /// 分区归属的节点尚未出现在存活节点集中。
    NodeNotAvailable,
    /// 目标节点上尚无匹配的服务。
    ServiceNotAvailable,
    /// 服务存在但暂无可用端点。
    EndpointNotAvailable,
    /// 请求的桶还没有配置快照。
    BucketConfigNotAvailable,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::NodeNotAvailable => f.write_str("node not available"),
            RetryReason::ServiceNotAvailable => f.write_str("service not available"),
            RetryReason::EndpointNotAvailable => f.write_str("endpoint not available"),
            RetryReason::BucketConfigNotAvailable => f.write_str("bucket config not available"),
        }
    }
}

/// 策略对单次失败给出的结论。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// 等待给定时长后重投。
    RetryAfter(Duration),
    /// 放弃，由编排器取消请求。
    Fail,
}

/// 重试策略注入点，每个请求各自携带一份。
///
/// # 教案式说明
/// - **契约 (What)**：`should_retry` 必须快速返回，禁止在其中做 IO；
///   判定输入是请求只读视图与本次失败原因，重试计数从请求上读取；
/// - **风险 (Trade-offs)**：策略与请求解耦意味着同一策略实例会被并发调用，
///   实现需无内部可变状态或自行同步。
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    fn should_retry(&self, request: &dyn Request, reason: RetryReason) -> RetryDecision;
}

/// 默认策略：按重试次数做受控指数退避，封顶 500ms，直到截止时间耗尽。
#[derive(Debug, Default)]
pub struct BestEffortRetryStrategy;

impl BestEffortRetryStrategy {
    const CAP_MILLIS: u64 = 500;

    /// 第 `attempt` 次重试的退避时长：1ms 起步，指数增长，封顶 500ms。
    fn backoff(attempt: u32) -> Duration {
        let exp = attempt.min(16);
        Duration::from_millis((1u64 << exp).min(Self::CAP_MILLIS))
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn should_retry(&self, request: &dyn Request, _reason: RetryReason) -> RetryDecision {
        RetryDecision::RetryAfter(Self::backoff(request.common().retry_attempts()))
    }
}

/// 永不重试的策略，调度失败立即回报调用方。
#[derive(Debug, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn should_retry(&self, _request: &dyn Request, _reason: RetryReason) -> RetryDecision {
        RetryDecision::Fail
    }
}

/// 重试编排入口：执行策略结论。
///
/// - 已完成的请求直接忽略（重试路径与完成路径存在天然竞态）；
/// - 重投通过 `send_with(request, false)` 回到调度器，跳过计时器注册与
///   before-send 回调；
/// - 策略拒绝时以 `NoMoreRetries` 取消。
pub fn maybe_retry(core: &Core, request: Arc<dyn Request>, reason: RetryReason) {
    if request.common().completed() {
        return;
    }
    match request.retry_strategy().should_retry(request.as_ref(), reason) {
        RetryDecision::RetryAfter(delay) => {
            request.common().note_retry_attempt();
            let core = core.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                core.send_with(request, false);
            });
        }
        RetryDecision::Fail => {
            request.cancel(CancellationReason::NoMoreRetries(reason));
        }
    }
}
