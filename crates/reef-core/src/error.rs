//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为调度与拓扑核心提供集中定义的稳定错误域，所有同步校验失败、调度失败与
//!   流式解析失败最终都汇聚到 [`CoreError`]；
//! - 细粒度变体支撑精确的告警、重试与取消策略，避免上层解析字符串推断语义。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，与 `std::error::Error` 生态兼容；
//! - 可恢复与不可恢复场景区分清晰：取消类错误携带 [`CancellationReason`]，
//!   配置类错误允许挂载底层 `source` 以便根因分类；
//! - 全局配置刷新失败通过 [`GlobalConfigFailure::classify`] 沿 cause 链归类，
//!   分类结果只进事件总线，永不向调用方抛出。
//!
//! ## 风险提示（Trade-offs）
//! - 变体携带 `String` 上下文，牺牲少量堆分配换取排障可读性；
//! - cause 链上的装箱错误使 `CoreError` 不可 `Clone`，需要二次投递的路径
//!   （如行流终止 + 请求失败）应各自构造实例。

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::retry::RetryReason;

/// 请求被取消时的原因标记。
///
/// # 教案式说明
/// - **意图 (Why)**：取消是请求生命周期的终态之一，原因需要机读以驱动
///   指标与日志分流（超时告警与主动停机不应混在一起）。
/// - **契约 (What)**：`Copy` 语义，可安全嵌入错误、事件与诊断上下文；
///   [`NoMoreRetries`](CancellationReason::NoMoreRetries) 额外携带触发重试
///   判定的 [`RetryReason`]。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancellationReason {
    /// 截止时间到期，由计时器触发。
    Timeout,
    /// 核心已停机或正在停机。
    Shutdown,
    /// 同一操作已在其它通道完成，本次投递作废。
    RetriedElsewhere,
    /// 响应通道在完成前失效（对端关闭、连接断开）。
    StoppedListening,
    /// 重试策略拒绝继续，携带最后一次的重试原因。
    NoMoreRetries(RetryReason),
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancellationReason::Timeout => f.write_str("timeout"),
            CancellationReason::Shutdown => f.write_str("shutdown"),
            CancellationReason::RetriedElsewhere => f.write_str("retried elsewhere"),
            CancellationReason::StoppedListening => f.write_str("stopped listening"),
            CancellationReason::NoMoreRetries(reason) => {
                write!(f, "no more retries ({reason})")
            }
        }
    }
}

/// 集群客户端核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合键编码、路由调度、配置刷新与流式解析等关键路径的
///   异常形态，供完成汇点（completion sink）单次投递。
/// - **契约 (What)**：
///   - 所有变体 `Send + Sync + 'static`，可跨线程传播；
///   - 同步校验错误（键超长、未知集合、TLS 与认证器不匹配）在调用点直接
///     返回；调度与流式错误经由请求汇点异步送达；
///   - `source` 链保持完整，供 [`GlobalConfigFailure::classify`] 做根因归类。
/// - **风险 (Trade-offs)**：变体集合刻意保持开放（非穷举语义由调用方约定），
///   新增路径优先复用现有变体，避免告警维度膨胀。
#[derive(Debug, Error)]
pub enum CoreError {
    /// 调用方传入了非法参数（包括环境与认证器的 TLS 能力不匹配）。
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// 键与集合前缀的总长度超出协议上限。
    #[error("key is too long ({length} > {max} bytes including collection prefix)")]
    KeyTooLong { length: usize, max: usize },

    /// 通道集合映射中找不到请求的集合。
    #[error("collection `{name}` not found in the channel collection map")]
    CollectionNotFound { name: String },

    /// 当前连接不具备请求所需能力（如未协商集合支持）。
    #[error("feature not available: {detail}")]
    FeatureNotAvailable { detail: String },

    /// 请求在完成前被取消。
    #[error("request cancelled: {reason}")]
    RequestCanceled { reason: CancellationReason },

    /// 配置装载或解析失败。
    #[error("config failure: {detail}")]
    Config {
        detail: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    /// 集群未暴露全局配置。
    #[error("global config not found on this cluster")]
    GlobalConfigNotFound,

    /// 集群不支持请求的配置获取机制。
    #[error("unsupported config mechanism: {mechanism}")]
    UnsupportedConfigMechanism { mechanism: String },

    /// 凭据被集群拒绝。
    #[error("authentication failure: {detail}")]
    AuthenticationFailure { detail: String },

    /// 核心已经停机，新的操作被拒绝。
    #[error("core already shut down")]
    AlreadyShutDown,

    /// 入站消息不符合协议约定，连接需要关闭。
    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    /// 流式响应体解析失败。
    #[error("decoding failure: {detail}")]
    DecodingFailure { detail: String },

    /// 服务端在流式信封中返回的业务错误。
    #[error("request failed on the server (code {code}): {message}")]
    RequestFailed { code: i64, message: String },

    /// 无法归类的内部异常，兜底变体。
    #[error("generic failure: {detail}")]
    Generic {
        detail: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

impl CoreError {
    /// 以纯文本上下文构造兜底错误。
    pub fn generic(detail: impl Into<String>) -> Self {
        CoreError::Generic {
            detail: detail.into(),
            source: None,
        }
    }

    /// 构造带底层原因的配置错误，保持 cause 链可遍历。
    pub fn config_with_cause(
        detail: impl Into<String>,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        CoreError::Config {
            detail: detail.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// 判断错误是否为取消终态，便于调度层跳过重复投递。
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CoreError::RequestCanceled { .. })
    }
}

/// `load_and_refresh_global_config` 失败时的归类结果。
///
/// # 教案式说明
/// - **意图 (Why)**：全局配置刷新失败不向调用方抛出，只发布
///   `InitGlobalConfigFailed` 事件；事件消费方（日志、补救逻辑）需要稳定的
///   机读原因而非异常文本。
/// - **契约 (What)**：[`classify`](Self::classify) 沿 `source` 链向根部遍历，
///   取**最深**一个可识别的 `CoreError` 形态作为结论；链上不存在可识别
///   形态时返回 [`Unknown`](Self::Unknown)。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GlobalConfigFailure {
    /// 集群不支持全局配置机制（老版本服务端）。
    Unsupported,
    /// 集群可达但未返回任何配置。
    NoConfigFound,
    /// 凭据不足，访问被拒绝。
    NoAccess,
    /// 刷新发生在停机路径上，属预期噪声。
    Shutdown,
    /// 其余未归类失败。
    Unknown,
}

impl GlobalConfigFailure {
    /// 沿 cause 链归类一次全局配置刷新失败。
    ///
    /// 遍历顺序从外层包装到根因；越深的结论越接近真实故障源，
    /// 因此后出现的识别结果覆盖先出现的。
    pub fn classify(error: &CoreError) -> Self {
        let mut verdict = Self::recognize(error).unwrap_or(GlobalConfigFailure::Unknown);
        let mut cursor: Option<&(dyn StdError + 'static)> = error.source();
        while let Some(err) = cursor {
            if let Some(core) = err.downcast_ref::<CoreError>() {
                if let Some(kind) = Self::recognize(core) {
                    verdict = kind;
                }
            }
            cursor = err.source();
        }
        verdict
    }

    fn recognize(error: &CoreError) -> Option<Self> {
        match error {
            CoreError::UnsupportedConfigMechanism { .. } => Some(GlobalConfigFailure::Unsupported),
            CoreError::GlobalConfigNotFound => Some(GlobalConfigFailure::NoConfigFound),
            CoreError::AuthenticationFailure { .. } => Some(GlobalConfigFailure::NoAccess),
            CoreError::AlreadyShutDown
            | CoreError::RequestCanceled {
                reason: CancellationReason::Shutdown,
            } => Some(GlobalConfigFailure::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for GlobalConfigFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalConfigFailure::Unsupported => f.write_str("unsupported"),
            GlobalConfigFailure::NoConfigFound => f.write_str("no config found"),
            GlobalConfigFailure::NoAccess => f.write_str("no access"),
            GlobalConfigFailure::Shutdown => f.write_str("shutdown"),
            GlobalConfigFailure::Unknown => f.write_str("unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 停机取消被包装两层后仍应归类为 `Shutdown`（根因优先）。
    #[test]
    fn classify_walks_to_the_deepest_recognizable_cause() {
        let root = CoreError::RequestCanceled {
            reason: CancellationReason::Shutdown,
        };
        let wrapped = CoreError::config_with_cause("refresh aborted", root);
        let outer = CoreError::Generic {
            detail: "global config load failed".into(),
            source: Some(Box::new(wrapped)),
        };
        assert_eq!(
            GlobalConfigFailure::classify(&outer),
            GlobalConfigFailure::Shutdown
        );
    }

    #[test]
    fn classify_falls_back_to_unknown() {
        let err = CoreError::generic("socket reset");
        assert_eq!(
            GlobalConfigFailure::classify(&err),
            GlobalConfigFailure::Unknown
        );
    }

    #[test]
    fn cancellation_reason_renders_stable_text() {
        assert_eq!(CancellationReason::Timeout.to_string(), "timeout");
        assert_eq!(CancellationReason::Shutdown.to_string(), "shutdown");
    }
}
