//! # config::provider 模块说明
//!
//! 配置提供方是核心消费的外部协作者：它负责真正与集群对话（引导、轮询、
//! 推送），核心只消费两样东西——最新快照与“快照变了”的信号。
//!
//! 热流语义用 `tokio::sync::watch` 表达：慢消费者不会堆积历史配置，
//! 永远只看到最新一份（latest-wins），这正是拓扑收敛想要的合并行为。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::ClusterConfig;
use crate::error::CoreError;

/// 配置提供方契约。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - [`configs`](Self::configs) 返回热流接收端；订阅方通过
///     `changed().await` 感知更新，用 `borrow_and_update()` 取最新快照；
///   - [`config`](Self::config) 同步返回当前快照，与流内容一致；
///   - [`shutdown`](Self::shutdown) 完成后不再发布新快照；实现方必须在
///     停机路径上发布一份**空快照**，驱动收敛器断连所有节点；
/// - **风险 (Trade-offs)**：`watch` 会合并快速连续的更新，订阅方不能假设
///   看到每一份中间配置——这是规格要求的合并语义，不是缺陷。
#[async_trait]
pub trait ConfigurationProvider: Send + Sync + fmt::Debug {
    /// 配置热流；可多次调用，各自获得独立接收端。
    fn configs(&self) -> watch::Receiver<Arc<ClusterConfig>>;

    /// 当前快照。
    fn config(&self) -> Arc<ClusterConfig>;

    /// 打开桶并开始维护其配置。
    async fn open_bucket(&self, name: &str) -> Result<(), CoreError>;

    /// 关闭桶并停止维护其配置。
    async fn close_bucket(&self, name: &str) -> Result<(), CoreError>;

    /// 装载并持续刷新全局配置。
    ///
    /// 失败以 [`CoreError`] 返回，核心会沿 cause 链归类后仅发事件。
    async fn load_and_refresh_global_config(&self) -> Result<(), CoreError>;

    /// 停机；完成后流静默。
    async fn shutdown(&self) -> Result<(), CoreError>;
}
