//! # locator 模块说明
//!
//! ## 角色定位（Why）
//! - 定位器把“一个请求”映射到“一个节点上的一个服务”：键值面按分区哈希
//!   定点路由，HTTP 面在具备服务的节点间轮转；
//! - 路由失败不是终态：节点未注册、桶配置未到都可能只是拓扑尚未收敛，
//!   交给重试编排按策略重投。
//!
//! ## 设计要求（What）
//! - 调度表静态：服务类型 → 定位器单例；枚举闭合使“未知服务类型”在
//!   编译期即不可表达；
//! - 定位器自身无请求级状态，轮转游标是唯一的共享可变量（原子自增）。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::ClusterConfig;
use crate::core::Core;
use crate::error::CoreError;
use crate::node::{Node, NodeIdentifier};
use crate::request::kv::KeyValueRequest;
use crate::request::Request;
use crate::retry::{self, RetryReason};
use crate::service::ServiceType;

/// 单服务类型的路由策略。
pub trait Locator: Send + Sync + fmt::Debug {
    /// 把请求派发到合适的 (节点, 服务)。
    ///
    /// `nodes` 是派发时刻的不可变快照；`config` 是当前配置快照。本方法
    /// 非阻塞，失败经重试编排或请求汇点送达。
    fn dispatch(
        &self,
        request: Arc<dyn Request>,
        nodes: &[Arc<Node>],
        config: &ClusterConfig,
        core: &Core,
    );
}

/// 静态调度表：服务类型 → 定位器单例。
///
/// 键值走分区哈希；查询/检索/管理/分析按各自游标轮转（分析的
/// “仅限启用分析的节点”约束即服务存在性过滤本身）；视图在轮转之上
/// 追加“节点须承载请求的桶”约束。
pub fn locator_for(service_type: ServiceType) -> &'static dyn Locator {
    static KV: KeyValueLocator = KeyValueLocator;
    static QUERY: RoundRobinLocator = RoundRobinLocator::new(ServiceType::Query);
    static SEARCH: RoundRobinLocator = RoundRobinLocator::new(ServiceType::Search);
    static ANALYTICS: RoundRobinLocator = RoundRobinLocator::new(ServiceType::Analytics);
    static MANAGER: RoundRobinLocator = RoundRobinLocator::new(ServiceType::Manager);
    static VIEWS: ViewLocator = ViewLocator::new();

    match service_type {
        ServiceType::KeyValue => &KV,
        ServiceType::Query => &QUERY,
        ServiceType::Search => &SEARCH,
        ServiceType::Analytics => &ANALYTICS,
        ServiceType::Manager => &MANAGER,
        ServiceType::Views => &VIEWS,
    }
}

/// 键的分区归属：CRC32 取高半字折叠后对分区数取模。
pub fn partition_for_key(key: &[u8], num_partitions: u16) -> u16 {
    let crc = crc32fast::hash(key);
    (((crc >> 16) & 0x7fff) % u32::from(num_partitions)) as u16
}

/// 键值定位器：分区哈希 → 主节点 → 桶上的键值服务。
#[derive(Debug)]
pub struct KeyValueLocator;

impl KeyValueLocator {
    /// 纯路由判定，借用在本函数内结束，便于之后移动请求句柄。
    fn route(
        request: &KeyValueRequest,
        config: &ClusterConfig,
    ) -> Result<NodeIdentifier, RetryReason> {
        let bucket = config
            .bucket(request.collection().bucket())
            .ok_or(RetryReason::BucketConfigNotAvailable)?;
        let partitions = bucket.partitions();
        if partitions.num_partitions() == 0 {
            return Err(RetryReason::BucketConfigNotAvailable);
        }
        let partition = partition_for_key(request.key(), partitions.num_partitions());
        request.bind_partition(partition);
        let index = partitions
            .active_node_index(partition)
            .ok_or(RetryReason::NodeNotAvailable)?;
        let info = bucket
            .nodes()
            .get(index)
            .ok_or(RetryReason::NodeNotAvailable)?;
        Ok(info.identifier().clone())
    }
}

impl Locator for KeyValueLocator {
    fn dispatch(
        &self,
        request: Arc<dyn Request>,
        nodes: &[Arc<Node>],
        config: &ClusterConfig,
        core: &Core,
    ) {
        let routing = {
            let Some(kv) = request.as_any().downcast_ref::<KeyValueRequest>() else {
                request.fail(CoreError::InvalidArgument {
                    detail: "key-value locator requires a key-value request".into(),
                });
                return;
            };
            Self::route(kv, config)
        };

        match routing {
            Ok(target) => {
                match nodes.iter().find(|node| *node.identifier() == target) {
                    Some(node) => node.send(core, request),
                    // 配置领先于节点集：节点还没被收敛进来。
                    None => retry::maybe_retry(core, request, RetryReason::NodeNotAvailable),
                }
            }
            Err(reason) => retry::maybe_retry(core, request, reason),
        }
    }
}

/// 轮转定位器：在启用目标服务的节点间原子游标轮转。
#[derive(Debug)]
pub struct RoundRobinLocator {
    service_type: ServiceType,
    cursor: AtomicUsize,
}

impl RoundRobinLocator {
    pub const fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            cursor: AtomicUsize::new(0),
        }
    }

    fn dispatch_filtered(
        &self,
        request: Arc<dyn Request>,
        nodes: &[Arc<Node>],
        core: &Core,
        eligible: impl Fn(&Node) -> bool,
    ) {
        let candidates: Vec<&Arc<Node>> = nodes
            .iter()
            .filter(|node| node.service_enabled(self.service_type) && eligible(node))
            .collect();
        if candidates.is_empty() {
            retry::maybe_retry(core, request, RetryReason::ServiceNotAvailable);
            return;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[index].send(core, request);
    }
}

impl Locator for RoundRobinLocator {
    fn dispatch(
        &self,
        request: Arc<dyn Request>,
        nodes: &[Arc<Node>],
        _config: &ClusterConfig,
        core: &Core,
    ) {
        self.dispatch_filtered(request, nodes, core, |_| true);
    }
}

/// 视图定位器：轮转之上要求节点承载请求的桶。
///
/// 视图读取的是节点本地的设计文档与分区数据，路由到不承载该桶的节点
/// 只会得到 404。
#[derive(Debug)]
pub struct ViewLocator {
    inner: RoundRobinLocator,
}

impl ViewLocator {
    pub const fn new() -> Self {
        Self {
            inner: RoundRobinLocator::new(ServiceType::Views),
        }
    }
}

impl Locator for ViewLocator {
    fn dispatch(
        &self,
        request: Arc<dyn Request>,
        nodes: &[Arc<Node>],
        config: &ClusterConfig,
        core: &Core,
    ) {
        let Some(bucket_name) = request.bucket().map(str::to_string) else {
            request.fail(CoreError::InvalidArgument {
                detail: "view requests must carry a bucket".into(),
            });
            return;
        };
        let Some(bucket) = config.bucket(&bucket_name) else {
            retry::maybe_retry(core, request, RetryReason::BucketConfigNotAvailable);
            return;
        };
        self.inner.dispatch_filtered(request, nodes, core, |node| {
            bucket.contains_node(node.identifier())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_and_in_range() {
        let first = partition_for_key(b"user:42", 1024);
        let second = partition_for_key(b"user:42", 1024);
        assert_eq!(first, second);
        assert!(first < 1024);
    }

    #[test]
    fn partitions_spread_over_the_space() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..256 {
            let key = format!("doc-{i}");
            seen.insert(partition_for_key(key.as_bytes(), 64));
        }
        // CRC32 折叠后 256 个键不可能塌缩到个位数分区。
        assert!(seen.len() > 16, "only {} distinct partitions", seen.len());
    }

    #[test]
    fn every_service_type_has_a_locator() {
        for service in ServiceType::ALL {
            let _ = locator_for(service);
        }
    }
}
