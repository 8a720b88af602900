//! # service 模块说明
//!
//! ## 角色定位（Why）
//! - 服务实例封装到特定 (节点, 服务类型, 可选桶) 三元组的连接池；请求从
//!   节点进入服务，服务挑选端点压入其管线；
//! - 服务状态不是独立变量，而是端点状态的聚合视图：全连为 `Connected`，
//!   部分连为 `Degraded`，这样诊断面不会与真实连接情况漂移。
//!
//! ## 设计要求（What)
//! - `connect` 幂等：端点池只建一次，池大小来自环境 IO 配置；
//! - `send` 非阻塞：优先挑 `Connected` 端点（原子游标轮转），全部未就绪
//!   时退而选任意端点让其排队；空池交给重试编排。

pub mod endpoint;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::context::CoreContext;
use crate::core::Core;
use crate::error::CoreError;
use crate::request::Request;
use crate::retry::{self, RetryReason};
use crate::service::endpoint::{Endpoint, EndpointState};

/// 服务类型全集。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ServiceType {
    /// 二进制键值面。
    KeyValue,
    /// 查询服务（HTTP，流式信封）。
    Query,
    /// 视图服务（HTTP，桶相关的路由约束）。
    Views,
    /// 全文检索服务（HTTP）。
    Search,
    /// 分析服务（HTTP，仅限启用分析的节点）。
    Analytics,
    /// 集群管理服务（HTTP）。
    Manager,
}

/// 服务的注册作用域：桶级服务在注册表键里携带桶名。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceScope {
    Bucket,
    Cluster,
}

impl ServiceType {
    /// 遍历所有服务类型；拓扑收敛据此求差集。
    pub const ALL: [ServiceType; 6] = [
        ServiceType::KeyValue,
        ServiceType::Query,
        ServiceType::Views,
        ServiceType::Search,
        ServiceType::Analytics,
        ServiceType::Manager,
    ];

    pub fn scope(&self) -> ServiceScope {
        match self {
            ServiceType::KeyValue => ServiceScope::Bucket,
            _ => ServiceScope::Cluster,
        }
    }

    /// 指标与日志使用的稳定短名。
    pub fn ident(&self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "query",
            ServiceType::Views => "views",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
            ServiceType::Manager => "mgmt",
        }
    }
}

/// 服务聚合状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceState {
    Disconnected,
    Connecting,
    Degraded,
    Connected,
    Disconnecting,
}

/// 服务实例：到 (节点, 服务类型, 可选桶) 的连接池。
#[derive(Debug)]
pub struct Service {
    ctx: CoreContext,
    service_type: ServiceType,
    hostname: String,
    port: u16,
    bucket: Option<String>,
    endpoints: RwLock<Vec<Arc<dyn Endpoint>>>,
    cursor: AtomicUsize,
    disconnecting: AtomicBool,
}

impl Service {
    pub fn new(
        ctx: CoreContext,
        service_type: ServiceType,
        hostname: impl Into<String>,
        port: u16,
        bucket: Option<String>,
    ) -> Self {
        Self {
            ctx,
            service_type,
            hostname: hostname.into(),
            port,
            bucket,
            endpoints: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            disconnecting: AtomicBool::new(false),
        }
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 对端地址，`host:port`。
    pub fn remote(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// 建立端点池并逐个连接；幂等。
    ///
    /// 单个端点连接失败不阻止其余端点建立，最后一个错误向上传递，
    /// 由收敛器折叠成服务级事件。
    pub async fn connect(&self) -> Result<(), CoreError> {
        let created = {
            let mut endpoints = self.endpoints.write();
            if !endpoints.is_empty() {
                Vec::new()
            } else {
                let factory = Arc::clone(self.ctx.environment().endpoint_factory());
                let pool_size = self.ctx.environment().io().endpoints_per_service();
                let created: Vec<_> = (0..pool_size)
                    .map(|_| {
                        factory.create(
                            &self.ctx,
                            self.service_type,
                            &self.hostname,
                            self.port,
                            self.bucket.as_deref(),
                        )
                    })
                    .collect();
                endpoints.extend(created.iter().cloned());
                created
            }
        };

        let mut last_error = None;
        for endpoint in created {
            if let Err(error) = endpoint.connect().await {
                tracing::debug!(
                    target: "reef::service",
                    remote = %endpoint.remote(),
                    service = self.service_type.ident(),
                    "endpoint connect failed: {error}"
                );
                last_error = Some(error);
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// 派发一个请求到池内端点。
    pub fn send(&self, core: &Core, request: Arc<dyn Request>) {
        let endpoint = {
            let endpoints = self.endpoints.read();
            if endpoints.is_empty() {
                None
            } else {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed);
                // 先找就绪端点；全部未就绪时取游标位置的端点排队。
                (0..endpoints.len())
                    .map(|offset| &endpoints[start.wrapping_add(offset) % endpoints.len()])
                    .find(|ep| ep.state() == EndpointState::Connected)
                    .or_else(|| endpoints.get(start % endpoints.len()))
                    .cloned()
            }
        };

        match endpoint {
            Some(endpoint) => {
                request.common().set_last_dispatched_to(endpoint.remote());
                request.common().mark_dispatched();
                endpoint.send(request);
            }
            None => retry::maybe_retry(core, request, RetryReason::EndpointNotAvailable),
        }
    }

    /// 聚合端点状态。
    pub fn state(&self) -> ServiceState {
        if self.disconnecting.load(Ordering::Acquire) {
            return ServiceState::Disconnecting;
        }
        let endpoints = self.endpoints.read();
        if endpoints.is_empty() {
            return ServiceState::Disconnected;
        }
        let connected = endpoints
            .iter()
            .filter(|ep| ep.state() == EndpointState::Connected)
            .count();
        if connected == endpoints.len() {
            ServiceState::Connected
        } else if connected > 0 {
            ServiceState::Degraded
        } else if endpoints
            .iter()
            .any(|ep| ep.state() == EndpointState::Connecting)
        {
            ServiceState::Connecting
        } else {
            ServiceState::Disconnected
        }
    }

    /// 断开池内所有端点；幂等。
    pub async fn disconnect(&self) {
        self.disconnecting.store(true, Ordering::Release);
        let drained: Vec<_> = self.endpoints.write().drain(..).collect();
        for endpoint in drained {
            endpoint.disconnect().await;
        }
    }

    /// 诊断快照：每个端点的当前状态。
    pub fn diagnostics(&self) -> ServiceDiagnostics {
        ServiceDiagnostics {
            service_type: self.service_type,
            bucket: self.bucket.clone(),
            remote: self.remote(),
            state: self.state(),
            endpoints: self.endpoints.read().iter().map(|ep| ep.state()).collect(),
        }
    }
}

/// 服务诊断视图。
#[derive(Clone, Debug)]
pub struct ServiceDiagnostics {
    pub service_type: ServiceType,
    pub bucket: Option<String>,
    pub remote: String,
    pub state: ServiceState,
    pub endpoints: Vec<EndpointState>,
}

/// 注册表键：桶级服务携带桶名，集群级服务不带。
pub(crate) fn registry_key(
    service_type: ServiceType,
    bucket: Option<&str>,
) -> (ServiceType, Option<String>) {
    match service_type.scope() {
        ServiceScope::Bucket => (service_type, bucket.map(str::to_string)),
        ServiceScope::Cluster => (service_type, None),
    }
}

pub(crate) type ServiceKey = (ServiceType, Option<String>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_key_value_is_bucket_scoped() {
        assert_eq!(ServiceType::KeyValue.scope(), ServiceScope::Bucket);
        for service in [
            ServiceType::Query,
            ServiceType::Views,
            ServiceType::Search,
            ServiceType::Analytics,
            ServiceType::Manager,
        ] {
            assert_eq!(service.scope(), ServiceScope::Cluster);
        }
    }

    #[test]
    fn registry_key_drops_bucket_for_cluster_scope() {
        assert_eq!(
            registry_key(ServiceType::Query, Some("travel")),
            (ServiceType::Query, None)
        );
        assert_eq!(
            registry_key(ServiceType::KeyValue, Some("travel")),
            (ServiceType::KeyValue, Some("travel".to_string()))
        );
    }
}
