//! # node 模块说明
//!
//! ## 角色定位（Why）
//! - 节点是拓扑收敛的基本单元：核心独占持有节点集，节点独占持有其上启用
//!   的服务实例；
//! - 注册表键为 (服务类型, 可选桶)：键值面按桶分服务实例，HTTP 面集群级
//!   复用一个实例。
//!
//! ## 设计要求（What）
//! - `add_service`/`remove_service` 幂等，重复收敛不产生副作用；
//! - 断连是单向闸门：`disconnect` 之后的 `add_service` 一律空操作，防止
//!   收敛与停机竞态时复活已判死的节点。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::context::CoreContext;
use crate::core::Core;
use crate::error::CoreError;
use crate::request::Request;
use crate::retry::{self, RetryReason};
use crate::service::{
    registry_key, Service, ServiceDiagnostics, ServiceKey, ServiceScope, ServiceState, ServiceType,
};

/// 节点身份：主机名 + 管理端口。
///
/// 同一主机跑多个节点（单机多进程部署）靠管理端口区分，因此端口参与
/// 身份判等。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NodeIdentifier {
    address: String,
    management_port: u16,
}

impl NodeIdentifier {
    pub fn new(address: impl Into<String>, management_port: u16) -> Self {
        Self {
            address: address.into(),
            management_port,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn management_port(&self) -> u16 {
        self.management_port
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.management_port)
    }
}

/// 存活节点：身份、生效主机名与服务注册表。
#[derive(Debug)]
pub struct Node {
    ctx: CoreContext,
    identifier: NodeIdentifier,
    alternate_hostname: Option<String>,
    services: RwLock<HashMap<ServiceKey, Arc<Service>>>,
    disconnecting: AtomicBool,
}

impl Node {
    pub fn new(
        ctx: CoreContext,
        identifier: NodeIdentifier,
        alternate_hostname: Option<String>,
    ) -> Self {
        Self {
            ctx,
            identifier,
            alternate_hostname,
            services: RwLock::new(HashMap::new()),
            disconnecting: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &NodeIdentifier {
        &self.identifier
    }

    /// 服务连接使用的主机名：备选地址优先。
    pub fn hostname(&self) -> &str {
        self.alternate_hostname
            .as_deref()
            .unwrap_or_else(|| self.identifier.address())
    }

    /// 启用（或确认已启用）一个服务。
    ///
    /// 幂等：同键服务已存在时直接返回。创建与插入在锁内完成，连接在
    /// 锁外进行，避免写锁横跨 await 点。
    pub async fn add_service(
        &self,
        service_type: ServiceType,
        port: u16,
        bucket: Option<&str>,
    ) -> Result<(), CoreError> {
        if self.disconnecting.load(Ordering::Acquire) {
            tracing::debug!(
                target: "reef::node",
                node = %self.identifier,
                service = service_type.ident(),
                "ignoring add_service on a disconnecting node"
            );
            return Ok(());
        }

        let key = registry_key(service_type, bucket);
        let to_connect = {
            let mut services = self.services.write();
            if services.contains_key(&key) {
                None
            } else {
                let service = Arc::new(Service::new(
                    self.ctx.clone(),
                    service_type,
                    self.hostname(),
                    port,
                    key.1.clone(),
                ));
                services.insert(key, Arc::clone(&service));
                Some(service)
            }
        };

        match to_connect {
            Some(service) => service.connect().await,
            None => Ok(()),
        }
    }

    /// 停用一个服务；不存在时为空操作。
    pub async fn remove_service(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Result<(), CoreError> {
        let key = registry_key(service_type, bucket);
        let removed = self.services.write().remove(&key);
        if let Some(service) = removed {
            service.disconnect().await;
        }
        Ok(())
    }

    /// 派发：按请求的服务类型与桶找到服务实例。
    pub fn send(&self, core: &Core, request: Arc<dyn Request>) {
        let bucket = match request.service_type().scope() {
            ServiceScope::Bucket => request.bucket().map(str::to_string),
            ServiceScope::Cluster => None,
        };
        let key = (request.service_type(), bucket);
        let service = self.services.read().get(&key).cloned();
        match service {
            Some(service) => service.send(core, request),
            None => retry::maybe_retry(core, request, RetryReason::ServiceNotAvailable),
        }
    }

    /// 该服务类型是否在任意桶上启用。
    pub fn service_enabled(&self, service_type: ServiceType) -> bool {
        self.services
            .read()
            .keys()
            .any(|(st, _)| *st == service_type)
    }

    pub fn has_services_enabled(&self) -> bool {
        !self.services.read().is_empty()
    }

    /// 指定 (服务, 桶) 的聚合状态。
    pub fn service_state(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Option<ServiceState> {
        let key = registry_key(service_type, bucket);
        self.services.read().get(&key).map(|s| s.state())
    }

    /// 断开节点上的所有服务。此后该节点不再接受 `add_service`。
    pub async fn disconnect(&self) {
        self.disconnecting.store(true, Ordering::Release);
        let drained: Vec<_> = self.services.write().drain().map(|(_, s)| s).collect();
        for service in drained {
            service.disconnect().await;
        }
    }

    pub fn diagnostics(&self) -> NodeDiagnostics {
        NodeDiagnostics {
            identifier: self.identifier.clone(),
            services: self
                .services
                .read()
                .values()
                .map(|s| s.diagnostics())
                .collect(),
        }
    }
}

/// 节点诊断视图。
#[derive(Clone, Debug)]
pub struct NodeDiagnostics {
    pub identifier: NodeIdentifier,
    pub services: Vec<ServiceDiagnostics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::{AnonymousAuthenticator, CoreContext};
    use crate::environment::CoreEnvironment;

    fn ctx() -> CoreContext {
        CoreContext::new(
            CoreEnvironment::builder().build(),
            Arc::new(AnonymousAuthenticator),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn add_service_is_idempotent() {
        let node = Node::new(ctx(), NodeIdentifier::new("10.0.0.1", 8091), None);
        node.add_service(ServiceType::KeyValue, 11210, Some("travel"))
            .await
            .unwrap();
        node.add_service(ServiceType::KeyValue, 11210, Some("travel"))
            .await
            .unwrap();
        assert!(node.service_enabled(ServiceType::KeyValue));
        assert_eq!(node.services.read().len(), 1);
    }

    #[tokio::test]
    async fn bucket_scoping_separates_kv_instances() {
        let node = Node::new(ctx(), NodeIdentifier::new("10.0.0.1", 8091), None);
        node.add_service(ServiceType::KeyValue, 11210, Some("travel"))
            .await
            .unwrap();
        node.add_service(ServiceType::KeyValue, 11210, Some("beer"))
            .await
            .unwrap();
        node.add_service(ServiceType::Query, 8093, Some("travel"))
            .await
            .unwrap();
        assert_eq!(node.services.read().len(), 3);
        // 集群级服务忽略桶维度。
        assert!(
            node.service_state(ServiceType::Query, Some("beer"))
                .is_some()
        );
    }

    #[tokio::test]
    async fn disconnect_gates_future_service_adds() {
        let node = Node::new(ctx(), NodeIdentifier::new("10.0.0.1", 8091), None);
        node.add_service(ServiceType::Manager, 8091, None)
            .await
            .unwrap();
        node.disconnect().await;
        assert!(!node.has_services_enabled());
        node.add_service(ServiceType::Manager, 8091, None)
            .await
            .unwrap();
        assert!(!node.has_services_enabled());
    }

    #[tokio::test]
    async fn alternate_hostname_wins_for_connections() {
        let node = Node::new(
            ctx(),
            NodeIdentifier::new("10.0.0.1", 8091),
            Some("203.0.113.9".into()),
        );
        assert_eq!(node.hostname(), "203.0.113.9");
        node.add_service(ServiceType::Manager, 8091, None)
            .await
            .unwrap();
        let diag = node.diagnostics();
        assert_eq!(diag.services[0].remote, "203.0.113.9:8091");
    }
}
