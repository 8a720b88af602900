//! # service::endpoint 模块说明
//!
//! 端点是服务连接池中的单条连接。具体的传输绑定（套接字、编解码管线）
//! 在核心之外，经 [`EndpointFactory`] 注入；核心只约定连接生命周期与
//! 派发入口。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::request::Request;
use crate::service::ServiceType;

/// 端点连接状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// 单条连接的契约。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `send` 非阻塞：实现将请求压入自己的发送管线后立即返回，完成经
///     请求汇点异步送达；调用方在 `send` 前已写入派发元数据；
///   - `connect`/`disconnect` 幂等；断开后未完成的在途请求由实现取消。
#[async_trait]
pub trait Endpoint: Send + Sync + fmt::Debug {
    async fn connect(&self) -> Result<(), CoreError>;

    async fn disconnect(&self);

    fn state(&self) -> EndpointState;

    fn send(&self, request: Arc<dyn Request>);

    /// 对端地址，`host:port`。
    fn remote(&self) -> String;
}

/// 端点工厂注入点：按 (服务, 主机, 端口, 桶) 产出连接。
pub trait EndpointFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        ctx: &CoreContext,
        service_type: ServiceType,
        hostname: &str,
        port: u16,
        bucket: Option<&str>,
    ) -> Arc<dyn Endpoint>;
}

/// 默认工厂：产出未绑定传输的端点。
///
/// 环境未注入真实传输时的安全缺省——拓扑收敛照常运转，任何真正到达
/// 端点的请求都会以明确错误完成，而不是悬挂。
#[derive(Debug, Default)]
pub struct UnboundEndpointFactory;

impl EndpointFactory for UnboundEndpointFactory {
    fn create(
        &self,
        _ctx: &CoreContext,
        _service_type: ServiceType,
        hostname: &str,
        port: u16,
        _bucket: Option<&str>,
    ) -> Arc<dyn Endpoint> {
        Arc::new(UnboundEndpoint {
            remote: format!("{hostname}:{port}"),
            state: parking_lot::Mutex::new(EndpointState::Disconnected),
        })
    }
}

#[derive(Debug)]
struct UnboundEndpoint {
    remote: String,
    state: parking_lot::Mutex<EndpointState>,
}

#[async_trait]
impl Endpoint for UnboundEndpoint {
    async fn connect(&self) -> Result<(), CoreError> {
        *self.state.lock() = EndpointState::Connected;
        Ok(())
    }

    async fn disconnect(&self) {
        *self.state.lock() = EndpointState::Disconnected;
    }

    fn state(&self) -> EndpointState {
        *self.state.lock()
    }

    fn send(&self, request: Arc<dyn Request>) {
        request.fail(CoreError::generic(format!(
            "endpoint {} is not bound to a transport",
            self.remote
        )));
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }
}
