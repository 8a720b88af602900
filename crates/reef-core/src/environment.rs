//! # environment 模块说明
//!
//! ## 角色定位（Why）
//! - 环境对象承载核心运行所需的全部注入件：事件总线、仪表、端点工厂、
//!   计时器与安全/IO 配置，一次构造、到处共享（`Arc`）；
//! - 与请求级参数（超时、重试策略）严格分离：环境是进程级别的慢变量。
//!
//! ## 设计要求（What）
//! - Builder 风格装配，未显式设置的注入件落到安全默认值
//!   （`tracing` 事件总线、空操作仪表、未绑定传输的端点工厂）；
//! - 环境本身不做合法性裁决；TLS 配置与认证器的匹配检查发生在
//!   [`CoreContext::new`](crate::context::CoreContext::new)，因为认证器不属于环境。

use std::sync::Arc;

use crate::events::{EventBus, TracingEventBus};
use crate::metrics::{Meter, NoopMeter};
use crate::service::endpoint::{EndpointFactory, UnboundEndpointFactory};
use crate::timer::Timer;

/// 网络地址族选择：决定节点生效地址取主表还是备选表。
///
/// 备选地址（alternate address）服务于 NAT 之后或跨网段的客户端：
/// 集群配置按节点携带一张命名网络表，客户端声明自己所处的网络名。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum NetworkResolution {
    /// 使用节点主地址与主端口表。
    #[default]
    Default,
    /// 使用指定命名网络的备选地址表（常见名为 `external`）。
    Named(String),
}

impl NetworkResolution {
    /// 返回备选网络名；`Default` 时为 `None`。
    pub fn alternate_name(&self) -> Option<&str> {
        match self {
            NetworkResolution::Default => None,
            NetworkResolution::Named(name) => Some(name.as_str()),
        }
    }
}

/// 安全面配置。只承载“是否启用 TLS”这一决策；证书装载属外层关注点。
#[derive(Clone, Debug, Default)]
pub struct SecurityConfig {
    tls_enabled: bool,
}

impl SecurityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls_enabled(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }
}

/// IO 面配置：网络选择与每服务端点池大小。
#[derive(Clone, Debug)]
pub struct IoConfig {
    network: NetworkResolution,
    endpoints_per_service: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            network: NetworkResolution::Default,
            endpoints_per_service: 1,
        }
    }
}

impl IoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(mut self, network: NetworkResolution) -> Self {
        self.network = network;
        self
    }

    /// 每个服务实例持有的端点数量；最小为 1。
    pub fn with_endpoints_per_service(mut self, count: usize) -> Self {
        self.endpoints_per_service = count.max(1);
        self
    }

    pub fn network(&self) -> &NetworkResolution {
        &self.network
    }

    pub fn endpoints_per_service(&self) -> usize {
        self.endpoints_per_service
    }
}

/// 核心环境：进程级注入件与慢变量配置的聚合体。
#[derive(Debug)]
pub struct CoreEnvironment {
    event_bus: Arc<dyn EventBus>,
    meter: Arc<dyn Meter>,
    endpoint_factory: Arc<dyn EndpointFactory>,
    timer: Arc<Timer>,
    security: SecurityConfig,
    io: IoConfig,
}

impl CoreEnvironment {
    pub fn builder() -> CoreEnvironmentBuilder {
        CoreEnvironmentBuilder::default()
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.event_bus
    }

    pub fn meter(&self) -> &Arc<dyn Meter> {
        &self.meter
    }

    pub fn endpoint_factory(&self) -> &Arc<dyn EndpointFactory> {
        &self.endpoint_factory
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    pub fn io(&self) -> &IoConfig {
        &self.io
    }
}

/// 环境装配器。
#[derive(Debug, Default)]
pub struct CoreEnvironmentBuilder {
    event_bus: Option<Arc<dyn EventBus>>,
    meter: Option<Arc<dyn Meter>>,
    endpoint_factory: Option<Arc<dyn EndpointFactory>>,
    security: SecurityConfig,
    io: Option<IoConfig>,
}

impl CoreEnvironmentBuilder {
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn endpoint_factory(mut self, factory: Arc<dyn EndpointFactory>) -> Self {
        self.endpoint_factory = Some(factory);
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    pub fn io(mut self, io: IoConfig) -> Self {
        self.io = Some(io);
        self
    }

    pub fn build(self) -> Arc<CoreEnvironment> {
        Arc::new(CoreEnvironment {
            event_bus: self
                .event_bus
                .unwrap_or_else(|| Arc::new(TracingEventBus)),
            meter: self.meter.unwrap_or_else(|| Arc::new(NoopMeter)),
            endpoint_factory: self
                .endpoint_factory
                .unwrap_or_else(|| Arc::new(UnboundEndpointFactory)),
            timer: Arc::new(Timer::new()),
            security: self.security,
            io: self.io.unwrap_or_default(),
        })
    }
}
