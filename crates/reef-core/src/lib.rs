#![deny(unsafe_code)]
#![doc = "reef-core: 分布式文档数据库集群客户端的请求调度与拓扑收敛核心。"]
#![doc = ""]
#![doc = "== 职责边界 =="]
#![doc = "核心做四件事：把请求派发到正确节点的正确服务（键值分区哈希、HTTP 轮转）；"]
#![doc = "消费配置热流并把存活节点集收敛到最新快照（串行、合并、幂等）；"]
#![doc = "把分块 HTTP 响应解析成 `header + rows* + trailer` 的流式交付；"]
#![doc = "以及键值请求的成帧基座（opaque、集合前缀、分区绑定、键长裁决）。"]
#![doc = ""]
#![doc = "== 不做什么 =="]
#![doc = "面向用户的集合/桶/集群门面、文档编解码、认证握手、TLS 装配、具体线缆字节"]
#![doc = "布局都在核心之外，经 trait seam 注入或由上层组合。"]

pub mod config;
pub mod context;
pub mod core;
pub mod environment;
pub mod error;
pub mod events;
pub mod io;
pub mod locator;
pub mod metrics;
pub mod node;
pub mod request;
pub mod retry;
pub mod service;
pub mod status;
/// 官方测试替身命名空间；集成测试与下游调用方复用，避免各处重复定义桩对象。
pub mod test_support;
pub mod timer;
mod topology;

pub use crate::config::provider::ConfigurationProvider;
pub use crate::config::{
    AlternateAddress, BucketConfig, ClusterConfig, EffectiveNodeAddress, GlobalConfig, NodeInfo,
    PartitionMap,
};
pub use crate::context::{
    AnonymousAuthenticator, Authenticator, CertificateAuthenticator, CoreContext,
};
pub use crate::core::{BeforeSendCallback, Core};
pub use crate::environment::{
    CoreEnvironment, CoreEnvironmentBuilder, IoConfig, NetworkResolution, SecurityConfig,
};
pub use crate::error::{CancellationReason, CoreError, GlobalConfigFailure};
pub use crate::events::{CoreEvent, EventBus, EventSeverity, TracingEventBus};
pub use crate::io::chunk::{
    ChunkHeader, ChunkParser, ChunkTrailer, ChunkedRequest, ChunkedResponseHandler,
    JsonEnvelopeParser, RowStream, TrailerReceiver,
};
pub use crate::io::{HttpInbound, HttpRequestHead, IoContext};
pub use crate::locator::{
    locator_for, partition_for_key, KeyValueLocator, Locator, RoundRobinLocator, ViewLocator,
};
pub use crate::metrics::{
    Meter, ResponseMetricIdentifier, ValueRecorder, OPERATIONS_METER_NAME,
};
pub use crate::node::{Node, NodeDiagnostics, NodeIdentifier};
pub use crate::request::kv::{
    CollectionIdentifier, DurabilityLevel, KeyValueRequest, KvChannelContext, KvResponseEnvelope,
    MAX_KEY_LENGTH,
};
pub use crate::request::{
    CompletionReceiver, CompletionSink, Request, RequestCommon, RequestState,
};
pub use crate::retry::{
    BestEffortRetryStrategy, FailFastRetryStrategy, RetryDecision, RetryReason, RetryStrategy,
};
pub use crate::service::endpoint::{
    Endpoint, EndpointFactory, EndpointState, UnboundEndpointFactory,
};
pub use crate::service::{
    Service, ServiceDiagnostics, ServiceScope, ServiceState, ServiceType,
};
pub use crate::status::ResponseStatus;
pub use crate::timer::Timer;
