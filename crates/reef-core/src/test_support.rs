//! # test_support 模块说明
//!
//! 官方维护的测试替身集中地，供集成测试与下游调用方复用：静态配置
//! 提供方、可记录端点/工厂、捕获事件总线、聚合仪表与流式探针请求。
//! 单点维护，核心契约演进时所有测试同步适配。

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::provider::ConfigurationProvider;
use crate::config::{ClusterConfig, PartitionMap};
use crate::context::CoreContext;
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::io::chunk::{ChunkHeader, ChunkedRequest, RowStream, TrailerReceiver};
use crate::io::HttpRequestHead;
use crate::metrics::{Meter, ValueRecorder};
use crate::request::{CompletionReceiver, CompletionSink, Request, RequestCommon};
use crate::retry::BestEffortRetryStrategy;
use crate::service::endpoint::{Endpoint, EndpointFactory, EndpointState};
use crate::service::ServiceType;
use crate::status::ResponseStatus;

/// 捕获式事件总线：按序记录所有事件。
#[derive(Debug, Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<CoreEvent>>,
}

impl RecordingEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().clone()
    }

    /// 满足谓词的事件数量。
    pub fn count(&self, predicate: impl Fn(&CoreEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EventBus for RecordingEventBus {
    fn publish(&self, event: CoreEvent) {
        self.events.lock().push(event);
    }
}

/// 聚合仪表：记录每次打点，便于断言 tag 与取值。
#[derive(Debug, Default)]
pub struct RecordingMeter {
    recorders: Mutex<Vec<(String, Arc<RecordingValueRecorder>)>>,
}

impl RecordingMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn recorder_count(&self) -> usize {
        self.recorders.lock().len()
    }
}

#[derive(Debug, Default)]
pub struct RecordingValueRecorder {
    values: Mutex<Vec<u64>>,
}

impl RecordingValueRecorder {
    pub fn values(&self) -> Vec<u64> {
        self.values.lock().clone()
    }
}

impl ValueRecorder for RecordingValueRecorder {
    fn record(&self, value: u64) {
        self.values.lock().push(value);
    }
}

impl Meter for RecordingMeter {
    fn value_recorder(
        &self,
        name: &'static str,
        tags: std::collections::BTreeMap<&'static str, String>,
    ) -> Arc<dyn ValueRecorder> {
        let recorder = Arc::new(RecordingValueRecorder::default());
        let key = format!("{name}:{tags:?}");
        self.recorders.lock().push((key, Arc::clone(&recorder)));
        recorder
    }
}

/// 可记录端点：请求只入队不外发。
#[derive(Debug)]
pub struct MockEndpoint {
    remote: String,
    state: Mutex<EndpointState>,
    fail_connect: bool,
    connect_delay: Option<Duration>,
    sent: Mutex<Vec<Arc<dyn Request>>>,
}

impl MockEndpoint {
    pub fn sent(&self) -> Vec<Arc<dyn Request>> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    async fn connect(&self) -> Result<(), CoreError> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect {
            return Err(CoreError::generic(format!(
                "synthetic connect failure to {}",
                self.remote
            )));
        }
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
        self.sent.lock().push(request);
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }
}

/// 可记录端点工厂。
///
/// 两个旋钮服务于收敛测试：`fail_connections` 演练单服务失败折叠为事件；
/// `delay_connections` 人为拉长收敛时长，制造触发重叠以检验合并协议。
#[derive(Debug, Default)]
pub struct MockEndpointFactory {
    created: Mutex<Vec<Arc<MockEndpoint>>>,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl MockEndpointFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_connections(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Release);
    }

    pub fn delay_connections(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    pub fn endpoints(&self) -> Vec<Arc<MockEndpoint>> {
        self.created.lock().clone()
    }

    /// 指定对端上所有端点收到的请求总数。
    pub fn sent_to(&self, remote: &str) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|ep| ep.remote == remote)
            .map(|ep| ep.sent_count())
            .sum()
    }
}

impl EndpointFactory for MockEndpointFactory {
    fn create(
        &self,
        _ctx: &CoreContext,
        _service_type: ServiceType,
        hostname: &str,
        port: u16,
        _bucket: Option<&str>,
    ) -> Arc<dyn Endpoint> {
        let endpoint = Arc::new(MockEndpoint {
            remote: format!("{hostname}:{port}"),
            state: Mutex::new(EndpointState::Disconnected),
            fail_connect: self.fail_connect.load(Ordering::Acquire),
            connect_delay: *self.connect_delay.lock(),
            sent: Mutex::new(Vec::new()),
        });
        self.created.lock().push(Arc::clone(&endpoint));
        endpoint
    }
}

type GlobalConfigFailureFactory = Box<dyn Fn() -> CoreError + Send + Sync>;

/// 静态配置提供方：测试直接推送快照，`watch` 流原样对外。
///
/// `shutdown` 遵守契约：发布一份空快照后静默。
pub struct StaticConfigProvider {
    tx: watch::Sender<Arc<ClusterConfig>>,
    open_failures: Mutex<HashMap<String, String>>,
    global_config_failure: Mutex<Option<GlobalConfigFailureFactory>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for StaticConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticConfigProvider")
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl StaticConfigProvider {
    pub fn new(initial: ClusterConfig) -> Arc<Self> {
        let (tx, _) = watch::channel(Arc::new(initial));
        Arc::new(Self {
            tx,
            open_failures: Mutex::new(HashMap::new()),
            global_config_failure: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// 推送一份新快照（latest-wins）。
    pub fn push(&self, config: ClusterConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// 让指定桶的 `open_bucket` 失败。
    pub fn fail_open(&self, bucket: &str, detail: &str) {
        self.open_failures
            .lock()
            .insert(bucket.to_string(), detail.to_string());
    }

    /// 注入全局配置刷新失败（每次调用重新构造错误，保留 cause 链）。
    pub fn fail_global_config(&self, factory: impl Fn() -> CoreError + Send + Sync + 'static) {
        *self.global_config_failure.lock() = Some(Box::new(factory));
    }
}

#[async_trait]
impl ConfigurationProvider for StaticConfigProvider {
    fn configs(&self) -> watch::Receiver<Arc<ClusterConfig>> {
        self.tx.subscribe()
    }

    fn config(&self) -> Arc<ClusterConfig> {
        Arc::clone(&*self.tx.borrow())
    }

    async fn open_bucket(&self, name: &str) -> Result<(), CoreError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CoreError::AlreadyShutDown);
        }
        if let Some(detail) = self.open_failures.lock().get(name) {
            return Err(CoreError::Config {
                detail: detail.clone(),
                source: None,
            });
        }
        Ok(())
    }

    async fn close_bucket(&self, _name: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn load_and_refresh_global_config(&self) -> Result<(), CoreError> {
        if let Some(factory) = self.global_config_failure.lock().as_ref() {
            return Err(factory());
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        self.shut_down.store(true, Ordering::Release);
        self.tx.send_replace(Arc::new(ClusterConfig::empty()));
        Ok(())
    }
}

/// 均匀分区表：`partition i -> i % nodes`。
pub fn uniform_partitions(num_partitions: u16, nodes: usize) -> PartitionMap {
    PartitionMap::new(
        (0..num_partitions)
            .map(|i| (usize::from(i) % nodes.max(1)) as i32)
            .collect(),
    )
}

/// 流式探针响应：把交付物原样暴露给测试断言。
#[derive(Debug)]
pub struct StreamingProbeResponse {
    pub status: ResponseStatus,
    pub header: ChunkHeader,
    pub rows: RowStream,
    pub trailer: TrailerReceiver,
}

/// 流式探针请求：最小可用的 [`ChunkedRequest`] 实现。
///
/// 默认形态是查询请求；`for_service` 可指定其它 HTTP 服务与关联桶
/// （视图定位器的路由约束需要桶）。
#[derive(Debug)]
pub struct StreamingProbeRequest {
    common: RequestCommon,
    bucket: Option<String>,
    fail_encode: bool,
    sink: CompletionSink<StreamingProbeResponse>,
}

impl StreamingProbeRequest {
    pub fn new(timeout: Duration) -> (Arc<Self>, CompletionReceiver<StreamingProbeResponse>) {
        Self::build(ServiceType::Query, None, timeout, false)
    }

    pub fn for_service(
        service_type: ServiceType,
        bucket: Option<String>,
        timeout: Duration,
    ) -> (Arc<Self>, CompletionReceiver<StreamingProbeResponse>) {
        Self::build(service_type, bucket, timeout, false)
    }

    /// `fail_encode = true` 时 `encode` 以参数错误失败，演练写路径的
    /// “请求失败 + 通道关闭”策略。
    pub fn with_encode_failure(
        timeout: Duration,
        fail_encode: bool,
    ) -> (Arc<Self>, CompletionReceiver<StreamingProbeResponse>) {
        Self::build(ServiceType::Query, None, timeout, fail_encode)
    }

    fn build(
        service_type: ServiceType,
        bucket: Option<String>,
        timeout: Duration,
        fail_encode: bool,
    ) -> (Arc<Self>, CompletionReceiver<StreamingProbeResponse>) {
        let (sink, receiver) = CompletionSink::new();
        (
            Arc::new(Self {
                common: RequestCommon::new(
                    "query",
                    service_type,
                    timeout,
                    Arc::new(BestEffortRetryStrategy),
                ),
                bucket,
                fail_encode,
                sink,
            }),
            receiver,
        )
    }
}

impl Request for StreamingProbeRequest {
    fn common(&self) -> &RequestCommon {
        &self.common
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fail(&self, error: CoreError) {
        self.sink.fail(&self.common, error);
    }

    fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }
}

impl ChunkedRequest for StreamingProbeRequest {
    type Response = StreamingProbeResponse;

    fn encode(&self) -> Result<HttpRequestHead, CoreError> {
        if self.fail_encode {
            return Err(CoreError::InvalidArgument {
                detail: "synthetic encode failure".into(),
            });
        }
        Ok(HttpRequestHead::new(
            "POST",
            "/query/service",
            Bytes::from_static(b"{\"statement\":\"select 1\"}"),
        ))
    }

    fn decode(
        &self,
        status: ResponseStatus,
        header: ChunkHeader,
        rows: RowStream,
        trailer: TrailerReceiver,
    ) -> Result<Self::Response, CoreError> {
        Ok(StreamingProbeResponse {
            status,
            header,
            rows,
            trailer,
        })
    }

    fn succeed(&self, response: Self::Response) {
        self.sink.succeed(&self.common, response);
    }
}
