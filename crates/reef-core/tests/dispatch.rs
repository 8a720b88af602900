//! 调度与定位器集成测试。
//!
//! # 教案级导览
//! - **Why**：`send` 是对外唯一的热路径，必须在拓扑各种中间态下都给出
//!   确定行为：停机即取消、配置未到即重试、策略拒绝即取消、超时即取消；
//! - **How**：可记录端点捕获真正到达线缆边界的请求，按对端断言路由结论；
//! - **What**：键值分区定点、HTTP 轮转、视图桶约束、重试收敛、指标
//!   compute-if-absent。

use std::sync::Arc;
use std::time::Duration;

use reef_core::test_support::{
    uniform_partitions, MockEndpointFactory, RecordingEventBus, RecordingMeter,
    StaticConfigProvider, StreamingProbeRequest,
};
use reef_core::{
    AnonymousAuthenticator, BucketConfig, CancellationReason, ClusterConfig, CollectionIdentifier,
    Core, CoreContext, CoreEnvironment, CoreError, FailFastRetryStrategy, KeyValueRequest,
    NodeInfo, Request, RetryReason, ServiceType, BestEffortRetryStrategy,
};

fn build_core(
    provider: Arc<StaticConfigProvider>,
    factory: Arc<MockEndpointFactory>,
    meter: Option<Arc<RecordingMeter>>,
) -> Core {
    let mut builder = CoreEnvironment::builder()
        .event_bus(RecordingEventBus::new())
        .endpoint_factory(factory);
    if let Some(meter) = meter {
        builder = builder.meter(meter);
    }
    let context = CoreContext::new(builder.build(), Arc::new(AnonymousAuthenticator)).unwrap();
    Core::new(context, provider)
}

fn single_node_bucket() -> ClusterConfig {
    ClusterConfig::empty().with_bucket(BucketConfig::new(
        "travel",
        vec![NodeInfo::new("10.0.0.1", 8091)
            .with_service(ServiceType::KeyValue, 11210)
            .with_service(ServiceType::Query, 8093)],
        uniform_partitions(8, 1),
    ))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition did not hold within one second");
}

fn kv_request(
    key: &str,
    retry: Arc<dyn reef_core::RetryStrategy>,
) -> (
    Arc<KeyValueRequest>,
    reef_core::CompletionReceiver<reef_core::KvResponseEnvelope>,
) {
    KeyValueRequest::new(
        "get",
        Duration::from_secs(2),
        retry,
        Some(key),
        CollectionIdentifier::default_for_bucket("travel"),
        None,
    )
}

/// 键值请求定点路由到分区主节点，且派发前分区已绑定。
#[tokio::test(flavor = "multi_thread")]
async fn kv_requests_land_on_the_partition_owner() {
    let provider = StaticConfigProvider::new(ClusterConfig::empty());
    let factory = MockEndpointFactory::new();
    let core = build_core(provider.clone(), factory.clone(), None);

    provider.push(single_node_bucket());
    wait_until(|| core.diagnostics().len() == 1).await;

    let (request, _rx) = kv_request("user:42", Arc::new(BestEffortRetryStrategy));
    core.send(request.clone());
    wait_until(|| factory.sent_to("10.0.0.1:11210") == 1).await;
    assert!(request.partition_is_bound());
    assert!(u32::from(request.partition()) < 8);
    assert_eq!(
        request.common().last_dispatched_to().as_deref(),
        Some("10.0.0.1:11210")
    );
}

/// 桶配置未到时按策略重试；配置到达后同一请求自动落地。
#[tokio::test(flavor = "multi_thread")]
async fn kv_requests_retry_until_the_topology_arrives() {
    let provider = StaticConfigProvider::new(ClusterConfig::empty());
    let factory = MockEndpointFactory::new();
    let core = build_core(provider.clone(), factory.clone(), None);

    let (request, _rx) = kv_request("user:42", Arc::new(BestEffortRetryStrategy));
    core.send(request.clone());
    assert!(request.common().retry_attempts() >= 1 || factory.endpoints().is_empty());

    provider.push(single_node_bucket());
    wait_until(|| factory.sent_to("10.0.0.1:11210") == 1).await;
    assert!(request.common().retry_attempts() >= 1);
}

/// 快速失败策略在桶配置缺失时立即取消，原因携带重试理由。
#[tokio::test(flavor = "multi_thread")]
async fn fail_fast_strategy_cancels_with_the_retry_reason() {
    let provider = StaticConfigProvider::new(ClusterConfig::empty());
    let factory = MockEndpointFactory::new();
    let core = build_core(provider.clone(), factory.clone(), None);

    let (request, mut rx) = kv_request("user:42", Arc::new(FailFastRetryStrategy));
    core.send(request);
    let outcome = rx.try_recv().expect("fail-fast completes synchronously");
    match outcome {
        Err(CoreError::RequestCanceled {
            reason: CancellationReason::NoMoreRetries(RetryReason::BucketConfigNotAvailable),
        }) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// 不变量 5：停机后的新请求立即以 *shutdown* 取消。
#[tokio::test(flavor = "multi_thread")]
async fn send_after_shutdown_cancels_immediately() {
    let provider = StaticConfigProvider::new(ClusterConfig::empty());
    let factory = MockEndpointFactory::new();
    let core = build_core(provider.clone(), factory.clone(), None);

    core.shutdown(Duration::from_secs(1)).await;

    let (request, mut rx) = kv_request("user:42", Arc::new(BestEffortRetryStrategy));
    core.send(request);
    match rx.try_recv().expect("cancellation is synchronous") {
        Err(CoreError::RequestCanceled {
            reason: CancellationReason::Shutdown,
        }) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// HTTP 请求在具备服务的节点间轮转。
#[tokio::test(flavor = "multi_thread")]
async fn http_requests_round_robin_across_nodes() {
    let provider = StaticConfigProvider::new(ClusterConfig::empty());
    let factory = MockEndpointFactory::new();
    let core = build_core(provider.clone(), factory.clone(), None);

    let config = ClusterConfig::empty().with_bucket(BucketConfig::new(
        "travel",
        vec![
            NodeInfo::new("10.0.0.1", 8091)
                .with_service(ServiceType::KeyValue, 11210)
                .with_service(ServiceType::Query, 8093),
            NodeInfo::new("10.0.0.2", 8091)
                .with_service(ServiceType::KeyValue, 11210)
                .with_service(ServiceType::Query, 8093),
        ],
        uniform_partitions(8, 2),
    ));
    provider.push(config);
    wait_until(|| core.diagnostics().len() == 2).await;

    for _ in 0..4 {
        let (request, _rx) = StreamingProbeRequest::new(Duration::from_secs(2));
        core.send(request);
    }
    wait_until(|| {
        factory.sent_to("10.0.0.1:8093") + factory.sent_to("10.0.0.2:8093") == 4
    })
    .await;
    assert_eq!(factory.sent_to("10.0.0.1:8093"), 2);
    assert_eq!(factory.sent_to("10.0.0.2:8093"), 2);
}

/// 视图请求只会路由到承载请求桶的节点。
#[tokio::test(flavor = "multi_thread")]
async fn view_requests_require_the_bucket_on_the_node() {
    let provider = StaticConfigProvider::new(ClusterConfig::empty());
    let factory = MockEndpointFactory::new();
    let core = build_core(provider.clone(), factory.clone(), None);

    // 两个节点都开了视图服务，但 travel 桶只在 10.0.0.1 上。
    let config = ClusterConfig::empty()
        .with_bucket(BucketConfig::new(
            "travel",
            vec![NodeInfo::new("10.0.0.1", 8091)
                .with_service(ServiceType::KeyValue, 11210)
                .with_service(ServiceType::Views, 8092)],
            uniform_partitions(8, 1),
        ))
        .with_bucket(BucketConfig::new(
            "beer",
            vec![NodeInfo::new("10.0.0.2", 8091)
                .with_service(ServiceType::KeyValue, 11210)
                .with_service(ServiceType::Views, 8092)],
            uniform_partitions(8, 1),
        ));
    provider.push(config);
    wait_until(|| core.diagnostics().len() == 2).await;

    for _ in 0..3 {
        let (request, _rx) = StreamingProbeRequest::for_service(
            ServiceType::Views,
            Some("travel".into()),
            Duration::from_secs(2),
        );
        core.send(request);
    }
    wait_until(|| factory.sent_to("10.0.0.1:8092") == 3).await;
    assert_eq!(factory.sent_to("10.0.0.2:8092"), 0);
}

/// 注册超时的请求到期以 *timeout* 取消（不变量 1 的取消分支）。
#[tokio::test(flavor = "multi_thread")]
async fn registered_requests_time_out() {
    let provider = StaticConfigProvider::new(ClusterConfig::empty());
    let factory = MockEndpointFactory::new();
    let core = build_core(provider.clone(), factory.clone(), None);

    // 没有任何拓扑：best-effort 重试耗尽的是截止时间而不是次数。
    let (request, rx) = KeyValueRequest::new(
        "get",
        Duration::from_millis(60),
        Arc::new(BestEffortRetryStrategy),
        Some("user:42"),
        CollectionIdentifier::default_for_bucket("travel"),
        None,
    );
    core.send(request);
    match rx.await.expect("sink delivers") {
        Err(CoreError::RequestCanceled {
            reason: CancellationReason::Timeout,
        }) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// 响应指标按 (服务, 对端, 操作) 一次分配、重复取用。
#[tokio::test(flavor = "multi_thread")]
async fn response_metrics_are_allocated_once() {
    let provider = StaticConfigProvider::new(ClusterConfig::empty());
    let factory = MockEndpointFactory::new();
    let meter = RecordingMeter::new();
    let core = build_core(provider.clone(), factory.clone(), Some(meter.clone()));

    provider.push(single_node_bucket());
    wait_until(|| core.diagnostics().len() == 1).await;

    let (request, _rx) = kv_request("user:42", Arc::new(BestEffortRetryStrategy));
    core.send(request.clone());
    wait_until(|| factory.sent_to("10.0.0.1:11210") == 1).await;

    let recorder = core.response_metric(request.as_ref());
    recorder.record(120);
    let again = core.response_metric(request.as_ref());
    again.record(80);
    assert_eq!(meter.recorder_count(), 1, "compute-if-absent semantics");
}
