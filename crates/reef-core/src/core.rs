//! # core 模块说明
//!
//! ## 角色定位（Why）
//! - 核心是进程内的调度枢纽：独占持有存活节点集与配置快照，向上暴露
//!   非阻塞的 `send`，向下驱动配置订阅与拓扑收敛（收敛逻辑在
//!   [`crate::topology`]）；
//! - 读多写少是基本盘：派发路径对节点集只做无锁快照读（`ArcSwap`），
//!   写入由收敛器串行化，辅以一把小写锁防御外部 `ensure_service_at`。
//!
//! ## 设计要求（What）
//! - `send` 永不抛错、永不阻塞，一切失败经请求汇点异步送达；
//! - 停机单发（CAS 闸门），并发调用观察同一份完成信号；
//! - 构造必须在 tokio 运行时内完成：配置订阅任务在构造时启动。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::provider::ConfigurationProvider;
use crate::config::ClusterConfig;
use crate::context::CoreContext;
use crate::error::{CancellationReason, CoreError, GlobalConfigFailure};
use crate::events::{CoreEvent, EventSeverity};
use crate::locator::locator_for;
use crate::metrics::{ResponseMetricIdentifier, ValueRecorder, OPERATIONS_METER_NAME};
use crate::node::{Node, NodeDiagnostics, NodeIdentifier};
use crate::request::Request;
use crate::service::ServiceType;

/// 派发前回调：请求首次进入调度时触发（重投路径不触发）。
pub trait BeforeSendCallback: Send + Sync + std::fmt::Debug {
    fn before_send(&self, request: &dyn Request);
}

pub(crate) struct CoreInner {
    pub(crate) context: CoreContext,
    pub(crate) provider: Arc<dyn ConfigurationProvider>,
    /// 存活节点集，copy-on-write：读方零阻塞快照，写方整体替换。
    pub(crate) nodes: ArcSwap<Vec<Arc<Node>>>,
    /// 节点集写侧小锁：收敛器天然串行，这把锁防御外部直接调用
    /// `ensure_service_at` 与收敛的交叠。
    pub(crate) node_write: Mutex<()>,
    pub(crate) current_config: ArcSwap<ClusterConfig>,
    pub(crate) shut_down: AtomicBool,
    shutdown_done: watch::Sender<bool>,
    pub(crate) reconfigure_in_progress: AtomicBool,
    pub(crate) reconfigure_pending: AtomicBool,
    open_buckets: Mutex<BTreeSet<String>>,
    response_metrics: DashMap<ResponseMetricIdentifier, Arc<dyn ValueRecorder>>,
    before_send: RwLock<Vec<Arc<dyn BeforeSendCallback>>>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreInner")
            .field("core_id", &format_args!("0x{:x}", self.context.id()))
            .field("nodes", &self.nodes.load().len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

/// 集群客户端核心。`Clone` 只复制句柄。
#[derive(Clone, Debug)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// 构造核心并启动配置订阅任务。
    ///
    /// # 前置条件
    /// - 必须在 tokio 运行时上下文内调用；
    /// - `context` 已通过 TLS/认证器兼容性校验（构造 [`CoreContext`] 时）。
    pub fn new(context: CoreContext, provider: Arc<dyn ConfigurationProvider>) -> Self {
        let (shutdown_done, _) = watch::channel(false);
        let initial = provider.config();
        let inner = Arc::new(CoreInner {
            context,
            provider,
            nodes: ArcSwap::from_pointee(Vec::new()),
            node_write: Mutex::new(()),
            current_config: ArcSwap::new(initial),
            shut_down: AtomicBool::new(false),
            shutdown_done,
            reconfigure_in_progress: AtomicBool::new(false),
            reconfigure_pending: AtomicBool::new(false),
            open_buckets: Mutex::new(BTreeSet::new()),
            response_metrics: DashMap::new(),
            before_send: RwLock::new(Vec::new()),
            subscriber: Mutex::new(None),
        });
        let core = Self { inner };

        core.publish(CoreEvent::CoreCreated {
            core_id: core.inner.context.id(),
        });

        // 配置订阅：热流 latest-wins，每次变更驱动一轮收敛。
        // 任务持弱引用，核心句柄全部释放后自然退出。
        let weak = Arc::downgrade(&core.inner);
        let mut configs = core.inner.provider.configs();
        let handle = tokio::spawn(async move {
            while configs.changed().await.is_ok() {
                let snapshot = Arc::clone(&*configs.borrow_and_update());
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let core = Core { inner };
                core.inner.current_config.store(snapshot);
                core.reconfigure().await;
            }
        });
        *core.inner.subscriber.lock() = Some(handle);

        core
    }

    pub fn context(&self) -> &CoreContext {
        &self.inner.context
    }

    /// 当前配置快照。
    pub fn config(&self) -> Arc<ClusterConfig> {
        self.inner.current_config.load_full()
    }

    pub(crate) fn publish(&self, event: CoreEvent) {
        self.inner.context.environment().event_bus().publish(event);
    }

    /// 非阻塞派发入口；完成经请求汇点送达。
    pub fn send(&self, request: Arc<dyn Request>) {
        self.send_with(request, true);
    }

    /// 带计时器注册开关的派发入口；重试路径用 `false` 保住原始截止时间。
    pub fn send_with(&self, request: Arc<dyn Request>, register_for_timeout: bool) {
        if self.inner.shut_down.load(Ordering::Acquire) {
            request.cancel(CancellationReason::Shutdown);
            return;
        }
        if register_for_timeout {
            self.inner
                .context
                .environment()
                .timer()
                .register(Arc::clone(&request));
            for callback in self.inner.before_send.read().iter() {
                callback.before_send(request.as_ref());
            }
        }
        let locator = locator_for(request.service_type());
        let nodes = self.inner.nodes.load_full();
        let config = self.inner.current_config.load_full();
        locator.dispatch(request, &nodes, &config, self);
    }

    /// 注册派发前回调。
    pub fn register_before_send(&self, callback: Arc<dyn BeforeSendCallback>) {
        self.inner.before_send.write().push(callback);
    }

    /// 打开桶：委托配置提供方，进展以事件广播。
    pub async fn open_bucket(&self, name: &str) {
        self.publish(CoreEvent::BucketOpenInitiated {
            name: name.to_string(),
        });
        let start = Instant::now();
        self.inner.open_buckets.lock().insert(name.to_string());
        match self.inner.provider.open_bucket(name).await {
            Ok(()) => self.publish(CoreEvent::BucketOpened {
                name: name.to_string(),
                elapsed: start.elapsed(),
            }),
            Err(error) => {
                let severity = if self.inner.shut_down.load(Ordering::Acquire) {
                    EventSeverity::Debug
                } else {
                    EventSeverity::Warn
                };
                self.publish(CoreEvent::BucketOpenFailed {
                    name: name.to_string(),
                    severity,
                    detail: error.to_string(),
                });
            }
        }
    }

    /// 装载全局配置；失败沿 cause 链归类后仅发事件，永不抛给调用方。
    pub async fn init_global_config(&self) {
        if let Err(error) = self.inner.provider.load_and_refresh_global_config().await {
            self.publish(CoreEvent::InitGlobalConfigFailed {
                reason: GlobalConfigFailure::classify(&error),
            });
        }
    }

    /// 停机。幂等：首个调用方执行流程，其余等待同一份完成信号。
    ///
    /// 顺序：事件 → 关闭所有已开桶 → 停配置提供方 → 排空计时器 →
    /// 直接跑一轮收敛（此时快照应为空，触发全量断连）→ 10ms 节拍轮询
    /// 节点集清空，整体受 `timeout` 约束。
    pub async fn shutdown(&self, timeout: Duration) {
        if self
            .inner
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let mut done = self.inner.shutdown_done.subscribe();
            let _ = tokio::time::timeout(timeout, done.wait_for(|done| *done)).await;
            return;
        }

        let start = Instant::now();
        let deadline = start + timeout;
        self.publish(CoreEvent::ShutdownInitiated);

        let buckets: Vec<String> = std::mem::take(&mut *self.inner.open_buckets.lock())
            .into_iter()
            .collect();
        for bucket in buckets {
            if let Err(error) = self.inner.provider.close_bucket(&bucket).await {
                tracing::debug!(
                    target: "reef::core",
                    bucket = %bucket,
                    "close bucket during shutdown failed: {error}"
                );
            }
            self.publish(CoreEvent::BucketClosed { name: bucket });
        }

        if let Err(error) = self.inner.provider.shutdown().await {
            tracing::debug!(target: "reef::core", "config provider shutdown failed: {error}");
        }

        self.inner.context.environment().timer().stop();

        // 提供方停机后快照应已清空；直接收敛一轮，不依赖订阅任务的调度时机。
        self.inner
            .current_config
            .store(self.inner.provider.config());
        self.reconfigure().await;

        while !self.inner.nodes.load().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if let Some(handle) = self.inner.subscriber.lock().take() {
            handle.abort();
        }

        self.publish(CoreEvent::ShutdownCompleted {
            elapsed: start.elapsed(),
        });
        let _ = self.inner.shutdown_done.send(true);
    }

    /// 确认（或创建）节点并启用服务。停机后为空操作。
    ///
    /// 节点创建是追加式的：新节点进入存活集即对派发可见。
    pub async fn ensure_service_at(
        &self,
        identifier: &NodeIdentifier,
        service_type: ServiceType,
        port: u16,
        bucket: Option<&str>,
        alternate_hostname: Option<&str>,
    ) -> Result<(), CoreError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Ok(());
        }
        let node = self.node_for(identifier, alternate_hostname);
        node.add_service(service_type, port, bucket).await
    }

    /// 停用节点上的服务；节点或服务不存在时为空操作。
    pub async fn remove_service_from(
        &self,
        identifier: &NodeIdentifier,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Result<(), CoreError> {
        let node = self
            .inner
            .nodes
            .load()
            .iter()
            .find(|node| node.identifier() == identifier)
            .cloned();
        match node {
            Some(node) => node.remove_service(service_type, bucket).await,
            None => Ok(()),
        }
    }

    fn node_for(&self, identifier: &NodeIdentifier, alternate_hostname: Option<&str>) -> Arc<Node> {
        if let Some(existing) = self
            .inner
            .nodes
            .load()
            .iter()
            .find(|node| node.identifier() == identifier)
        {
            return Arc::clone(existing);
        }

        let _guard = self.inner.node_write.lock();
        // 双检：拿到写锁后可能已被并发创建。
        if let Some(existing) = self
            .inner
            .nodes
            .load()
            .iter()
            .find(|node| node.identifier() == identifier)
        {
            return Arc::clone(existing);
        }
        let created = Arc::new(Node::new(
            self.inner.context.clone(),
            identifier.clone(),
            alternate_hostname.map(str::to_string),
        ));
        let mut next = self.inner.nodes.load_full().as_ref().clone();
        next.push(Arc::clone(&created));
        self.inner.nodes.store(Arc::new(next));
        created
    }

    /// 替换整个节点集；仅收敛器使用。返回被移除的节点。
    pub(crate) fn replace_nodes(&self, keep: Vec<Arc<Node>>) -> Vec<Arc<Node>> {
        let _guard = self.inner.node_write.lock();
        let previous = self.inner.nodes.load_full();
        self.inner.nodes.store(Arc::new(keep));
        let current = self.inner.nodes.load();
        previous
            .iter()
            .filter(|node| {
                !current
                    .iter()
                    .any(|kept| kept.identifier() == node.identifier())
            })
            .cloned()
            .collect()
    }

    /// 存活节点快照；派发与收敛共用的读路径。
    pub(crate) fn nodes_snapshot(&self) -> Arc<Vec<Arc<Node>>> {
        self.inner.nodes.load_full()
    }

    /// 按 (服务, 对端, 操作) 取响应耗时记录器；首次使用时创建。
    pub fn response_metric(&self, request: &dyn Request) -> Arc<dyn ValueRecorder> {
        let identifier = ResponseMetricIdentifier {
            service: request.service_type(),
            remote: request.common().last_dispatched_to().unwrap_or_default(),
            operation: request.name(),
        };
        self.inner
            .response_metrics
            .entry(identifier.clone())
            .or_insert_with(|| {
                self.inner
                    .context
                    .environment()
                    .meter()
                    .value_recorder(OPERATIONS_METER_NAME, identifier.tags())
            })
            .clone()
    }

    /// 全节点诊断快照。
    pub fn diagnostics(&self) -> Vec<NodeDiagnostics> {
        self.inner
            .nodes
            .load()
            .iter()
            .map(|node| node.diagnostics())
            .collect()
    }

    pub(crate) fn inner(&self) -> &CoreInner {
        &self.inner
    }
}
