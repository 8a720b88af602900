//! # request 模块说明
//!
//! ## 角色定位（Why）
//! - 请求是调用方与运行时之间的共享实体：调用方持有完成接收端，运行时持有
//!   派发与取消的入口；完成（成功、失败、取消三选一）是唯一终态，且必须
//!   恰好发生一次；
//! - 公共骨架 [`RequestCommon`] 承载与具体服务无关的属性：操作标识
//!   （opaque）、超时与截止时间、重试策略、生命周期状态机。
//!
//! ## 设计要求（What）
//! - 状态机 `Pending → Dispatched → {Completed, Cancelled}`，终态不可逆；
//! - 完成汇点 [`CompletionSink`] 单发射：取走发送端后任何后续投递都是
//!   空操作，这是“恰好一次完成”不变量的机械保证；
//! - opaque 为 32 位回绕计数器，展示形态固定为 `0x` + 小写十六进制。

pub mod kv;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{CancellationReason, CoreError};
use crate::retry::RetryStrategy;
use crate::service::ServiceType;

/// 进程内回绕的 opaque 计数器；唯一性在单条连接生命周期内尽力保证。
static OPAQUE: AtomicU32 = AtomicU32::new(0);

/// 取下一个 opaque 值。回绕是设计内行为，十六进制展示对回绕不敏感。
pub(crate) fn next_opaque() -> u32 {
    OPAQUE.fetch_add(1, Ordering::Relaxed)
}

const STATE_PENDING: u8 = 0;
const STATE_DISPATCHED: u8 = 1;
const STATE_COMPLETED: u8 = 2;
const STATE_CANCELLED: u8 = 3;

/// 请求生命周期状态快照。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestState {
    Pending,
    Dispatched,
    Completed,
    Cancelled,
}

/// 所有请求共享的骨架属性与状态机。
#[derive(Debug)]
pub struct RequestCommon {
    name: &'static str,
    service_type: ServiceType,
    timeout: Duration,
    deadline: Instant,
    retry: Arc<dyn RetryStrategy>,
    opaque: u32,
    state: AtomicU8,
    attempts: AtomicU32,
    last_dispatched: Mutex<Option<String>>,
    cancellation: Mutex<Option<CancellationReason>>,
    span: tracing::Span,
}

impl RequestCommon {
    /// 构造骨架；截止时间在此刻定格，重试不续期。
    pub fn new(
        name: &'static str,
        service_type: ServiceType,
        timeout: Duration,
        retry: Arc<dyn RetryStrategy>,
    ) -> Self {
        Self {
            name,
            service_type,
            timeout,
            deadline: Instant::now() + timeout,
            retry,
            opaque: next_opaque(),
            state: AtomicU8::new(STATE_PENDING),
            attempts: AtomicU32::new(0),
            last_dispatched: Mutex::new(None),
            cancellation: Mutex::new(None),
            span: tracing::Span::current(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 原始截止时间；重投路径沿用，不重置。
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn retry_strategy(&self) -> &Arc<dyn RetryStrategy> {
        &self.retry
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn state(&self) -> RequestState {
        match self.state.load(Ordering::Acquire) {
            STATE_PENDING => RequestState::Pending,
            STATE_DISPATCHED => RequestState::Dispatched,
            STATE_COMPLETED => RequestState::Completed,
            _ => RequestState::Cancelled,
        }
    }

    /// 是否已进入终态。
    pub fn completed(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STATE_COMPLETED
    }

    /// 端点接手时调用；终态下的调用是空操作。
    pub fn mark_dispatched(&self) {
        let _ = self.state.compare_exchange(
            STATE_PENDING,
            STATE_DISPATCHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn retry_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn note_retry_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// 最近一次派发的对端（`host:port`），响应指标据此打 tag。
    pub fn last_dispatched_to(&self) -> Option<String> {
        self.last_dispatched.lock().clone()
    }

    pub fn set_last_dispatched_to(&self, remote: String) {
        *self.last_dispatched.lock() = Some(remote);
    }

    /// 请求被取消时记录的原因。
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        *self.cancellation.lock()
    }

    fn settle(&self, outcome: &Result<(), &CoreError>) {
        match outcome {
            Err(CoreError::RequestCanceled { reason }) => {
                *self.cancellation.lock() = Some(*reason);
                self.state.store(STATE_CANCELLED, Ordering::Release);
            }
            _ => self.state.store(STATE_COMPLETED, Ordering::Release),
        }
    }
}

/// 完成接收端：调用方 await 它拿到成功响应或错误。
pub type CompletionReceiver<T> = oneshot::Receiver<Result<T, CoreError>>;

/// 单发射完成汇点。
///
/// # 教案式说明
/// - **意图 (Why)**：取消、超时、流式失败与正常完成存在天然竞态，
///   “恰好一次”必须由结构保证而非调用纪律；
/// - **契约 (What)**：`succeed`/`fail` 返回是否真正投递；发送端一经取走，
///   后续调用全部为空操作并返回 `false`；
/// - **后置条件**：任一投递同步更新骨架状态机至对应终态。
pub struct CompletionSink<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T, CoreError>>>>,
}

impl<T> fmt::Debug for CompletionSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let armed = self.tx.lock().is_some();
        f.debug_struct("CompletionSink").field("armed", &armed).finish()
    }
}

impl<T: Send + 'static> CompletionSink<T> {
    pub fn new() -> (Self, CompletionReceiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn succeed(&self, common: &RequestCommon, value: T) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        common.settle(&Ok(()));
        // 接收端可能已被调用方丢弃；投递失败不构成错误。
        let _ = tx.send(Ok(value));
        true
    }

    pub fn fail(&self, common: &RequestCommon, error: CoreError) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        common.settle(&Err(&error));
        let _ = tx.send(Err(error));
        true
    }
}

/// 运行时视角的请求契约。
///
/// 具体请求类型各自持有带类型的完成汇点；运行时只需要失败/取消入口与
/// 路由所需的只读属性。`as_any` 供定位器向下转型读取服务特有字段
/// （键值定位器需要分区绑定入口）。
pub trait Request: Send + Sync + fmt::Debug + 'static {
    fn common(&self) -> &RequestCommon;

    fn as_any(&self) -> &dyn Any;

    /// 以错误完成请求；重复调用为空操作。
    fn fail(&self, error: CoreError);

    /// 请求关联的桶；键值与视图请求返回 `Some`。
    fn bucket(&self) -> Option<&str> {
        None
    }

    fn service_type(&self) -> ServiceType {
        self.common().service_type()
    }

    fn name(&self) -> &'static str {
        self.common().name()
    }

    /// 操作标识的展示形态：`0x` + 小写十六进制。
    fn operation_id(&self) -> String {
        format!("0x{:x}", self.common().opaque())
    }

    fn retry_strategy(&self) -> Arc<dyn RetryStrategy> {
        Arc::clone(self.common().retry_strategy())
    }

    /// 以给定原因取消请求；已完成的请求不受影响。
    fn cancel(&self, reason: CancellationReason) {
        self.fail(CoreError::RequestCanceled { reason });
    }
}
