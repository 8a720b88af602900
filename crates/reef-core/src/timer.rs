//! # timer 模块说明
//!
//! 每个注册的请求有一条截止时间看护任务：到期即以 *timeout* 取消请求。
//! 已完成请求的到期触发落在单发射汇点上，是天然空操作，因此看护任务
//! 不需要与完成路径同步。停机时计时器整体排空，余下的在途请求以
//! *shutdown* 取消。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::error::CancellationReason;
use crate::request::Request;

#[derive(Debug)]
struct TimerInner {
    outstanding: DashMap<u32, (Arc<dyn Request>, JoinHandle<()>)>,
    stopped: AtomicBool,
}

/// 请求截止时间看护器。
#[derive(Debug)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerInner {
                outstanding: DashMap::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// 注册请求；到期以 *timeout* 取消。
    ///
    /// 重试路径不会二次注册（`send_with(request, false)` 跳过本入口），
    /// 原始截止时间因此保持权威。
    pub fn register(&self, request: Arc<dyn Request>) {
        if self.inner.stopped.load(Ordering::Acquire) {
            request.cancel(CancellationReason::Shutdown);
            return;
        }
        let opaque = request.common().opaque();
        let deadline = request.common().deadline();
        let inner = Arc::clone(&self.inner);
        let watched = Arc::clone(&request);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            watched.cancel(CancellationReason::Timeout);
            inner.outstanding.remove(&opaque);
        });
        self.inner.outstanding.insert(opaque, (request, handle));
    }

    /// 当前仍在看护中的注册数（含已完成但未到期的条目）。
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.len()
    }

    /// 停机排空：终止所有看护任务并以 *shutdown* 取消其请求。
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let keys: Vec<u32> = self
            .inner
            .outstanding
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for key in keys {
            if let Some((_, (request, handle))) = self.inner.outstanding.remove(&key) {
                handle.abort();
                request.cancel(CancellationReason::Shutdown);
            }
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
