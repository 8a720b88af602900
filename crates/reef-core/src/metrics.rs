//! # metrics 模块说明
//!
//! 指标出口是注入 seam：核心只约定“值记录器”的获取与打点接口，聚合与导出
//! 属于外层关注点。默认实现为空操作，测试替身在 [`crate::test_support`]。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::service::ServiceType;

/// 操作耗时统一发布在该仪表名下，tag 区分服务与操作。
pub const OPERATIONS_METER_NAME: &str = "db.reef.operations";

/// 单指标记录器；`record` 必须无阻塞。
pub trait ValueRecorder: Send + Sync + fmt::Debug {
    fn record(&self, value: u64);
}

/// 仪表工厂：按名称与 tag 集合创建（或复用）记录器。
pub trait Meter: Send + Sync + fmt::Debug {
    fn value_recorder(
        &self,
        name: &'static str,
        tags: BTreeMap<&'static str, String>,
    ) -> Arc<dyn ValueRecorder>;
}

/// 响应指标的缓存键：(服务, 最近一次派发的对端, 操作名)。
///
/// 记录器按键 compute-if-absent，一次分配后复用，避免热路径反复建表。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResponseMetricIdentifier {
    pub service: ServiceType,
    pub remote: String,
    pub operation: &'static str,
}

impl ResponseMetricIdentifier {
    /// 渲染成仪表 tag 集合。
    pub fn tags(&self) -> BTreeMap<&'static str, String> {
        let mut tags = BTreeMap::new();
        tags.insert("service", self.service.ident().to_string());
        tags.insert("operation", self.operation.to_string());
        tags.insert("remote", self.remote.clone());
        tags
    }
}

/// 默认空操作仪表。
#[derive(Debug, Default)]
pub struct NoopMeter;

#[derive(Debug)]
struct NoopValueRecorder;

impl ValueRecorder for NoopValueRecorder {
    fn record(&self, _value: u64) {}
}

impl Meter for NoopMeter {
    fn value_recorder(
        &self,
        _name: &'static str,
        _tags: BTreeMap<&'static str, String>,
    ) -> Arc<dyn ValueRecorder> {
        Arc::new(NoopValueRecorder)
    }
}
