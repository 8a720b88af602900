//! # request::kv 模块说明
//!
//! ## 角色定位（Why）
//! - 键值请求基座：键编码、集合前缀、分区绑定与错误上下文在这里收敛，
//!   具体操作（get/upsert/…）只是再往上叠协议字段；
//! - 键长上限是**协议硬约束**：集合前缀与键合计不得超过 250 字节，超限
//!   属同步校验错误，请求不会进入派发。
//!
//! ## 设计要求（What）
//! - 键一律 UTF-8 字节；`None`/空串一视同仁编码为空字节数组；
//! - 集合前缀为无符号 LEB128 编码的集合数字 id，按通道协商结果决定是否
//!   拼接；未协商集合支持时请求默认集合以外的集合是能力错误；
//! - 分区号由键值定位器在派发前绑定，未绑定的请求不允许进入端点。

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CoreError;
use crate::request::{CompletionReceiver, CompletionSink, Request, RequestCommon};
use crate::retry::RetryStrategy;
use crate::service::ServiceType;
use crate::status::ResponseStatus;

/// 集合前缀 + 键的总长度上限（字节）。
pub const MAX_KEY_LENGTH: usize = 250;

/// 默认作用域与默认集合的规范名。
pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

/// 写入持久化等级，随请求透传到错误上下文。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DurabilityLevel {
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurabilityLevel::Majority => f.write_str("majority"),
            DurabilityLevel::MajorityAndPersistToActive => {
                f.write_str("majority_and_persist_to_active")
            }
            DurabilityLevel::PersistToMajority => f.write_str("persist_to_majority"),
        }
    }
}

/// 集合标识：桶 + 可选作用域 + 可选集合。
///
/// 作用域/集合缺省时落到 `_default`；`is_default` 判定决定了未协商集合
/// 支持的通道能否承载该请求。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CollectionIdentifier {
    bucket: String,
    scope: Option<String>,
    collection: Option<String>,
}

impl CollectionIdentifier {
    pub fn new(
        bucket: impl Into<String>,
        scope: Option<String>,
        collection: Option<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope,
            collection,
        }
    }

    /// 桶的默认集合。
    pub fn default_for_bucket(bucket: impl Into<String>) -> Self {
        Self::new(bucket, None, None)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn scope_or_default(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    pub fn collection_or_default(&self) -> &str {
        self.collection.as_deref().unwrap_or(DEFAULT_COLLECTION)
    }

    /// 是否指向默认作用域下的默认集合。
    pub fn is_default(&self) -> bool {
        self.scope_or_default() == DEFAULT_SCOPE
            && self.collection_or_default() == DEFAULT_COLLECTION
    }

    /// 集合映射里的查找键：`scope.collection`。
    pub fn path(&self) -> String {
        format!("{}.{}", self.scope_or_default(), self.collection_or_default())
    }
}

/// 键值通道的协商结果视图：集合能力开关与集合映射。
///
/// 映射由通道在打开时从服务端取回；键为 `scope.collection` 路径，值为
/// 通道内有效的集合数字 id。
#[derive(Clone, Debug, Default)]
pub struct KvChannelContext {
    collections_enabled: bool,
    collection_map: HashMap<String, u32>,
}

impl KvChannelContext {
    pub fn new(collections_enabled: bool) -> Self {
        Self {
            collections_enabled,
            collection_map: HashMap::new(),
        }
    }

    pub fn with_collection(mut self, scope: &str, collection: &str, cid: u32) -> Self {
        self.collection_map.insert(format!("{scope}.{collection}"), cid);
        self
    }

    pub fn collections_enabled(&self) -> bool {
        self.collections_enabled
    }

    pub fn collection_id(&self, path: &str) -> Option<u32> {
        self.collection_map.get(path).copied()
    }
}

/// 键值响应信封：状态、相关性 opaque 与原始响应体。
///
/// 具体文档编解码属于上层门面；核心只搬运字节。
#[derive(Clone, Debug)]
pub struct KvResponseEnvelope {
    pub status: ResponseStatus,
    pub opaque: u32,
    pub body: Bytes,
}

/// 键值请求基座。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 构造时完成键编码与 opaque 分配；
///   - [`encoded_key_with_collection`](Self::encoded_key_with_collection)
///     按通道能力产出上线字节，超限以 [`CoreError::KeyTooLong`] 同步失败；
///   - 分区号必须由定位器经 [`bind_partition`](Self::bind_partition) 绑定后
///     才可派发；
/// - **风险 (Trade-offs)**：键以 `Bytes` 冻结保存，重复编码只付一次拷贝。
#[derive(Debug)]
pub struct KeyValueRequest {
    common: RequestCommon,
    key: Bytes,
    collection: CollectionIdentifier,
    partition: AtomicU16,
    partition_bound: AtomicBool,
    durability: Option<DurabilityLevel>,
    sink: CompletionSink<KvResponseEnvelope>,
}

impl KeyValueRequest {
    /// 构造键值请求，返回请求句柄与完成接收端。
    pub fn new(
        name: &'static str,
        timeout: Duration,
        retry: Arc<dyn RetryStrategy>,
        key: Option<&str>,
        collection: CollectionIdentifier,
        durability: Option<DurabilityLevel>,
    ) -> (Arc<Self>, CompletionReceiver<KvResponseEnvelope>) {
        let (sink, receiver) = CompletionSink::new();
        let request = Arc::new(Self {
            common: RequestCommon::new(name, ServiceType::KeyValue, timeout, retry),
            key: Bytes::copy_from_slice(key.unwrap_or_default().as_bytes()),
            collection,
            partition: AtomicU16::new(0),
            partition_bound: AtomicBool::new(false),
            durability,
            sink,
        });
        (request, receiver)
    }

    /// 编码后的裸键字节（不含集合前缀）。
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn collection(&self) -> &CollectionIdentifier {
        &self.collection
    }

    pub fn durability(&self) -> Option<DurabilityLevel> {
        self.durability
    }

    /// 按通道协商结果产出上线键字节。
    ///
    /// 三种形态：
    /// 1. 通道已协商集合：查映射取数字 id，LEB128 前缀 + 键，合计限长；
    /// 2. 未协商且目标是默认集合：裸键，限长；
    /// 3. 未协商且目标是非默认集合：能力错误，同步失败。
    pub fn encoded_key_with_collection(
        &self,
        channel: &KvChannelContext,
    ) -> Result<Bytes, CoreError> {
        if channel.collections_enabled() {
            let path = self.collection.path();
            let cid = channel
                .collection_id(&path)
                .ok_or(CoreError::CollectionNotFound { name: path })?;
            let mut prefix = [0u8; 5];
            let prefix_len = write_unsigned_leb128(&mut prefix, cid);
            let total = prefix_len + self.key.len();
            enforce_key_length(total)?;
            let mut buf = BytesMut::with_capacity(total);
            buf.put_slice(&prefix[..prefix_len]);
            buf.put_slice(&self.key);
            return Ok(buf.freeze());
        }

        if self.collection.is_default() {
            enforce_key_length(self.key.len())?;
            return Ok(self.key.clone());
        }

        Err(CoreError::FeatureNotAvailable {
            detail: format!(
                "collections are not enabled on this channel (requested `{}`)",
                self.collection.path()
            ),
        })
    }

    /// 定位器在派发前绑定分区。
    pub fn bind_partition(&self, partition: u16) {
        self.partition.store(partition, Ordering::Release);
        self.partition_bound.store(true, Ordering::Release);
    }

    pub fn partition(&self) -> u16 {
        self.partition.load(Ordering::Acquire)
    }

    /// 分区是否已绑定；未绑定的请求不允许进入端点。
    pub fn partition_is_bound(&self) -> bool {
        self.partition_bound.load(Ordering::Acquire)
    }

    /// 以成功响应完成请求。
    pub fn succeed(&self, response: KvResponseEnvelope) {
        self.sink.succeed(&self.common, response);
    }

    /// 错误/日志信封使用的上下文快照。文档 id 按用户数据脱敏。
    pub fn service_context(&self) -> BTreeMap<&'static str, String> {
        let mut ctx = BTreeMap::new();
        ctx.insert("service", ServiceType::KeyValue.ident().to_string());
        ctx.insert("operationId", self.operation_id());
        ctx.insert("bucket", self.collection.bucket().to_string());
        ctx.insert("scope", self.collection.scope_or_default().to_string());
        ctx.insert(
            "collection",
            self.collection.collection_or_default().to_string(),
        );
        ctx.insert(
            "documentId",
            redact_user(String::from_utf8_lossy(&self.key).as_ref()),
        );
        if let Some(level) = self.durability {
            ctx.insert("durability", level.to_string());
        }
        ctx
    }
}

impl Request for KeyValueRequest {
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
        Some(self.collection.bucket())
    }
}

/// 用户数据脱敏标记，日志管线按标记决定是否明文输出。
pub fn redact_user(value: &str) -> String {
    format!("<ud>{value}</ud>")
}

/// 长度上限裁决，超限返回 [`CoreError::KeyTooLong`]。
fn enforce_key_length(total: usize) -> Result<(), CoreError> {
    if total > MAX_KEY_LENGTH {
        return Err(CoreError::KeyTooLong {
            length: total,
            max: MAX_KEY_LENGTH,
        });
    }
    Ok(())
}

/// 无符号 LEB128 编码；返回写入的字节数。u32 输入至多 5 字节。
fn write_unsigned_leb128(out: &mut [u8; 5], mut value: u32) -> usize {
    let mut idx = 0;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out[idx] = byte;
        idx += 1;
        if value == 0 {
            return idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::retry::FailFastRetryStrategy;

    fn request(key: Option<&str>, collection: CollectionIdentifier) -> Arc<KeyValueRequest> {
        KeyValueRequest::new(
            "get",
            Duration::from_secs(2),
            Arc::new(FailFastRetryStrategy),
            key,
            collection,
            None,
        )
        .0
    }

    /// 集合未协商、默认集合：裸键原样上线。
    #[test]
    fn bare_key_round_trips_without_collections() {
        let req = request(
            Some("user:42"),
            CollectionIdentifier::default_for_bucket("travel"),
        );
        let encoded = req
            .encoded_key_with_collection(&KvChannelContext::new(false))
            .unwrap();
        assert_eq!(encoded.as_ref(), b"user:42");
        assert_eq!(encoded.len(), 7);
    }

    /// 前缀 + 键超过 250 字节：同步失败，请求不进入派发。
    #[test]
    fn prefix_plus_key_over_limit_fails_synchronously() {
        let key = "a".repeat(246);
        let req = request(
            Some(&key),
            CollectionIdentifier::new("travel", Some("app".into()), Some("users".into())),
        );
        // cid 取 5 字节 LEB128 区间，前缀 5 + 键 246 = 251 > 250。
        let channel = KvChannelContext::new(true).with_collection("app", "users", 0x1000_0000);
        let err = req.encoded_key_with_collection(&channel).unwrap_err();
        match err {
            CoreError::KeyTooLong { length, max } => {
                assert_eq!(length, 251);
                assert_eq!(max, 250);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn exact_limit_is_accepted() {
        let key = "a".repeat(245);
        let req = request(
            Some(&key),
            CollectionIdentifier::new("travel", Some("app".into()), Some("users".into())),
        );
        let channel = KvChannelContext::new(true).with_collection("app", "users", 0x1000_0000);
        let encoded = req.encoded_key_with_collection(&channel).unwrap();
        assert_eq!(encoded.len(), 250);
    }

    #[test]
    fn unknown_collection_is_reported_with_its_path() {
        let req = request(
            Some("k"),
            CollectionIdentifier::new("travel", Some("app".into()), Some("ghost".into())),
        );
        let err = req
            .encoded_key_with_collection(&KvChannelContext::new(true))
            .unwrap_err();
        match err {
            CoreError::CollectionNotFound { name } => assert_eq!(name, "app.ghost"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_default_collection_without_negotiation_is_a_capability_error() {
        let req = request(
            Some("k"),
            CollectionIdentifier::new("travel", Some("app".into()), Some("users".into())),
        );
        let err = req
            .encoded_key_with_collection(&KvChannelContext::new(false))
            .unwrap_err();
        assert!(matches!(err, CoreError::FeatureNotAvailable { .. }));
    }

    #[test]
    fn missing_key_encodes_empty() {
        let req = request(None, CollectionIdentifier::default_for_bucket("travel"));
        let encoded = req
            .encoded_key_with_collection(&KvChannelContext::new(false))
            .unwrap();
        assert!(encoded.is_empty());
    }

    #[test]
    fn service_context_redacts_the_document_id() {
        let (req, _rx) = KeyValueRequest::new(
            "upsert",
            Duration::from_secs(1),
            Arc::new(FailFastRetryStrategy),
            Some("user:42"),
            CollectionIdentifier::default_for_bucket("travel"),
            Some(DurabilityLevel::Majority),
        );
        let ctx = req.service_context();
        assert_eq!(ctx["documentId"], "<ud>user:42</ud>");
        assert_eq!(ctx["scope"], "_default");
        assert_eq!(ctx["collection"], "_default");
        assert_eq!(ctx["durability"], "majority");
        assert!(ctx["operationId"].starts_with("0x"));
    }

    #[test]
    fn leb128_matches_reference_points() {
        let mut buf = [0u8; 5];
        assert_eq!(write_unsigned_leb128(&mut buf, 0), 1);
        assert_eq!(buf[0], 0);
        assert_eq!(write_unsigned_leb128(&mut buf, 0x7f), 1);
        assert_eq!(buf[0], 0x7f);
        assert_eq!(write_unsigned_leb128(&mut buf, 0x80), 2);
        assert_eq!(&buf[..2], &[0x80, 0x01]);
        assert_eq!(write_unsigned_leb128(&mut buf, 0x1000_0000), 5);
    }

    proptest! {
        /// 任意键：长度 ≤ 250 − 前缀者成功，超限者失败且带准确长度。
        #[test]
        fn key_length_property(len in 0usize..=300) {
            let key = "k".repeat(len);
            let req = request(
                Some(&key),
                CollectionIdentifier::new("b", Some("s".into()), Some("c".into())),
            );
            // cid 9 的 LEB128 前缀恰为 1 字节。
            let channel = KvChannelContext::new(true).with_collection("s", "c", 9);
            let outcome = req.encoded_key_with_collection(&channel);
            if len + 1 <= MAX_KEY_LENGTH {
                prop_assert_eq!(outcome.unwrap().len(), len + 1);
            } else {
                let matched = matches!(
                    outcome.unwrap_err(),
                    CoreError::KeyTooLong { length, .. } if length == len + 1
                );
                prop_assert!(matched);
            }
        }
    }
}
