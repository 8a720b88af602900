//! # context 模块说明
//!
//! 核心上下文是不可变句柄：实例标识、环境与认证器三元组，随请求、节点与
//! 服务一路传递。构造即校验——TLS 配置与认证器能力不匹配属编程错误，
//! 在这里同步失败，绝不进入运行期。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::environment::CoreEnvironment;
use crate::error::CoreError;

/// 认证器能力契约。
///
/// 认证机制本身（凭据协商、握手报文）在核心之外；核心只关心两件事：
/// 该认证器能否跑在明文连接上、能否跑在 TLS 连接上。
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// 是否允许用于未启用 TLS 的连接。
    fn supports_non_tls(&self) -> bool {
        true
    }

    /// 是否允许用于启用 TLS 的连接。
    fn supports_tls(&self) -> bool {
        true
    }
}

/// 无凭据认证器，两种连接形态均可用；测试与本地开发的默认选择。
#[derive(Debug, Default)]
pub struct AnonymousAuthenticator;

impl Authenticator for AnonymousAuthenticator {}

/// 基于客户端证书的认证器：语义上强依赖 TLS，明文连接直接拒绝。
#[derive(Debug, Default)]
pub struct CertificateAuthenticator;

impl Authenticator for CertificateAuthenticator {
    fn supports_non_tls(&self) -> bool {
        false
    }
}

/// 进程级随机前缀：所有核心实例共享同一个高 32 位。
static INSTANCE_PREFIX: OnceLock<u32> = OnceLock::new();
/// 进程内单调递增的实例序号，占实例标识低 32 位。
static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(0);

fn next_core_id() -> u64 {
    let prefix = *INSTANCE_PREFIX.get_or_init(rand::random::<u32>);
    let seq = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    (u64::from(prefix) << 32) | u64::from(seq)
}

/// 核心上下文：实例标识 + 环境 + 认证器。
///
/// # 教案式说明
/// - **契约 (What)**：`Clone` 仅复制 `Arc` 句柄；实例标识构造后不变，
///   高 32 位为进程级随机数、低 32 位为单调计数；
/// - **前置条件**：环境的 TLS 配置必须与认证器能力兼容，否则
///   [`new`](Self::new) 以 [`CoreError::InvalidArgument`] 同步失败。
#[derive(Clone, Debug)]
pub struct CoreContext {
    id: u64,
    environment: Arc<CoreEnvironment>,
    authenticator: Arc<dyn Authenticator>,
}

impl CoreContext {
    pub fn new(
        environment: Arc<CoreEnvironment>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, CoreError> {
        let tls = environment.security().tls_enabled();
        if tls && !authenticator.supports_tls() {
            return Err(CoreError::InvalidArgument {
                detail: "TLS is enabled but the authenticator does not support TLS connections"
                    .into(),
            });
        }
        if !tls && !authenticator.supports_non_tls() {
            return Err(CoreError::InvalidArgument {
                detail: "TLS is disabled but the authenticator requires TLS connections".into(),
            });
        }
        Ok(Self {
            id: next_core_id(),
            environment,
            authenticator,
        })
    }

    /// 实例标识：高 32 位进程随机、低 32 位单调序号。
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn environment(&self) -> &Arc<CoreEnvironment> {
        &self.environment
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }
}
