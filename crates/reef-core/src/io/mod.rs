//! # io 模块说明
//!
//! 核心与传输管线交界处的消息形态：HTTP 出站请求头、入站分块事件，以及
//! 流式响应处理（见 [`chunk`]）。具体的字节级编解码在核心之外；这里的
//! 类型是处理器与传输实现之间的握手语言。

pub mod chunk;

use bytes::Bytes;

/// 出站 HTTP 请求的逻辑形态；字节化由传输层完成。
#[derive(Clone, Debug)]
pub struct HttpRequestHead {
    pub method: &'static str,
    pub path: String,
    /// `Host` 头；由处理器以通道激活时缓存的对端地址填充。
    pub host: String,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl HttpRequestHead {
    pub fn new(method: &'static str, path: impl Into<String>, body: Bytes) -> Self {
        Self {
            method,
            path: path.into(),
            host: String::new(),
            content_type: "application/json",
            body,
        }
    }
}

/// 入站 HTTP 事件。
///
/// `Unsupported` 表示传输层遇到无法归类的管线消息——按协议违例处理：
/// 在途请求失败、通道关闭，绝不静默丢弃。
#[derive(Clone, Debug)]
pub enum HttpInbound {
    /// 响应头：原始状态码。
    Head { status: u16 },
    /// 响应体分块；`last` 标记终块。
    Content { chunk: Bytes, last: bool },
    /// 未知消息类型，携带描述。
    Unsupported { description: String },
}

/// 通道级上下文，激活时构建，供日志与诊断引用。
#[derive(Clone, Debug)]
pub struct IoContext {
    pub remote: String,
}
