//! # io::chunk 模块说明
//!
//! ## 角色定位（Why）
//! - 每条 HTTP 连接一个双工处理器：出站编码请求并钉上 `Host` 头，入站把
//!   分块响应体喂给增量解析器，头部就绪即向调用方交付携带行流的响应；
//! - 单连接严格 FIFO：同一时刻至多一个在途请求，完成顺序即服务端响应
//!   顺序。
//!
//! ## 不变量（What）
//! - 每个请求恰好一次初始成功或失败；响应一经交付不再重复交付；
//! - 累积缓冲跨分块复用，解析器消费的前缀就地丢弃，通道失效时整体释放；
//! - 写路径编码失败与未知入站消息都表现为“请求失败 + 通道关闭”，
//!   不静默吞没。

pub mod parser;

use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{CancellationReason, CoreError};
use crate::io::{HttpInbound, HttpRequestHead, IoContext};
use crate::request::Request;
use crate::status::ResponseStatus;

pub use parser::{ChunkHeader, ChunkParser, ChunkTrailer, JsonEnvelopeParser, RowStream, TrailerReceiver};

/// 流式 HTTP 请求契约：一个关联响应类型，编码与交付自理。
///
/// 响应在头部就绪时构造——此刻行流与 trailer 只是接收端句柄，调用方
/// 在自己的节奏里消费。
pub trait ChunkedRequest: Request {
    type Response: Send + 'static;

    /// 编码为出站 HTTP 请求；失败将导致请求失败且通道关闭。
    fn encode(&self) -> Result<HttpRequestHead, CoreError>;

    /// 以 (域状态, 头部, 行流, trailer 接收端) 构造响应。
    fn decode(
        &self,
        status: ResponseStatus,
        header: ChunkHeader,
        rows: RowStream,
        trailer: TrailerReceiver,
    ) -> Result<Self::Response, CoreError>;

    /// 交付成功响应；与 [`Request::fail`] 互斥，恰好其一发生一次。
    fn succeed(&self, response: Self::Response);
}

/// 分块响应的初始缓冲容量；覆盖典型头部而不至于浪费。
const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// 每连接的双工流式处理器。
///
/// 所有方法都在该连接的事件循环上被调用（`&mut self`），内部无锁。
/// `read` 返回 `Err` 表示协议层要求关闭通道，调用方关闭后必须再调
/// [`channel_inactive`](Self::channel_inactive) 完成清理。
#[derive(Debug)]
pub struct ChunkedResponseHandler<Q: ChunkedRequest, P: ChunkParser = JsonEnvelopeParser> {
    parser: P,
    current_request: Option<Arc<Q>>,
    response_emitted: bool,
    current_status: u16,
    converted_status: ResponseStatus,
    buffer: BytesMut,
    remote_host: String,
    io: Option<IoContext>,
}

impl<Q: ChunkedRequest, P: ChunkParser> ChunkedResponseHandler<Q, P> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            current_request: None,
            response_emitted: false,
            current_status: 0,
            converted_status: ResponseStatus::Unknown,
            buffer: BytesMut::new(),
            remote_host: String::new(),
            io: None,
        }
    }

    /// 通道激活：分配累积缓冲并缓存对端地址。
    pub fn channel_active(&mut self, remote: &str) {
        self.buffer = BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY);
        self.remote_host = remote.to_string();
        self.io = Some(IoContext {
            remote: remote.to_string(),
        });
    }

    /// 出站：编码请求并钉上 `Host` 头。
    ///
    /// 编码失败按既定策略处理：请求以原始错误失败，返回 `Err` 要求关闭
    /// 通道——半编码的请求绝不能留在连接上。
    pub fn write(&mut self, request: Arc<Q>) -> Result<HttpRequestHead, CoreError> {
        if self.current_request.is_some() {
            request.fail(CoreError::ProtocolViolation {
                detail: "connection already has an in-flight request".into(),
            });
            return Err(CoreError::ProtocolViolation {
                detail: "write while a request is still in flight".into(),
            });
        }
        match request.encode() {
            Ok(mut head) => {
                head.host = self.remote_host.clone();
                self.current_request = Some(request);
                self.response_emitted = false;
                Ok(head)
            }
            Err(error) => {
                let detail = error.to_string();
                request.fail(error);
                Err(CoreError::ProtocolViolation {
                    detail: format!("request encode failed, closing channel: {detail}"),
                })
            }
        }
    }

    /// 入站事件入口。
    pub fn read(&mut self, message: HttpInbound) -> Result<(), CoreError> {
        match message {
            HttpInbound::Head { status } => {
                if self.current_request.is_none() {
                    return Err(CoreError::ProtocolViolation {
                        detail: "received a response head without an in-flight request".into(),
                    });
                }
                self.current_status = status;
                self.converted_status = ResponseStatus::from_http(status);
                self.buffer.clear();
                self.parser.initialize();
                Ok(())
            }
            HttpInbound::Content { chunk, last } => {
                self.buffer.extend_from_slice(&chunk);
                self.drive(last)
            }
            HttpInbound::Unsupported { description } => {
                if let Some(request) = self.current_request.take() {
                    request.fail(CoreError::ProtocolViolation {
                        detail: format!("unsupported inbound message: {description}"),
                    });
                }
                self.cleanup();
                Err(CoreError::ProtocolViolation {
                    detail: format!("unsupported inbound message: {description}"),
                })
            }
        }
    }

    /// 通道失效：在途请求按“对端停听”取消，流式消费者经行流感知，
    /// 累积缓冲整体释放。
    pub fn channel_inactive(&mut self) {
        self.parser
            .abort("channel became inactive while streaming the response");
        if let Some(request) = self.current_request.take() {
            if !self.response_emitted {
                request.cancel(CancellationReason::StoppedListening);
            }
        }
        self.cleanup();
        self.buffer = BytesMut::new();
        self.io = None;
    }

    /// 原始 HTTP 状态码（诊断用）。
    pub fn current_status(&self) -> u16 {
        self.current_status
    }

    fn drive(&mut self, last: bool) -> Result<(), CoreError> {
        if let Err(error) = self.parser.parse(&mut self.buffer) {
            // 头部未交付：错误直接失败请求；已交付：解析器已把错误注入
            // 行流与 trailer，这里只负责关通道。
            if !self.response_emitted {
                if let Some(request) = self.current_request.take() {
                    request.fail(error);
                }
            }
            self.cleanup();
            return Err(CoreError::ProtocolViolation {
                detail: "chunked response parse failed, closing channel".into(),
            });
        }

        self.maybe_emit()?;

        if last {
            let completion = self.parser.signal_complete();
            if !self.response_emitted {
                if let Some(request) = self.current_request.take() {
                    let error = self.parser.error().unwrap_or_else(|| match completion {
                        Err(error) => error,
                        Ok(()) => {
                            CoreError::generic("request failed, no more information available")
                        }
                    });
                    request.fail(error);
                }
            }
            self.cleanup();
        }
        Ok(())
    }

    /// 成功状态且头部就绪时交付响应，恰好一次。
    fn maybe_emit(&mut self) -> Result<(), CoreError> {
        if self.response_emitted || !self.converted_status.success() {
            return Ok(());
        }
        let Some(header) = self.parser.header() else {
            return Ok(());
        };
        let Some(request) = self.current_request.clone() else {
            return Err(CoreError::ProtocolViolation {
                detail: "response body arrived without an in-flight request".into(),
            });
        };
        let (Some(rows), Some(trailer)) = (self.parser.take_rows(), self.parser.take_trailer())
        else {
            return Err(CoreError::ProtocolViolation {
                detail: "parser handed out its streams more than once".into(),
            });
        };
        match request.decode(self.converted_status, header, rows, trailer) {
            Ok(response) => request.succeed(response),
            Err(error) => request.fail(error),
        }
        self.response_emitted = true;
        Ok(())
    }

    fn cleanup(&mut self) {
        self.current_request = None;
        self.response_emitted = false;
        self.current_status = 0;
        self.converted_status = ResponseStatus::Unknown;
        // 缓冲保留容量复用，不回收。
        self.buffer.clear();
    }
}
