//! 分块流式响应处理集成测试。
//!
//! # 教案级导览
//! - **Why**：流式处理器承诺“每请求恰好一次初始成败、头部尽早、行有序、
//!   trailer 收尾”，这些不变量必须在成功、服务端报错、通道失效与编码
//!   失败四类路径上都成立；
//! - **How**：直接驱动处理器的生命周期入口（channel_active / write /
//!   read / channel_inactive），以流式探针请求观察交付物。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;

use reef_core::test_support::StreamingProbeRequest;
use reef_core::{
    CancellationReason, ChunkedResponseHandler, CoreError, HttpInbound, JsonEnvelopeParser,
    ResponseStatus,
};

fn handler() -> ChunkedResponseHandler<StreamingProbeRequest> {
    let mut handler = ChunkedResponseHandler::new(JsonEnvelopeParser::for_query());
    handler.channel_active("10.0.0.1:8093");
    handler
}

fn chunk(bytes: &'static [u8]) -> HttpInbound {
    HttpInbound::Content {
        chunk: Bytes::from_static(bytes),
        last: false,
    }
}

fn last_chunk(bytes: &'static [u8]) -> HttpInbound {
    HttpInbound::Content {
        chunk: Bytes::from_static(bytes),
        last: true,
    }
}

/// 场景 4：200 + 三分块信封。首个分块产出头部即交付响应；随后两行
/// 流出；trailer 以 status=success 收尾。
#[tokio::test]
async fn chunked_success_streams_header_rows_and_trailer() {
    let mut handler = handler();
    let (request, rx) = StreamingProbeRequest::new(Duration::from_secs(2));

    let head = handler.write(Arc::clone(&request)).unwrap();
    assert_eq!(head.host, "10.0.0.1:8093", "Host 头取通道缓存的对端");

    handler.read(HttpInbound::Head { status: 200 }).unwrap();
    handler
        .read(chunk(br#"{"requestID":"9d4f-22","#))
        .unwrap();

    // 头部已就绪：请求此刻成功，行与 trailer 尚未到达。
    let mut response = rx.await.unwrap().unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.header.fields["requestID"], "9d4f-22");

    handler
        .read(chunk(br#""rows":[{"id":1},{"id":2}],"#))
        .unwrap();
    handler.read(last_chunk(br#""status":"success"}"#)).unwrap();

    let first = response.rows.next().await.unwrap().unwrap();
    assert_eq!(first.as_ref(), br#"{"id":1}"#);
    let second = response.rows.next().await.unwrap().unwrap();
    assert_eq!(second.as_ref(), br#"{"id":2}"#);
    assert!(response.rows.next().await.is_none(), "行流在 trailer 前终结");

    let trailer = response.trailer.await.unwrap().unwrap();
    assert_eq!(trailer.fields["status"], "success");
}

/// 场景 5：500 + 单块错误信封。请求以解析出的服务端错误失败，
/// 不交付任何响应。
#[tokio::test]
async fn chunked_failure_surfaces_the_server_error() {
    let mut handler = handler();
    let (request, rx) = StreamingProbeRequest::new(Duration::from_secs(2));

    handler.write(Arc::clone(&request)).unwrap();
    handler.read(HttpInbound::Head { status: 500 }).unwrap();
    handler
        .read(last_chunk(br#"{"errors":[{"code":1234,"msg":"x"}]}"#))
        .unwrap();

    match rx.await.unwrap() {
        Err(CoreError::RequestFailed { code, message }) => {
            assert_eq!(code, 1234);
            assert_eq!(message, "x");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// 非成功状态且信封不含可解析错误：回退到通用失败。
#[tokio::test]
async fn chunked_failure_without_details_falls_back_to_generic() {
    let mut handler = handler();
    let (request, rx) = StreamingProbeRequest::new(Duration::from_secs(2));

    handler.write(Arc::clone(&request)).unwrap();
    handler.read(HttpInbound::Head { status: 503 }).unwrap();
    handler.read(last_chunk(br#"{}"#)).unwrap();

    match rx.await.unwrap() {
        Err(CoreError::Generic { detail, .. }) => {
            assert!(detail.contains("no more information"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// 头部交付后的通道失效：调用方经行流看到错误终止，trailer 同步失败。
#[tokio::test]
async fn channel_loss_mid_stream_error_terminates_the_rows() {
    let mut handler = handler();
    let (request, rx) = StreamingProbeRequest::new(Duration::from_secs(2));

    handler.write(Arc::clone(&request)).unwrap();
    handler.read(HttpInbound::Head { status: 200 }).unwrap();
    handler
        .read(chunk(br#"{"requestID":"r1","rows":[{"id":1},"#))
        .unwrap();

    let mut response = rx.await.unwrap().unwrap();
    let first = response.rows.next().await.unwrap().unwrap();
    assert_eq!(first.as_ref(), br#"{"id":1}"#);

    handler.channel_inactive();

    match response.rows.next().await {
        Some(Err(CoreError::DecodingFailure { .. })) => {}
        other => panic!("rows must terminate with an error, got {other:?}"),
    }
    assert!(response.trailer.await.unwrap().is_err());
}

/// 头部交付前的通道失效：请求以 *stopped listening* 取消。
#[tokio::test]
async fn channel_loss_before_the_header_cancels_the_request() {
    let mut handler = handler();
    let (request, rx) = StreamingProbeRequest::new(Duration::from_secs(2));

    handler.write(Arc::clone(&request)).unwrap();
    handler.read(HttpInbound::Head { status: 200 }).unwrap();
    handler.read(chunk(br#"{"request"#)).unwrap();
    handler.channel_inactive();

    match rx.await.unwrap() {
        Err(CoreError::RequestCanceled {
            reason: CancellationReason::StoppedListening,
        }) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// 写路径编码失败：请求失败且处理器要求关闭通道（绝不静默丢弃）。
#[tokio::test]
async fn encode_failure_fails_the_request_and_closes_the_channel() {
    let mut handler = handler();
    let (request, rx) = StreamingProbeRequest::with_encode_failure(Duration::from_secs(2), true);

    let outcome = handler.write(Arc::clone(&request));
    assert!(outcome.is_err(), "handler demands a channel close");
    match rx.await.unwrap() {
        Err(CoreError::InvalidArgument { .. }) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// 未知入站消息是协议违例：在途请求失败，通道关闭。
#[tokio::test]
async fn unsupported_inbound_is_a_protocol_violation() {
    let mut handler = handler();
    let (request, rx) = StreamingProbeRequest::new(Duration::from_secs(2));

    handler.write(Arc::clone(&request)).unwrap();
    let outcome = handler.read(HttpInbound::Unsupported {
        description: "websocket frame".into(),
    });
    assert!(outcome.is_err());
    match rx.await.unwrap() {
        Err(CoreError::ProtocolViolation { detail }) => {
            assert!(detail.contains("websocket frame"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// 截断的成功响应（终块早到）：头部未交付时以解析器错误失败。
#[tokio::test]
async fn truncated_success_body_fails_with_a_decoding_error() {
    let mut handler = handler();
    let (request, rx) = StreamingProbeRequest::new(Duration::from_secs(2));

    handler.write(Arc::clone(&request)).unwrap();
    handler.read(HttpInbound::Head { status: 200 }).unwrap();
    let outcome = handler.read(last_chunk(br#"{"request"#));
    assert!(outcome.is_ok(), "截断不是协议违例，通道可以继续复用");

    match rx.await.unwrap() {
        Err(CoreError::DecodingFailure { .. }) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
}
