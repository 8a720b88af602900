//! # io::chunk::parser 模块说明
//!
//! ## 角色定位（Why）
//! - 流式 JSON 信封 `{header-members, rows-array, trailer-members}` 的增量
//!   解析器：头部成员尽早产出，行数组逐元素流出，尾部成员在闭括号处一次
//!   交付；
//! - 解析器直接在处理器的累积缓冲上工作，消费多少丢弃多少，长流不积压。
//!
//! ## 设计要求（What）
//! - `parse` 尽力消费：每次调用吃掉所有已完整的词法单元，残缺词元留在
//!   缓冲区开头等待下一个分块；返回值表示是否有进展；
//! - 行的顺序与服务端产出一致（单连接单解析器，天然有序）；
//! - 错误三通道齐发：记录在解析器（供 `error()`）、行流尾部、trailer——
//!   头部已交付的消费者经行流感知，未交付的经处理器失败请求。

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use futures::channel::{mpsc, oneshot};
use serde_json::Value;

use crate::error::CoreError;

/// 行流：头部交付后调用方逐行消费；错误以 `Err` 项终止流。
pub type RowStream = mpsc::UnboundedReceiver<Result<Bytes, CoreError>>;

/// trailer 接收端：最后一行之后恰好完成一次。
pub type TrailerReceiver = oneshot::Receiver<Result<ChunkTrailer, CoreError>>;

/// 信封头：行数组之前解析到的顶层成员。
#[derive(Clone, Debug, Default)]
pub struct ChunkHeader {
    pub fields: serde_json::Map<String, Value>,
}

/// 信封尾：行数组之后（或头部交付之后）解析到的顶层成员。
#[derive(Clone, Debug, Default)]
pub struct ChunkTrailer {
    pub fields: serde_json::Map<String, Value>,
}

/// 流式信封解析契约。处理器按连接独占一个实例，跨响应复用
/// （`initialize` 重置）。
pub trait ChunkParser: Send + fmt::Debug {
    /// 为一个新响应复位内部状态并准备行/trailer 通道。
    fn initialize(&mut self);

    /// 在累积缓冲上推进解析；消费的前缀就地丢弃。
    ///
    /// 返回 `Ok(true)` 表示有进展（消费了字节）；语法错误返回 `Err`，
    /// 此前已把错误送入行流与 trailer。
    fn parse(&mut self, buffer: &mut BytesMut) -> Result<bool, CoreError>;

    /// 头部就绪后恰好返回一次 `Some`。
    fn header(&mut self) -> Option<ChunkHeader>;

    /// 取走行流接收端；每个响应只可取一次。
    fn take_rows(&mut self) -> Option<RowStream>;

    /// 取走 trailer 接收端；每个响应只可取一次。
    fn take_trailer(&mut self) -> Option<TrailerReceiver>;

    /// 响应体已到终块；信封未闭合视为截断错误。
    fn signal_complete(&mut self) -> Result<(), CoreError>;

    /// 通道失效等外因中止；错误送入行流与 trailer。
    fn abort(&mut self, detail: &str);

    /// 解析器此刻能给出的最具体错误（服务端错误成员优先于语法错误）。
    fn error(&self) -> Option<CoreError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Start,
    Members,
    Rows,
    Done,
}

enum Scan {
    Complete(usize),
    NeedMore,
}

/// 通用 JSON 信封解析器。
///
/// `rows_fields` 指定哪些顶层数组按行流式展开（如 `rows`、`results`、
/// `hits`）；其余成员整体解析为值，按出现时机归入头部或尾部。
pub struct JsonEnvelopeParser {
    rows_fields: &'static [&'static str],
    phase: Phase,
    rows_seen: bool,
    header_ready: bool,
    header_taken: bool,
    header_fields: serde_json::Map<String, Value>,
    trailer_fields: serde_json::Map<String, Value>,
    rows_tx: Option<mpsc::UnboundedSender<Result<Bytes, CoreError>>>,
    rows_rx: Option<RowStream>,
    trailer_tx: Option<oneshot::Sender<Result<ChunkTrailer, CoreError>>>,
    trailer_rx: Option<TrailerReceiver>,
    captured_error: Option<(i64, String)>,
    failure_detail: Option<String>,
}

impl fmt::Debug for JsonEnvelopeParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonEnvelopeParser")
            .field("phase", &self.phase)
            .field("header_ready", &self.header_ready)
            .field("rows_seen", &self.rows_seen)
            .finish()
    }
}

impl JsonEnvelopeParser {
    pub fn new(rows_fields: &'static [&'static str]) -> Self {
        Self {
            rows_fields,
            phase: Phase::Start,
            rows_seen: false,
            header_ready: false,
            header_taken: false,
            header_fields: serde_json::Map::new(),
            trailer_fields: serde_json::Map::new(),
            rows_tx: None,
            rows_rx: None,
            trailer_tx: None,
            trailer_rx: None,
            captured_error: None,
            failure_detail: None,
        }
    }

    /// 查询服务形态的信封：`results` 或 `rows` 流式展开。
    pub fn for_query() -> Self {
        Self::new(&["results", "rows"])
    }

    fn accept_member(&mut self, key: String, value: Value) {
        if key == "errors" {
            self.capture_error(&value);
        }
        if !self.rows_seen && !self.header_taken {
            self.header_fields.insert(key, value);
        } else {
            self.trailer_fields.insert(key, value);
        }
    }

    /// 从 `errors` 成员提炼首个 (code, msg)。
    fn capture_error(&mut self, value: &Value) {
        let first = match value {
            Value::Array(items) => items.first(),
            Value::Object(_) => Some(value),
            _ => None,
        };
        if let Some(Value::Object(entry)) = first {
            let code = entry.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = entry
                .get("msg")
                .or_else(|| entry.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            self.captured_error = Some((code, message));
        }
    }

    fn emit_row(&mut self, row: Bytes) {
        if let Some(tx) = &self.rows_tx {
            let _ = tx.unbounded_send(Ok(row));
        }
    }

    fn finish_envelope(&mut self) {
        self.header_ready = true;
        let trailer = ChunkTrailer {
            fields: std::mem::take(&mut self.trailer_fields),
        };
        if let Some(tx) = self.trailer_tx.take() {
            let _ = tx.send(Ok(trailer));
        }
        // 关闭行流：接收端在最后一行之后看到流终结。
        self.rows_tx = None;
    }

    fn fail_streams(&mut self, detail: &str) {
        if self.failure_detail.is_none() {
            self.failure_detail = Some(detail.to_string());
        }
        if let Some(tx) = self.rows_tx.take() {
            let _ = tx.unbounded_send(Err(CoreError::DecodingFailure {
                detail: detail.to_string(),
            }));
        }
        if let Some(tx) = self.trailer_tx.take() {
            let _ = tx.send(Err(CoreError::DecodingFailure {
                detail: detail.to_string(),
            }));
        }
    }

    fn syntax_error(&mut self, detail: String) -> CoreError {
        self.fail_streams(&detail);
        CoreError::DecodingFailure { detail }
    }

    /// 主推进循环；返回消费的前缀长度。
    fn advance(&mut self, buf: &[u8]) -> Result<usize, CoreError> {
        let mut pos = 0usize;
        let mut consumed = 0usize;

        loop {
            match self.phase {
                Phase::Start => {
                    skip_ws(buf, &mut pos);
                    match peek(buf, pos) {
                        None => break,
                        Some(b'{') => {
                            pos += 1;
                            consumed = pos;
                            self.phase = Phase::Members;
                        }
                        Some(other) => {
                            return Err(self.syntax_error(format!(
                                "expected `{{` at envelope start, found 0x{other:02x}"
                            )));
                        }
                    }
                }
                Phase::Members => {
                    skip_ws(buf, &mut pos);
                    let Some(byte) = peek(buf, pos) else { break };
                    match byte {
                        b',' => {
                            pos += 1;
                            consumed = pos;
                        }
                        b'}' => {
                            pos += 1;
                            consumed = pos;
                            self.phase = Phase::Done;
                            self.finish_envelope();
                        }
                        b'"' => {
                            let Scan::Complete(key_end) = scan_string(buf, pos) else {
                                break;
                            };
                            let key: String = serde_json::from_slice(&buf[pos..key_end])
                                .map_err(|e| {
                                    self.syntax_error(format!("invalid member name: {e}"))
                                })?;
                            let mut cursor = key_end;
                            skip_ws(buf, &mut cursor);
                            match peek(buf, cursor) {
                                None => break,
                                Some(b':') => cursor += 1,
                                Some(other) => {
                                    return Err(self.syntax_error(format!(
                                        "expected `:` after member name, found 0x{other:02x}"
                                    )));
                                }
                            }
                            skip_ws(buf, &mut cursor);
                            let Some(first) = peek(buf, cursor) else { break };

                            if first == b'[' && self.rows_fields.contains(&key.as_str()) {
                                pos = cursor + 1;
                                consumed = pos;
                                self.rows_seen = true;
                                self.header_ready = true;
                                self.phase = Phase::Rows;
                            } else {
                                let Scan::Complete(value_end) = scan_value(buf, cursor) else {
                                    break;
                                };
                                let value: Value =
                                    serde_json::from_slice(&buf[cursor..value_end]).map_err(
                                        |e| {
                                            self.syntax_error(format!(
                                                "invalid member value for `{key}`: {e}"
                                            ))
                                        },
                                    )?;
                                self.accept_member(key, value);
                                pos = value_end;
                                consumed = pos;
                                self.header_ready = true;
                            }
                        }
                        other => {
                            return Err(self.syntax_error(format!(
                                "unexpected byte 0x{other:02x} between members"
                            )));
                        }
                    }
                }
                Phase::Rows => {
                    skip_ws(buf, &mut pos);
                    let Some(byte) = peek(buf, pos) else { break };
                    match byte {
                        b',' => {
                            pos += 1;
                            consumed = pos;
                        }
                        b']' => {
                            pos += 1;
                            consumed = pos;
                            self.phase = Phase::Members;
                        }
                        _ => {
                            let Scan::Complete(end) = scan_value(buf, pos) else {
                                break;
                            };
                            let row = Bytes::copy_from_slice(&buf[pos..end]);
                            self.emit_row(row);
                            pos = end;
                            consumed = pos;
                        }
                    }
                }
                Phase::Done => {
                    // 信封已闭合；吞掉残余空白与分隔符。
                    consumed = buf.len();
                    break;
                }
            }
        }

        Ok(consumed)
    }
}

impl ChunkParser for JsonEnvelopeParser {
    fn initialize(&mut self) {
        let (rows_tx, rows_rx) = mpsc::unbounded();
        let (trailer_tx, trailer_rx) = oneshot::channel();
        self.phase = Phase::Start;
        self.rows_seen = false;
        self.header_ready = false;
        self.header_taken = false;
        self.header_fields = serde_json::Map::new();
        self.trailer_fields = serde_json::Map::new();
        self.rows_tx = Some(rows_tx);
        self.rows_rx = Some(rows_rx);
        self.trailer_tx = Some(trailer_tx);
        self.trailer_rx = Some(trailer_rx);
        self.captured_error = None;
        self.failure_detail = None;
    }

    fn parse(&mut self, buffer: &mut BytesMut) -> Result<bool, CoreError> {
        let consumed = self.advance(&buffer[..])?;
        if consumed > 0 {
            buffer.advance(consumed);
        }
        Ok(consumed > 0)
    }

    fn header(&mut self) -> Option<ChunkHeader> {
        if self.header_ready && !self.header_taken {
            self.header_taken = true;
            return Some(ChunkHeader {
                fields: std::mem::take(&mut self.header_fields),
            });
        }
        None
    }

    fn take_rows(&mut self) -> Option<RowStream> {
        self.rows_rx.take()
    }

    fn take_trailer(&mut self) -> Option<TrailerReceiver> {
        self.trailer_rx.take()
    }

    fn signal_complete(&mut self) -> Result<(), CoreError> {
        if self.phase == Phase::Done {
            return Ok(());
        }
        let detail = "stream ended before the response envelope completed";
        self.fail_streams(detail);
        Err(CoreError::DecodingFailure {
            detail: detail.to_string(),
        })
    }

    fn abort(&mut self, detail: &str) {
        if self.phase != Phase::Done {
            self.fail_streams(detail);
        }
    }

    fn error(&self) -> Option<CoreError> {
        if let Some((code, message)) = &self.captured_error {
            return Some(CoreError::RequestFailed {
                code: *code,
                message: message.clone(),
            });
        }
        self.failure_detail
            .as_ref()
            .map(|detail| CoreError::DecodingFailure {
                detail: detail.clone(),
            })
    }
}

fn peek(buf: &[u8], pos: usize) -> Option<u8> {
    buf.get(pos).copied()
}

fn skip_ws(buf: &[u8], pos: &mut usize) {
    while let Some(byte) = buf.get(*pos) {
        if matches!(byte, b' ' | b'\t' | b'\r' | b'\n') {
            *pos += 1;
        } else {
            break;
        }
    }
}

/// 扫描 `buf[start..]` 处的完整 JSON 字符串，返回闭引号后的下标。
fn scan_string(buf: &[u8], start: usize) -> Scan {
    debug_assert_eq!(buf.get(start), Some(&b'"'));
    let mut idx = start + 1;
    let mut escaped = false;
    while let Some(byte) = buf.get(idx) {
        if escaped {
            escaped = false;
        } else {
            match byte {
                b'\\' => escaped = true,
                b'"' => return Scan::Complete(idx + 1),
                _ => {}
            }
        }
        idx += 1;
    }
    Scan::NeedMore
}

/// 扫描一个完整 JSON 值（任意类型），返回值结束后的下标。
///
/// 标量依赖后随分隔符判定完结——信封语法保证值后必有 `,`、`]` 或 `}`，
/// 因此缓冲耗尽一律按“待续”处理而不是贸然收尾。
fn scan_value(buf: &[u8], start: usize) -> Scan {
    match buf.get(start) {
        None => Scan::NeedMore,
        Some(b'"') => scan_string(buf, start),
        Some(b'{') | Some(b'[') => {
            let mut depth = 0usize;
            let mut idx = start;
            let mut in_string = false;
            let mut escaped = false;
            while let Some(byte) = buf.get(idx) {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if *byte == b'\\' {
                        escaped = true;
                    } else if *byte == b'"' {
                        in_string = false;
                    }
                } else {
                    match byte {
                        b'"' => in_string = true,
                        b'{' | b'[' => depth += 1,
                        b'}' | b']' => {
                            depth -= 1;
                            if depth == 0 {
                                return Scan::Complete(idx + 1);
                            }
                        }
                        _ => {}
                    }
                }
                idx += 1;
            }
            Scan::NeedMore
        }
        Some(_) => {
            let mut idx = start;
            while let Some(byte) = buf.get(idx) {
                if matches!(byte, b',' | b'}' | b']' | b' ' | b'\t' | b'\r' | b'\n') {
                    return Scan::Complete(idx);
                }
                idx += 1;
            }
            Scan::NeedMore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_rows(rows: &mut RowStream) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(Some(item)) = rows.try_next() {
            out.push(item.expect("row stream errored"));
        }
        out
    }

    /// 三分块信封：头部早出，两行流出，trailer 收尾。
    #[test]
    fn envelope_streams_across_chunk_boundaries() {
        let mut parser = JsonEnvelopeParser::for_query();
        parser.initialize();
        let mut rows = parser.take_rows().unwrap();
        let mut trailer = parser.take_trailer().unwrap();
        let mut buffer = BytesMut::new();

        buffer.extend_from_slice(br#"{"requestID":"77f0a2-11","#);
        assert!(parser.parse(&mut buffer).unwrap());
        let header = parser.header().expect("header after first member");
        assert_eq!(header.fields["requestID"], "77f0a2-11");
        assert!(parser.header().is_none(), "header hands out exactly once");

        buffer.extend_from_slice(br#""rows":[{"a":1},{"b":2}],"#);
        assert!(parser.parse(&mut buffer).unwrap());
        let emitted = drain_rows(&mut rows);
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].as_ref(), br#"{"a":1}"#);
        assert_eq!(emitted[1].as_ref(), br#"{"b":2}"#);

        buffer.extend_from_slice(br#""status":"success"}"#);
        assert!(parser.parse(&mut buffer).unwrap());
        parser.signal_complete().unwrap();
        let trailer = trailer.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(trailer.fields["status"], "success");
        assert!(buffer.is_empty(), "consumed prefix is discarded");
    }

    /// 词元横跨分块边界：残缺行留在缓冲区等待补齐。
    #[test]
    fn partial_row_waits_for_more_bytes() {
        let mut parser = JsonEnvelopeParser::for_query();
        parser.initialize();
        let mut rows = parser.take_rows().unwrap();
        let mut buffer = BytesMut::new();

        buffer.extend_from_slice(br#"{"rows":[{"a":"#);
        parser.parse(&mut buffer).unwrap();
        assert!(drain_rows(&mut rows).is_empty());

        buffer.extend_from_slice(br#"1}]}"#);
        parser.parse(&mut buffer).unwrap();
        let emitted = drain_rows(&mut rows);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].as_ref(), br#"{"a":1}"#);
    }

    /// `errors` 成员被提炼为服务端错误。
    #[test]
    fn server_errors_are_captured() {
        let mut parser = JsonEnvelopeParser::for_query();
        parser.initialize();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(br#"{"errors":[{"code":1234,"msg":"x"}]}"#);
        parser.parse(&mut buffer).unwrap();
        parser.signal_complete().unwrap();
        match parser.error() {
            Some(CoreError::RequestFailed { code, message }) => {
                assert_eq!(code, 1234);
                assert_eq!(message, "x");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// 截断的信封在终块信号处定性为解码失败。
    #[test]
    fn truncated_envelope_fails_on_complete_signal() {
        let mut parser = JsonEnvelopeParser::for_query();
        parser.initialize();
        let mut rows = parser.take_rows().unwrap();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(br#"{"rows":[{"a":1}"#);
        parser.parse(&mut buffer).unwrap();
        assert_eq!(drain_rows(&mut rows).len(), 1);

        assert!(parser.signal_complete().is_err());
        // 行流以错误终止。
        match rows.try_next() {
            Ok(Some(Err(CoreError::DecodingFailure { .. }))) => {}
            other => panic!("row stream should end with an error, got {other:?}"),
        }
    }

    /// 非法字节立刻判为语法错误。
    #[test]
    fn garbage_is_a_syntax_error() {
        let mut parser = JsonEnvelopeParser::for_query();
        parser.initialize();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(b"xml?");
        assert!(parser.parse(&mut buffer).is_err());
        assert!(parser.error().is_some());
    }

    /// 行数组之后的成员归入 trailer 而不是头部。
    #[test]
    fn members_after_rows_land_in_the_trailer() {
        let mut parser = JsonEnvelopeParser::for_query();
        parser.initialize();
        let mut trailer = parser.take_trailer().unwrap();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(
            br#"{"requestID":"r1","results":[],"metrics":{"resultCount":0},"status":"success"}"#,
        );
        parser.parse(&mut buffer).unwrap();
        let header = parser.header().unwrap();
        assert!(header.fields.contains_key("requestID"));
        assert!(!header.fields.contains_key("metrics"));
        let trailer = trailer.try_recv().unwrap().unwrap().unwrap();
        assert!(trailer.fields.contains_key("metrics"));
        assert_eq!(trailer.fields["status"], "success");
    }
}
