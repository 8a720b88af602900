//! 域级响应状态：把各协议面的原始状态（HTTP 状态码、二进制协议状态字）
//! 折叠成统一的小枚举，调度与流式处理只对它分支。

/// 统一响应状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseStatus {
    /// 请求成功（含部分成功的流式响应，最终结论见 trailer）。
    Success,
    /// 目标对象不存在。
    NotFound,
    /// 凭据不足。
    AccessDenied,
    /// 服务端内部错误。
    InternalServerError,
    /// 服务端过载或限流。
    TooManyRequests,
    /// 其余未归类状态。
    Unknown,
}

impl ResponseStatus {
    /// 从原始 HTTP 状态码折叠。
    pub fn from_http(code: u16) -> Self {
        match code {
            200..=299 => ResponseStatus::Success,
            401 | 403 => ResponseStatus::AccessDenied,
            404 => ResponseStatus::NotFound,
            429 => ResponseStatus::TooManyRequests,
            500..=599 => ResponseStatus::InternalServerError,
            _ => ResponseStatus::Unknown,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ResponseStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_folding_covers_the_interesting_classes() {
        assert!(ResponseStatus::from_http(200).success());
        assert!(ResponseStatus::from_http(204).success());
        assert_eq!(ResponseStatus::from_http(404), ResponseStatus::NotFound);
        assert_eq!(
            ResponseStatus::from_http(500),
            ResponseStatus::InternalServerError
        );
        assert_eq!(
            ResponseStatus::from_http(429),
            ResponseStatus::TooManyRequests
        );
    }
}
