//! # SipMessage：路由引擎内部流转的报文模型
//!
//! ## 核心意图（Why）
//! - Sproutlet 树中的每一跳都可能改写、克隆或丢弃报文，且报文需要在 Adapter、控制器与
//!   出站传输之间转移所有权；因此这里采用拥有所有权的结构，而非借用原始缓冲区的零拷贝视图；
//! - 只建模路由所需的字段：起始行、Route 集合、Max-Forwards、Call-ID、CSeq，以及透传的
//!   其余头部与消息体。
//!
//! ## 行为契约（What）
//! - 每个 `SipMessage` 只有一个所有者；未发送的报文在所有退出路径上随作用域释放；
//! - [`SipMessage::response_to`] 与 [`SipMessage::cancel_for`] 负责复制事务匹配所需的
//!   Call-ID / CSeq / Via 等字段，调用方无需关心细节。

use std::{collections::VecDeque, fmt};

use crate::uri::SipUri;

/// SIP 方法枚举，保留常见标准方法并支持自定义扩展。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Options,
    Bye,
    Cancel,
    Register,
    Prack,
    Subscribe,
    Notify,
    Publish,
    Info,
    Refer,
    Message,
    Update,
    /// 未被标准枚举覆盖的其它方法，保存原始 token。
    Extension(String),
}

impl Method {
    /// 根据 token 构造方法枚举。
    pub fn from_token(token: &str) -> Self {
        match token {
            "INVITE" => Self::Invite,
            "ACK" => Self::Ack,
            "OPTIONS" => Self::Options,
            "BYE" => Self::Bye,
            "CANCEL" => Self::Cancel,
            "REGISTER" => Self::Register,
            "PRACK" => Self::Prack,
            "SUBSCRIBE" => Self::Subscribe,
            "NOTIFY" => Self::Notify,
            "PUBLISH" => Self::Publish,
            "INFO" => Self::Info,
            "REFER" => Self::Refer,
            "MESSAGE" => Self::Message,
            "UPDATE" => Self::Update,
            other => Self::Extension(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Invite => "INVITE",
            Self::Ack => "ACK",
            Self::Options => "OPTIONS",
            Self::Bye => "BYE",
            Self::Cancel => "CANCEL",
            Self::Register => "REGISTER",
            Self::Prack => "PRACK",
            Self::Subscribe => "SUBSCRIBE",
            Self::Notify => "NOTIFY",
            Self::Publish => "PUBLISH",
            Self::Info => "INFO",
            Self::Refer => "REFER",
            Self::Message => "MESSAGE",
            Self::Update => "UPDATE",
            Self::Extension(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 起始行：请求行或状态行。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: SipUri },
    Response { status: u16, reason: String },
}

/// 透传的普通头部。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// 事务匹配需要随响应/CANCEL 复制的头部。
const TRANSACTION_HEADERS: [&str; 3] = ["Via", "From", "To"];

/// 新建请求的默认 Max-Forwards（RFC 3261 §8.1.1.6）。
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// 路由引擎使用的 SIP 报文。
///
/// # 教案式说明
/// - **意图 (Why)**：为 Sproutlet 模块提供可修改、可克隆的报文，同时让引擎能够读取
///   Route、Max-Forwards 等路由关键字段；
/// - **契约 (What)**：
///   - `routes` 按报文顺序保存 Route 头，队首即“top Route”；
///   - `max_forwards` 为 `None` 表示报文未携带该头部（响应通常如此）；
///   - 其余头部按插入顺序保存，名称比较忽略大小写；
/// - **风险 (Trade-offs)**：没有保留原始字节，序列化由宿主侧的编解码层负责。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    start_line: StartLine,
    call_id: String,
    cseq: u32,
    cseq_method: Method,
    max_forwards: Option<u32>,
    routes: VecDeque<SipUri>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl SipMessage {
    /// 构造请求，默认 CSeq 为 1、Max-Forwards 为 70。
    pub fn request(method: Method, uri: SipUri) -> Self {
        Self {
            cseq_method: method.clone(),
            start_line: StartLine::Request { method, uri },
            call_id: String::new(),
            cseq: 1,
            max_forwards: Some(DEFAULT_MAX_FORWARDS),
            routes: VecDeque::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// 为 `request` 生成响应。
    ///
    /// - **契约 (What)**：复制 Call-ID、CSeq 与 Via/From/To；`reason` 缺省时取标准短语；
    ///   响应不携带 Route 与 Max-Forwards。
    pub fn response_to(request: &SipMessage, status: u16, reason: Option<&str>) -> Self {
        Self {
            start_line: StartLine::Response {
                status,
                reason: reason.unwrap_or(reason_phrase(status)).to_owned(),
            },
            call_id: request.call_id.clone(),
            cseq: request.cseq,
            cseq_method: request.cseq_method.clone(),
            max_forwards: None,
            routes: VecDeque::new(),
            headers: request.transaction_headers(),
            body: Vec::new(),
        }
    }

    /// 为已发出的 `request` 构造 CANCEL（RFC 3261 §9.1）。
    ///
    /// - **契约 (What)**：Request-URI、Call-ID、CSeq 序号与 Route 集合与原请求一致；
    ///   `status` 非 0 时追加 RFC 3326 `Reason` 头。
    pub fn cancel_for(request: &SipMessage, status: u16, reason: &str) -> Self {
        let uri = request
            .request_uri()
            .cloned()
            .unwrap_or_default();
        let mut cancel = Self {
            start_line: StartLine::Request {
                method: Method::Cancel,
                uri,
            },
            call_id: request.call_id.clone(),
            cseq: request.cseq,
            cseq_method: Method::Cancel,
            max_forwards: Some(DEFAULT_MAX_FORWARDS),
            routes: request.routes.clone(),
            headers: request.transaction_headers(),
            body: Vec::new(),
        };
        if status != 0 {
            cancel.add_header(
                "Reason",
                format!("SIP;cause={status};text=\"{reason}\""),
            );
        }
        cancel
    }

    #[must_use]
    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    #[must_use]
    pub fn with_cseq(mut self, cseq: u32) -> Self {
        self.cseq = cseq;
        self
    }

    #[must_use]
    pub fn with_max_forwards(mut self, max_forwards: Option<u32>) -> Self {
        self.max_forwards = max_forwards;
        self
    }

    /// 在 Route 集合末尾追加一条路由。
    #[must_use]
    pub fn with_route(mut self, route: SipUri) -> Self {
        self.routes.push_back(route);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start_line
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    /// 报文是否为 `method` 请求。
    pub fn is_method(&self, method: &Method) -> bool {
        self.method() == Some(method)
    }

    pub fn is_ack(&self) -> bool {
        self.is_method(&Method::Ack)
    }

    pub fn request_uri(&self) -> Option<&SipUri> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri_mut(&mut self) -> Option<&mut SipUri> {
        match &mut self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    /// 是否为最终响应（≥ 200）。请求返回 `false`。
    pub fn is_final_response(&self) -> bool {
        self.status_code().is_some_and(|status| status >= 200)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn cseq_method(&self) -> &Method {
        &self.cseq_method
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.max_forwards
    }

    pub fn set_max_forwards(&mut self, value: Option<u32>) {
        self.max_forwards = value;
    }

    /// Max-Forwards 减一并返回新值；头部缺失时保持缺失。
    pub fn decrement_max_forwards(&mut self) -> Option<u32> {
        if let Some(value) = self.max_forwards.as_mut() {
            *value = value.saturating_sub(1);
        }
        self.max_forwards
    }

    pub fn routes(&self) -> impl ExactSizeIterator<Item = &SipUri> {
        self.routes.iter()
    }

    pub fn top_route(&self) -> Option<&SipUri> {
        self.routes.front()
    }

    pub fn pop_route(&mut self) -> Option<SipUri> {
        self.routes.pop_front()
    }

    /// 将 `route` 压为新的 top Route。
    pub fn push_route(&mut self, route: SipUri) {
        self.routes.push_front(route);
    }

    /// 移除所有满足谓词的 Route，保持其余顺序。
    pub fn retain_routes(&mut self, keep: impl FnMut(&SipUri) -> bool) {
        self.routes.retain(keep);
    }

    /// 按名称（忽略大小写）读取首个头部值。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// 替换同名头部；不存在时追加。
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers
            .retain(|header| !header.name.eq_ignore_ascii_case(&name));
        self.add_header(name, value);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// 日志用的一行摘要，例如 `INVITE sip:bob@example.com` 或 `180 Ringing`。
    pub fn summary(&self) -> String {
        match &self.start_line {
            StartLine::Request { method, uri } => format!("{method} {uri}"),
            StartLine::Response { status, reason } => format!("{status} {reason}"),
        }
    }

    fn transaction_headers(&self) -> Vec<Header> {
        self.headers
            .iter()
            .filter(|header| {
                TRANSACTION_HEADERS
                    .iter()
                    .any(|name| header.name.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect()
    }
}

/// 常用状态码的标准短语；未知状态码返回空串。
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipMessage {
        SipMessage::request(
            Method::Invite,
            SipUri::new("example.com").with_user("bob"),
        )
        .with_call_id("call-1")
        .with_cseq(7)
        .with_header("Via", "SIP/2.0/UDP 10.0.0.1;branch=z9hG4bK1")
        .with_header("From", "<sip:alice@example.com>;tag=1")
        .with_header("To", "<sip:bob@example.com>")
        .with_header("Subject", "lunch")
        .with_route(SipUri::new("edge.example.com").with_param("lr", None))
    }

    #[test]
    fn response_copies_transaction_fields_only() {
        let request = invite();
        let response = SipMessage::response_to(&request, 486, None);
        assert_eq!(response.status_code(), Some(486));
        assert_eq!(response.reason(), Some("Busy Here"));
        assert_eq!(response.call_id(), "call-1");
        assert_eq!(response.cseq(), 7);
        assert_eq!(response.cseq_method(), &Method::Invite);
        assert!(response.header("via").is_some());
        assert!(response.header("Subject").is_none());
        assert_eq!(response.top_route(), None);
        assert_eq!(response.max_forwards(), None);
    }

    #[test]
    fn cancel_mirrors_request_and_carries_reason() {
        let request = invite();
        let cancel = SipMessage::cancel_for(&request, 200, "Call completed elsewhere");
        assert!(cancel.is_method(&Method::Cancel));
        assert_eq!(cancel.request_uri(), request.request_uri());
        assert_eq!(cancel.cseq(), 7);
        assert_eq!(cancel.cseq_method(), &Method::Cancel);
        assert_eq!(cancel.routes().len(), 1);
        assert_eq!(
            cancel.header("Reason"),
            Some("SIP;cause=200;text=\"Call completed elsewhere\"")
        );

        let bare = SipMessage::cancel_for(&request, 0, "");
        assert!(bare.header("Reason").is_none());
    }

    #[test]
    fn route_stack_operations() {
        let mut request = invite();
        request.push_route(SipUri::new("first.example.com"));
        assert_eq!(request.top_route().map(|uri| uri.host.as_str()), Some("first.example.com"));
        assert_eq!(request.pop_route().map(|uri| uri.host), Some("first.example.com".to_owned()));
        request.retain_routes(|uri| uri.host != "edge.example.com");
        assert_eq!(request.routes().len(), 0);
    }

    #[test]
    fn max_forwards_saturates_at_zero() {
        let mut request = invite().with_max_forwards(Some(1));
        assert_eq!(request.decrement_max_forwards(), Some(0));
        assert_eq!(request.decrement_max_forwards(), Some(0));

        let mut missing = invite().with_max_forwards(None);
        assert_eq!(missing.decrement_max_forwards(), None);
    }

    #[test]
    fn method_tokens_round_trip() {
        assert_eq!(Method::from_token("SUBSCRIBE"), Method::Subscribe);
        assert_eq!(Method::from_token("FOO").as_str(), "FOO");
        assert_eq!(invite().summary(), "INVITE sip:bob@example.com");
    }
}
