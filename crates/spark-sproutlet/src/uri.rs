//! # SIP URI 模型
//!
//! ## 核心意图（Why）
//! - 路由引擎只关心 URI 的 scheme、user、host、port 与参数（`lr`、`service=` 等），
//!   因此这里提供一个拥有所有权的轻量结构，而不是完整的 RFC 3261 语法树；
//! - 报文的线格式解析由宿主侧完成，本模块的 [`SipUri::parse`] 仅用于配置装载与测试构造。
//!
//! ## 行为契约（What）
//! - 主机名按原样保存，比较时由调用方决定是否忽略大小写（别名表统一转小写）；
//! - 参数名大小写不敏感，保持插入顺序，`Display` 输出与输入顺序一致；
//! - URI header 部分（`?` 之后）在解析时被丢弃，路由决策从不依赖它们。

use std::{fmt, str::FromStr};

use crate::error::SproutletError;

/// URI scheme。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SipScheme {
    #[default]
    Sip,
    Sips,
}

impl SipScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            SipScheme::Sip => "sip",
            SipScheme::Sips => "sips",
        }
    }
}

/// URI 参数，`value` 为 `None` 表示 `;lr` 这类无值参数。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UriParam {
    pub name: String,
    pub value: Option<String>,
}

/// 拥有所有权的 SIP URI。
///
/// # 教案式说明
/// - **意图 (Why)**：Route、Request-URI 与路由 URI 构造都需要在不同 Adapter 之间移动或克隆，
///   使用纯 `String` 字段可以让 `SipMessage` 保持 `Send + 'static`；
/// - **契约 (What)**：
///   - `host` 不包含方括号以外的端口信息，IPv6 字面量保留方括号；
///   - `params` 中同名参数至多出现一次，[`set_param`](Self::set_param) 会覆盖旧值；
/// - **风险 (Trade-offs)**：未保留原始文本，`Display` 输出是规范化后的形式。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub scheme: SipScheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<UriParam>,
}

impl SipUri {
    /// 以主机名构造 `sip:` URI。
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.set_param(name, value);
        self
    }

    /// 解析 `sip:`/`sips:` URI 文本，允许外层带尖括号。
    ///
    /// - **契约 (What)**：成功时返回规范化结构；主机为空、端口非法或 scheme 不受支持时返回
    ///   [`SproutletError::InvalidUri`]；
    /// - **执行 (How)**：依次剥离尖括号、scheme、header、参数，最后拆分 userinfo 与 hostport。
    pub fn parse(text: &str) -> Result<Self, SproutletError> {
        let trimmed = text.trim();
        let inner = trimmed
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .unwrap_or(trimmed);

        let (scheme, rest) = if let Some(rest) = strip_prefix_ignore_case(inner, "sips:") {
            (SipScheme::Sips, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(inner, "sip:") {
            (SipScheme::Sip, rest)
        } else {
            return Err(SproutletError::invalid_uri(text, "unsupported scheme"));
        };

        let without_headers = rest.split('?').next().unwrap_or_default();
        let mut segments = without_headers.split(';');
        let address = segments.next().unwrap_or_default();

        let (user, hostport) = match address.rsplit_once('@') {
            Some((userinfo, hostport)) => {
                let user = userinfo.split(':').next().unwrap_or_default();
                if user.is_empty() {
                    return Err(SproutletError::invalid_uri(text, "empty user part"));
                }
                (Some(user.to_owned()), hostport)
            }
            None => (None, address),
        };

        let (host, port) = split_host_port(hostport).ok_or_else(|| {
            SproutletError::invalid_uri(text, "malformed host or port")
        })?;
        if host.is_empty() {
            return Err(SproutletError::invalid_uri(text, "empty host"));
        }

        let mut uri = SipUri {
            scheme,
            user,
            host: host.to_owned(),
            port,
            params: Vec::new(),
        };
        for segment in segments.filter(|segment| !segment.is_empty()) {
            match segment.split_once('=') {
                Some((name, value)) => uri.set_param(name, Some(value)),
                None => uri.set_param(segment, None),
            }
        }
        Ok(uri)
    }

    /// 查找参数；存在时返回其值（无值参数为 `None`）。
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|param| param.name.eq_ignore_ascii_case(name))
            .map(|param| param.value.as_deref())
    }

    /// 查找带值参数的值。
    pub fn param_value(&self, name: &str) -> Option<&str> {
        self.param(name).flatten()
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    /// 设置参数，同名参数被原位覆盖。
    pub fn set_param(&mut self, name: impl Into<String>, value: Option<&str>) {
        let name = name.into();
        let value = value.map(str::to_owned);
        match self
            .params
            .iter_mut()
            .find(|param| param.name.eq_ignore_ascii_case(&name))
        {
            Some(existing) => existing.value = value,
            None => self.params.push(UriParam { name, value }),
        }
    }

    pub fn remove_param(&mut self, name: &str) -> Option<UriParam> {
        let index = self
            .params
            .iter()
            .position(|param| param.name.eq_ignore_ascii_case(name))?;
        Some(self.params.remove(index))
    }

    /// `host` 或 `host:port` 形式，用于无状态下一跳比对。
    pub fn host_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    /// 是否为 loose-route（带 `lr` 参数）。
    pub fn is_loose_route(&self) -> bool {
        self.has_param("lr")
    }
}

impl FromStr for SipUri {
    type Err = SproutletError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        SipUri::parse(text)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for param in &self.params {
            match &param.value {
                Some(value) => write!(f, ";{}={value}", param.name)?,
                None => write!(f, ";{}", param.name)?,
            }
        }
        Ok(())
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

fn split_host_port(hostport: &str) -> Option<(&str, Option<u16>)> {
    if hostport.starts_with('[') {
        let close = hostport.find(']')?;
        let (host, rest) = hostport.split_at(close + 1);
        return match rest.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if rest.is_empty() => Some((host, None)),
            None => None,
        };
    }
    match hostport.split_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((hostport, None)),
    }
}
