//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为 Sproutlet 路由引擎在**装配期**可能出现的错误提供集中定义：配置解析、服务注册冲突、
//!   URI 格式不合法等；
//! - 事务运行期的异常（环路、分支失败、定时器竞态）不会以 `Err` 形式外泄，而是由控制器
//!   转换为合法的 SIP 响应，因此不在本枚举中出现。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，兼容 `std::error::Error`；
//! - 变体携带可读上下文（服务名、端口、原始文本），便于启动失败时快速定位配置问题。

use thiserror::Error;

/// Sproutlet 引擎的装配期错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：路由器、配置与 URI 构造都在进程启动或热更新时执行，错误需要精确指出
///   冲突项，避免运维人员在大段配置中盲目排查；
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可跨线程传播；
///   - `Config` 变体保留 `toml` 的原始诊断信息；
/// - **设计权衡 (Trade-offs)**：上下文使用 `String` 保存，牺牲少量分配换取易读性，
///   这些路径均不在请求热路径上。
#[derive(Debug, Error)]
pub enum SproutletError {
    /// 服务名称或别名已被其它服务占用。
    #[error("service name `{name}` is already registered")]
    DuplicateService { name: String },

    /// 同一端口绑定了多个服务。
    #[error("port {port} is already bound to service `{existing}`")]
    DuplicatePort { port: u16, existing: String },

    /// 配置中的服务绑定引用了未注册的实现。
    #[error("service binding `{binding}` refers to unknown implementation `{implementation}`")]
    UnknownImplementation {
        binding: String,
        implementation: String,
    },

    /// URI 文本无法解析。
    #[error("invalid SIP URI `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: &'static str },

    /// 配置语义校验失败，例如最大深度为 0。
    #[error("invalid proxy configuration: {detail}")]
    InvalidConfig { detail: String },

    /// TOML 文本解析失败。
    #[error("failed to parse proxy configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl SproutletError {
    pub(crate) fn invalid_uri(uri: &str, reason: &'static str) -> Self {
        SproutletError::InvalidUri {
            uri: uri.to_owned(),
            reason,
        }
    }
}
