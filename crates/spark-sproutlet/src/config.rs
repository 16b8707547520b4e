//! # ProxyConfig：路由引擎的装配配置
//!
//! ## 核心意图（Why）
//! - 集中描述部署的根 URI、本地/远端别名、无状态下一跳，以及服务绑定的先后顺序；
//! - 以 TOML 作为载体，由宿主在启动或热更新时解析后交给
//!   [`ProxyRouterBuilder`](crate::routing::ProxyRouterBuilder) 构建不可变路由器。
//!
//! ## 行为契约（What）
//! - 未出现的可选字段取默认值：`always_serve_remote_aliases = false`，
//!   `max_sproutlet_depth = 50`，其余集合为空；
//! - 未知字段直接拒绝，避免拼写错误被静默忽略；
//! - [`ProxyConfig::validate`] 负责语义校验（根 URI 可解析、最大深度非零、绑定名称非空）。
//!
//! ## 示例
//! ```toml
//! root_uri = "sip:sprout.example.com:5054"
//! local_aliases = ["sprout.example.com", "10.0.0.1"]
//! remote_aliases = ["sprout-site2.example.com"]
//!
//! [[services]]
//! name = "scscf"
//! port = 5054
//!
//! [[services]]
//! name = "icscf"
//! network_function = "icscf"
//! ```

use serde::Deserialize;

use crate::{error::SproutletError, uri::SipUri};

/// 单个事务内 Sproutlet 嵌套深度的默认上限。
pub const DEFAULT_MAX_SPROUTLET_DEPTH: u32 = 50;

fn default_max_sproutlet_depth() -> u32 {
    DEFAULT_MAX_SPROUTLET_DEPTH
}

/// 路由引擎配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// 部署的根 URI，其主机名自动加入本地别名集合。
    pub root_uri: String,
    #[serde(default)]
    pub local_aliases: Vec<String>,
    #[serde(default)]
    pub remote_aliases: Vec<String>,
    /// 为 `true` 时，远端别名命中一律在本地处理，不再考虑网络功能边界。
    #[serde(default)]
    pub always_serve_remote_aliases: bool,
    #[serde(default = "default_max_sproutlet_depth")]
    pub max_sproutlet_depth: u32,
    /// `host` 或 `host:port` 形式的无状态下一跳列表。
    #[serde(default)]
    pub stateless_proxies: Vec<String>,
    /// 按优先级排列的服务绑定；为空时注册所有已提供的实现。
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
}

/// 服务绑定：把对外服务名映射到已注册的 Sproutlet 实现。
///
/// # 教案式说明
/// - **意图 (Why)**：同一实现可以以不同服务名、端口、网络功能标签多次挂载；
/// - **契约 (What)**：
///   - `implementation` 缺省时与 `name` 相同；
///   - 绑定名与实现名相同时，`aliases` 与实现声明的别名合并，`port`、`network_function`
///     缺省时沿用实现的声明；改名挂载时只使用绑定中写明的值；
///   - 网络功能最终缺省为服务名。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceBinding {
    pub name: String,
    #[serde(default)]
    pub implementation: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub network_function: Option<String>,
}

impl ServiceBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// 绑定引用的实现名。
    pub fn implementation_name(&self) -> &str {
        self.implementation.as_deref().unwrap_or(&self.name)
    }
}

impl ProxyConfig {
    /// 以根 URI 构造其余字段取默认值的配置。
    pub fn new(root_uri: impl Into<String>) -> Self {
        Self {
            root_uri: root_uri.into(),
            local_aliases: Vec::new(),
            remote_aliases: Vec::new(),
            always_serve_remote_aliases: false,
            max_sproutlet_depth: DEFAULT_MAX_SPROUTLET_DEPTH,
            stateless_proxies: Vec::new(),
            services: Vec::new(),
        }
    }

    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self, SproutletError> {
        let config: ProxyConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 语义校验，返回解析后的根 URI。
    pub fn validate(&self) -> Result<SipUri, SproutletError> {
        let root = SipUri::parse(&self.root_uri)?;
        if self.max_sproutlet_depth == 0 {
            return Err(SproutletError::InvalidConfig {
                detail: "max_sproutlet_depth must be at least 1".to_owned(),
            });
        }
        if let Some(binding) = self.services.iter().find(|binding| binding.name.is_empty()) {
            return Err(SproutletError::InvalidConfig {
                detail: format!(
                    "service binding for implementation `{}` has an empty name",
                    binding.implementation_name()
                ),
            });
        }
        Ok(root)
    }
}
