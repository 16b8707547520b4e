//! # spark-sproutlet
//!
//! ## 定位与职责（Why）
//! - SIP 代理的可插拔请求路由引擎：入站请求按服务名参数、域名前缀、用户名或接收端口
//!   选中一个 Sproutlet，Sproutlet 可以分叉、改写、回应或继续转发，引擎负责把这些动作
//!   组织成一棵事务树并聚合出唯一的上游最终响应；
//! - 报文编解码、传输与调度线程池由宿主提供，本 Crate 只定义 [`transport::OutboundTransport`]
//!   与 [`core::TimerService`] 两个接入契约。
//!
//! ## 架构嵌入（Where）
//! - `routing` 模块：别名本地性判定、服务注册表与不可变路由视图 [`routing::ProxyRouter`]，
//!   通过 [`routing::RouterHandle`] 热更新；
//! - `core` 模块：事务控制器、Adapter 树、分支状态机、响应聚合与定时器；
//! - `sproutlet` 模块：插件契约 [`sproutlet::Sproutlet`] / [`sproutlet::SproutletTsx`]；
//! - `config` / `error` / `metrics`：装配期配置、错误域与路由计数器。
//!
//! ## 失败语义（Trade-offs）
//! - 装配期错误以 [`SproutletError`] 返回；
//! - 运行期的环路、Max-Forwards 耗尽、分支失败、定时器竞态都转换为合法 SIP 响应或被
//!   静默丢弃，并以 `tracing` 的 `outcome` 字段记录。

/// 装配期配置。
///
/// - **契约定位 (What)**：`serde` 反序列化的 TOML 配置，`validate` 在构建路由器前执行；
/// - **扩展指引 (How)**：新增字段需提供 `#[serde(default)]`，保持旧配置可加载。
pub mod config;

/// 事务运行期状态机的核心入口。
pub mod core;

/// 错误类型与诊断信息集中声明处。
///
/// - **意图说明 (Why)**：统一描述装配期可能出现的配置与注册冲突；
/// - **契约定位 (What)**：使用 `thiserror::Error` 派生。
pub mod error;

/// 引擎可见的最小 SIP 报文模型。
pub mod message;

/// 远端别名路由计数器。
pub mod metrics;

/// 服务选择与本地性判定。
pub mod routing;

/// Sproutlet 插件契约。
pub mod sproutlet;

/// 宿主传输契约与事务/分支标识。
pub mod transport;

/// SIP URI 模型。
pub mod uri;

pub use crate::{
    config::{ProxyConfig, ServiceBinding},
    core::{TransactionController, TransactionTable, TsxContext},
    error::SproutletError,
    message::{Method, SipMessage},
    routing::{ProxyRouter, RouterHandle},
    sproutlet::{Sproutlet, SproutletTsx, TsxDecision},
    uri::SipUri,
};
