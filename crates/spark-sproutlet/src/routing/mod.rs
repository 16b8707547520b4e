//! # routing：服务选择与本地性判定
//!
//! - [`locality`]：别名表与服务匹配（纯函数）；
//! - [`registry`]：服务注册表；
//! - [`router`]：组合前两者的 [`ProxyRouter`] 以及热更新句柄 [`RouterHandle`]。

pub mod locality;
pub mod registry;
pub mod router;

pub use locality::{AliasTable, Locality, LocalityResolver, SelectionKind, ServiceMatch};
pub use registry::{ServiceEntry, ServiceRegistry};
pub use router::{ProxyRouter, ProxyRouterBuilder, RouterHandle};

/// 不会以 `Err` 外泄的路由结果分类，作为日志字段 `outcome` 输出。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoutingOutcome {
    /// 没有服务命中，请求按原样转发。
    NoMatch,
    /// 远端别名命中但跨越网络功能边界，请求转发到远端站点。
    RemoteMatchRejected,
    /// 深度超限，合成 482。
    LoopDetected,
    /// Max-Forwards 耗尽，合成 483。
    TooManyHops,
    /// 出站分支失败，合成 408/503。
    BranchFailure,
    /// 定时器在取消后仍然触发，忽略。
    TimerRace,
}

impl RoutingOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingOutcome::NoMatch => "no_match",
            RoutingOutcome::RemoteMatchRejected => "remote_match_rejected",
            RoutingOutcome::LoopDetected => "loop_detected",
            RoutingOutcome::TooManyHops => "too_many_hops",
            RoutingOutcome::BranchFailure => "branch_failure",
            RoutingOutcome::TimerRace => "timer_race",
        }
    }
}
