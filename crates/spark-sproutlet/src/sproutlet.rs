//! # Sproutlet 插件契约
//!
//! ## 核心意图（Why）
//! - Sproutlet 是可独立开发的路由/处理单元：引擎按服务名、域名前缀、用户名或端口选中它，
//!   再由它决定是否为当前事务创建一个 [`SproutletTsx`] 实例；
//! - 实例只通过 [`TsxContext`] 与引擎交互：发起分支、回送响应、取消分支、挂定时器。
//!   它看不到控制器或其它 Adapter，因此无法破坏事务树的关联关系。
//!
//! ## 默认行为（What）
//! - [`SproutletTsx`] 的四个回调都有默认实现：请求原样转发、响应原样回送、
//!   取消与定时器无操作。只覆盖关心的回调即可得到一个合规的代理。

use crate::{
    core::{adapter::TsxContext, fork::ForkId},
    message::SipMessage,
    uri::SipUri,
};

/// 注册到路由器的服务。
///
/// # 教案式说明
/// - **意图 (Why)**：描述服务的静态元数据，并充当事务实例的工厂；
/// - **契约 (What)**：
///   - 注册后不可变，生命周期与进程一致，需满足 `Send + Sync + 'static`；
///   - `network_function` 缺省时以服务名作为网络功能标签；
///   - `get_tsx` 可以拒绝处理（[`TsxDecision::Decline`]），并可指定下一跳；
/// - **风险 (Trade-offs)**：`get_tsx` 在事务锁内同步执行，不应阻塞。
pub trait Sproutlet: Send + Sync + 'static {
    fn service_name(&self) -> &str;

    /// 额外别名，与服务名一样可用于选择。
    fn aliases(&self) -> &[String] {
        &[]
    }

    fn port(&self) -> Option<u16> {
        None
    }

    fn network_function(&self) -> Option<&str> {
        None
    }

    /// 为 `request` 创建事务实例；`alias` 是选中本服务时实际使用的名字。
    fn get_tsx(&self, request: &SipMessage, alias: &str) -> TsxDecision;
}

/// `get_tsx` 的结果。
pub enum TsxDecision {
    Accept(Box<dyn SproutletTsx>),
    /// 拒绝处理；`next_hop` 为 `Some` 时作为新的 top Route 重新选择服务。
    Decline { next_hop: Option<SipUri> },
}

impl TsxDecision {
    pub fn accept(tsx: impl SproutletTsx + 'static) -> Self {
        TsxDecision::Accept(Box::new(tsx))
    }

    pub fn decline() -> Self {
        TsxDecision::Decline { next_hop: None }
    }

    pub fn decline_to(next_hop: SipUri) -> Self {
        TsxDecision::Decline {
            next_hop: Some(next_hop),
        }
    }
}

impl std::fmt::Debug for TsxDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TsxDecision::Accept(_) => f.write_str("Accept(..)"),
            TsxDecision::Decline { next_hop } => f
                .debug_struct("Decline")
                .field("next_hop", next_hop)
                .finish(),
        }
    }
}

/// 单个事务中的 Sproutlet 实例。
///
/// # 教案式说明
/// - **意图 (Why)**：四个回调覆盖事务的全部输入；所有输出都经由 `ctx` 排队，
///   在回调返回后由 Adapter 统一处理；
/// - **契约 (What)**：
///   - 回调期间通过 `ctx.send_request` 得到的 [`ForkId`] 在本实例内唯一且从 0 递增；
///   - 回调返回前发出的响应与请求按“先请求、后响应、再取消”的顺序生效；
/// - **风险 (Trade-offs)**：实例随 Adapter 一起销毁，销毁时机由引擎决定，不要在 `Drop`
///   中假设任何事务状态。
pub trait SproutletTsx: Send {
    fn on_rx_request(&mut self, ctx: &mut TsxContext<'_>, request: SipMessage) {
        ctx.send_request(request);
    }

    fn on_rx_response(&mut self, ctx: &mut TsxContext<'_>, response: SipMessage, fork: ForkId) {
        let _ = fork;
        ctx.send_response(response);
    }

    /// 上游取消了事务。回调返回后引擎会取消所有未完成分支。
    fn on_rx_cancel(&mut self, ctx: &mut TsxContext<'_>, status: u16, reason: &str) {
        let _ = (ctx, status, reason);
    }

    fn on_timer_expiry(&mut self, ctx: &mut TsxContext<'_>, context: u64) {
        let _ = (ctx, context);
    }
}

/// 没有服务命中时使用的透明转发实例。
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughTsx;

impl SproutletTsx for PassThroughTsx {}
