//! # 出站传输契约
//!
//! ## 角色定位（Why）
//! - 事务控制器只决定“发往哪里”，实际的报文编码、连接选择与客户端事务由宿主侧的
//!   SIP 栈负责；本模块定义两者之间的最小接口；
//! - 每条真实出站分支都携带 [`BranchId`]，宿主在收到下游响应或检测到失败时，以
//!   `(TransactionId, BranchId)` 回送给 [`TransactionTable`](crate::core::TransactionTable)。
//!
//! ## 行为契约（What）
//! - `send_request` 的同步失败以 `Err(SendFailure)` 返回，控制器会将其折叠为分支失败
//!   并合成 503；异步失败由宿主调用 `on_branch_failure` 上报；
//! - ACK 请求不建立关联，也不会收到响应。

use std::fmt;

use thiserror::Error;

use crate::{core::fork::ForkErrorState, message::SipMessage};

/// 入站事务标识，由 [`TransactionTable`](crate::core::TransactionTable) 分配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// 事务内单条真实出站分支的标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(u64);

impl BranchId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch-{}", self.0)
    }
}

/// 允许选择的下一跳主机状态，对应宿主解析器的黑白名单。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllowedHostState {
    /// 仅选择未被列入黑名单的主机。
    Whitelisted,
    /// 仅选择黑名单中的主机（用于探测恢复）。
    Blacklisted,
    #[default]
    All,
}

/// 一次真实出站发送的完整描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRequest {
    pub transaction: TransactionId,
    pub branch: BranchId,
    pub request: SipMessage,
    pub allowed_host_state: AllowedHostState,
    /// 下一跳命中了配置的无状态代理列表。
    pub stateless_next_hop: bool,
}

/// 同步发送失败的原因。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SendFailure {
    #[error("no reachable address for the next hop")]
    NoAddresses,
    #[error("transport error: {detail}")]
    Transport { detail: String },
}

impl From<&SendFailure> for ForkErrorState {
    fn from(failure: &SendFailure) -> Self {
        match failure {
            SendFailure::NoAddresses => ForkErrorState::NoAddresses,
            SendFailure::Transport { .. } => ForkErrorState::TransportError,
        }
    }
}

/// 宿主侧 SIP 栈实现的出站接口。
///
/// # 教案式说明
/// - **意图 (Why)**：把引擎与具体传输/事务层解耦，测试中可用录制型替身替换；
/// - **契约 (What)**：
///   - 方法在持有事务锁时被调用，实现不得回调同一事务的入口，否则会死锁；
///     异步结果应投递到工作线程后再调用 `TransactionTable`；
///   - `send_response` 发送的是事务的上游响应，含 `100 Trying`；
/// - **风险 (Trade-offs)**：接口为同步调用，耗时操作应在实现内部排队。
pub trait OutboundTransport: Send + Sync {
    fn send_request(&self, request: OutboundRequest) -> Result<(), SendFailure>;

    fn send_cancel(&self, transaction: TransactionId, branch: BranchId, cancel: SipMessage);

    fn send_response(&self, transaction: TransactionId, response: SipMessage);
}
