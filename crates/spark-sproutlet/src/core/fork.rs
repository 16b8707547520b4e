//! # 分支（fork）状态
//!
//! ## 状态机约束（What）
//! - 合法跃迁只向前：`None → Issued → Provisional → Terminated`，允许跳级（例如排队中的
//!   分支被取消时直接 `None → Terminated`），永不回退；
//! - 取消请求、放弃标记与错误状态是附加在状态之上的独立标志，由 Adapter 在
//!   `process_actions` 中统一结算。

use std::fmt;

use crate::message::SipMessage;

/// Adapter 内分支编号，从 0 开始按 `send_request` 调用顺序分配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForkId(usize);

impl ForkId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fork-{}", self.0)
    }
}

/// 分支生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BranchState {
    /// 已分配编号，请求仍在 Adapter 队列中。
    None,
    /// 请求已交给控制器，尚未收到任何响应。
    Issued,
    /// 收到过临时响应。
    Provisional,
    /// 收到最终响应，或从未发出即被结束。
    Terminated,
}

impl BranchState {
    /// 判断状态是否允许跃迁至 `target`（单调不减）。
    pub fn can_transition_to(self, target: BranchState) -> bool {
        target >= self
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BranchState::Terminated)
    }
}

/// 分支失败的原因。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ForkErrorState {
    #[default]
    None,
    Timeout,
    TransportError,
    NoAddresses,
}

impl ForkErrorState {
    /// 为失败合成的响应状态码：超时 408，其余 503。
    pub fn status_code(self) -> u16 {
        match self {
            ForkErrorState::Timeout => 408,
            ForkErrorState::None
            | ForkErrorState::TransportError
            | ForkErrorState::NoAddresses => 503,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ForkErrorState::None => "none",
            ForkErrorState::Timeout => "timeout",
            ForkErrorState::TransportError => "transport_error",
            ForkErrorState::NoAddresses => "no_addresses",
        }
    }
}

/// 对 Sproutlet 可见的分支状态快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForkState {
    pub state: BranchState,
    pub error_state: ForkErrorState,
}

/// 等待结算的取消请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PendingCancel {
    pub(crate) status: u16,
    pub(crate) reason: String,
}

/// Adapter 内部的分支记录。
#[derive(Debug)]
pub(crate) struct ForkStatus {
    pub(crate) state: BranchState,
    /// 已发出的请求，用于构造 CANCEL 与合成失败响应。
    pub(crate) request: Option<SipMessage>,
    pub(crate) is_invite: bool,
    pub(crate) pending_cancel: Option<PendingCancel>,
    pub(crate) cancel_sent: bool,
    pub(crate) pending_response: bool,
    pub(crate) abandoned: bool,
    /// 下游是同一事务内的另一个 Adapter，取消无需等待临时响应。
    pub(crate) internal: bool,
    pub(crate) error_state: ForkErrorState,
}

impl ForkStatus {
    pub(crate) fn new(is_invite: bool) -> Self {
        Self {
            state: BranchState::None,
            request: None,
            is_invite,
            pending_cancel: None,
            cancel_sent: false,
            pending_response: false,
            abandoned: false,
            internal: false,
            error_state: ForkErrorState::None,
        }
    }

    /// 推进状态；回退请求被忽略并返回 `false`。
    pub(crate) fn advance(&mut self, target: BranchState) -> bool {
        if !self.state.can_transition_to(target) {
            return false;
        }
        self.state = target;
        if target.is_terminal() {
            self.pending_response = false;
            self.pending_cancel = None;
            self.request = None;
        }
        true
    }

    /// 是否仍在等待会影响完成判定的响应。
    pub(crate) fn awaiting_response(&self) -> bool {
        self.pending_response && !self.abandoned
    }

    /// 挂起的取消此刻能否发出。
    pub(crate) fn cancel_ready(&self) -> bool {
        match self.state {
            BranchState::Provisional => true,
            BranchState::Issued => self.internal,
            BranchState::None | BranchState::Terminated => false,
        }
    }

    pub(crate) fn snapshot(&self) -> ForkState {
        ForkState {
            state: self.state,
            error_state: self.error_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_states_never_regress() {
        let mut fork = ForkStatus::new(true);
        assert!(fork.advance(BranchState::Issued));
        assert!(fork.advance(BranchState::Provisional));
        assert!(!fork.advance(BranchState::Issued));
        assert_eq!(fork.state, BranchState::Provisional);
        assert!(fork.advance(BranchState::Terminated));
        assert!(!fork.advance(BranchState::None));
        assert!(fork.state.is_terminal());
    }

    #[test]
    fn terminating_clears_outstanding_flags() {
        let mut fork = ForkStatus::new(true);
        fork.advance(BranchState::Issued);
        fork.pending_response = true;
        fork.pending_cancel = Some(PendingCancel {
            status: 0,
            reason: String::new(),
        });
        assert!(fork.awaiting_response());

        fork.advance(BranchState::Terminated);
        assert!(!fork.awaiting_response());
        assert!(fork.pending_cancel.is_none());
    }

    #[test]
    fn abandoned_forks_do_not_block_completion() {
        let mut fork = ForkStatus::new(false);
        fork.advance(BranchState::Issued);
        fork.pending_response = true;
        fork.abandoned = true;
        assert!(!fork.awaiting_response());
    }

    #[test]
    fn internal_forks_are_cancellable_before_provisional() {
        let mut outbound = ForkStatus::new(true);
        outbound.advance(BranchState::Issued);
        assert!(!outbound.cancel_ready());
        outbound.advance(BranchState::Provisional);
        assert!(outbound.cancel_ready());

        let mut internal = ForkStatus::new(true);
        internal.internal = true;
        assert!(!internal.cancel_ready(), "request still queued");
        internal.advance(BranchState::Issued);
        assert!(internal.cancel_ready());
        internal.advance(BranchState::Terminated);
        assert!(!internal.cancel_ready());
    }

    #[test]
    fn error_states_map_to_status_codes() {
        assert_eq!(ForkErrorState::Timeout.status_code(), 408);
        assert_eq!(ForkErrorState::TransportError.status_code(), 503);
        assert_eq!(ForkErrorState::NoAddresses.status_code(), 503);
    }
}
