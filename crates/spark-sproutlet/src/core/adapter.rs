//! # SproutletAdapter：事务树中的一个节点
//!
//! ## 核心意图（Why）
//! - 每个 Sproutlet 实例在事务树中的一次出场都由一个 Adapter 承载：它把实例的回调接口
//!   适配为分支、响应、取消与定时器操作，并负责响应聚合与分支生命周期；
//! - 实例通过 [`TsxContext`] 发出的所有动作先在 Adapter 内排队，回调返回后由
//!   `process_actions` 统一结算，再以 [`AdapterAction`] 交给控制器路由。
//!
//! ## 架构定位（Where）
//! - Adapter 存放在 [`TransactionController`](super::TransactionController) 的 arena 中，
//!   以 [`AdapterId`] 互相引用；它不持有控制器，也看不到其它 Adapter；
//! - 控制器在每次投递前后维护 `entered` 计数，计数非零或仍有定时器时 Adapter 不会被销毁。
//!
//! ## 结算顺序（How）
//! 1. 排队的请求：每个分支只发送一次；最终响应已发出后的新分支被拒绝并直接结束；
//! 2. 排队的响应：经 `aggregate_response` 聚合后决定是否上送；
//! 3. 待取消分支：出站分支收到临时响应后才发出 CANCEL，仍处于 `Issued` 的延后；
//!    指向同一事务内 Adapter 的分支立即取消，由下游 Adapter 在自己的出站分支上等待。

use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    core::{
        aggregation::{forwards_immediately, is_better},
        fork::{BranchState, ForkErrorState, ForkId, ForkState, ForkStatus, PendingCancel},
        timer::{TimerId, TimerKey, TimerService, TimerTable},
    },
    message::{Method, SipMessage, reason_phrase},
    routing::{Locality, ProxyRouter, RoutingOutcome},
    sproutlet::SproutletTsx,
    transport::{AllowedHostState, TransactionId},
    uri::SipUri,
};

/// 外部入口使用的上游网络功能标签。
pub const EXTERNAL_NETWORK_FUNCTION: &str = "EXTERNAL";

/// 透明转发 Adapter 的网络功能标签。
pub const PASS_THROUGH_NETWORK_FUNCTION: &str = "pass-through";

/// 成功响应后取消其余分支时使用的原因短语。
pub const CALL_COMPLETED_ELSEWHERE: &str = "Call completed elsewhere";

/// 控制器 arena 中的 Adapter 下标。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(usize);

impl AdapterId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adapter-{}", self.0)
    }
}

/// 投递期间从控制器借出的共享资源。
pub(crate) struct AdapterEnv<'e> {
    pub(crate) transaction: TransactionId,
    pub(crate) router: &'e ProxyRouter,
    pub(crate) timers: &'e mut TimerTable,
    pub(crate) timer_service: &'e dyn TimerService,
}

/// Adapter 结算后交给控制器的动作。
#[derive(Debug)]
pub(crate) enum AdapterAction {
    Request {
        fork: ForkId,
        request: SipMessage,
        allowed_host_state: AllowedHostState,
    },
    Response(SipMessage),
    Cancel {
        fork: ForkId,
        cancel: SipMessage,
        status: u16,
        reason: String,
    },
}

/// 创建 Adapter 所需的树位置信息。
#[derive(Clone, Debug)]
pub(crate) struct AdapterSpec {
    pub(crate) service_name: String,
    pub(crate) alias: String,
    pub(crate) depth: u32,
    pub(crate) network_function: String,
    pub(crate) upstream_network_function: String,
    pub(crate) allowed_host_state: AllowedHostState,
}

#[derive(Debug)]
struct QueuedRequest {
    fork: ForkId,
    request: SipMessage,
    allowed_host_state: AllowedHostState,
}

/// Adapter 中除 Sproutlet 实例以外的全部状态。
///
/// 与实例分开存放，使回调期间可以同时借出 `&mut dyn SproutletTsx` 与 `&mut AdapterCore`。
#[derive(Debug)]
pub(crate) struct AdapterCore {
    id: AdapterId,
    spec: AdapterSpec,
    request: SipMessage,
    expects_response: bool,
    forks: Vec<ForkStatus>,
    queued_requests: Vec<QueuedRequest>,
    queued_responses: VecDeque<SipMessage>,
    best_response: Option<SipMessage>,
    final_sent: bool,
    pending_timers: BTreeSet<TimerId>,
    entered: usize,
}

impl AdapterCore {
    fn mark_cancel(&mut self, fork: ForkId, status: u16, reason: &str) {
        let Some(fs) = self.forks.get_mut(fork.index()) else {
            return;
        };
        match fs.state {
            BranchState::None => {
                self.queued_requests.retain(|queued| queued.fork != fork);
                fs.advance(BranchState::Terminated);
            }
            BranchState::Issued | BranchState::Provisional => {
                if !fs.is_invite {
                    fs.abandoned = true;
                } else if !fs.cancel_sent && fs.pending_cancel.is_none() {
                    fs.pending_cancel = Some(PendingCancel {
                        status,
                        reason: reason.to_owned(),
                    });
                }
            }
            BranchState::Terminated => {}
        }
    }

    fn cancel_pending_forks(&mut self, status: u16, reason: &str) {
        for index in 0..self.forks.len() {
            if !self.forks[index].state.is_terminal() {
                self.mark_cancel(ForkId::new(index), status, reason);
            }
        }
    }

    fn awaiting_responses(&self) -> usize {
        self.forks
            .iter()
            .filter(|fs| fs.awaiting_response())
            .count()
    }

    /// 仍可能产生响应的分支（未结束且未放弃）。
    fn has_actionable_forks(&self) -> bool {
        self.forks
            .iter()
            .any(|fs| !fs.state.is_terminal() && !fs.abandoned)
    }

    fn is_invite(&self) -> bool {
        self.request.is_method(&Method::Invite)
    }

    /// 无响应、无分支、无定时器却仍欠上游一个最终响应。
    fn is_stalled(&self) -> bool {
        self.expects_response
            && !self.final_sent
            && self.best_response.is_none()
            && self.queued_requests.is_empty()
            && self.queued_responses.is_empty()
            && !self.has_actionable_forks()
            && self.pending_timers.is_empty()
    }
}

/// Sproutlet 实例可用的能力集合。
///
/// # 教案式说明
/// - **意图 (Why)**：实例只能通过本结构影响事务：发起分支、回送响应、取消、挂定时器，
///   以及查询自身在树中的位置；
/// - **契约 (What)**：
///   - 所有发送动作仅入队，回调返回后才生效；
///   - `send_request` 返回的 [`ForkId`] 用于之后的 `cancel_fork` / `fork_state`，
///     以及 `on_rx_response` 中识别响应来源；
///   - 定时器编号在事务内唯一，触发时通过 `on_timer_expiry` 携带的 `context` 区分用途。
pub struct TsxContext<'a> {
    core: &'a mut AdapterCore,
    transaction: TransactionId,
    router: &'a ProxyRouter,
    timers: &'a mut TimerTable,
    timer_service: &'a dyn TimerService,
}

impl<'a> TsxContext<'a> {
    fn new(core: &'a mut AdapterCore, env: &'a mut AdapterEnv<'_>) -> Self {
        Self {
            core,
            transaction: env.transaction,
            router: env.router,
            timers: &mut *env.timers,
            timer_service: env.timer_service,
        }
    }

    /// Adapter 收到的请求（已完成 Route 弹出与 Max-Forwards 处理）。
    pub fn original_request(&self) -> &SipMessage {
        &self.core.request
    }

    pub fn clone_request(&self) -> SipMessage {
        self.core.request.clone()
    }

    /// 构造与原请求同 Call-ID / CSeq 的新请求。
    pub fn create_request(&self, method: Method, uri: SipUri) -> SipMessage {
        SipMessage::request(method, uri)
            .with_call_id(self.core.request.call_id())
            .with_cseq(self.core.request.cseq())
    }

    pub fn create_response(
        &self,
        request: &SipMessage,
        status: u16,
        reason: Option<&str>,
    ) -> SipMessage {
        SipMessage::response_to(request, status, reason)
    }

    /// 以 Adapter 默认的主机状态约束发起分支。
    pub fn send_request(&mut self, request: SipMessage) -> ForkId {
        let allowed_host_state = self.core.spec.allowed_host_state;
        self.send_request_with(request, allowed_host_state)
    }

    pub fn send_request_with(
        &mut self,
        request: SipMessage,
        allowed_host_state: AllowedHostState,
    ) -> ForkId {
        let fork = ForkId::new(self.core.forks.len());
        self.core
            .forks
            .push(ForkStatus::new(request.is_method(&Method::Invite)));
        debug!(
            transaction = %self.transaction,
            adapter = %self.core.id,
            %fork,
            request = %request.summary(),
            "sproutlet queued request"
        );
        self.core.queued_requests.push(QueuedRequest {
            fork,
            request,
            allowed_host_state,
        });
        fork
    }

    pub fn send_response(&mut self, response: SipMessage) {
        if response.is_request() {
            warn!(
                transaction = %self.transaction,
                adapter = %self.core.id,
                "sproutlet passed a request to send_response, dropping it"
            );
            return;
        }
        self.core.queued_responses.push_back(response);
    }

    pub fn cancel_fork(&mut self, fork: ForkId, status: u16, reason: &str) {
        self.core.mark_cancel(fork, status, reason);
    }

    pub fn cancel_pending_forks(&mut self, status: u16, reason: &str) {
        self.core.cancel_pending_forks(status, reason);
    }

    /// 不再等待所有未完成分支的响应，它们的响应将不再投递给实例。
    pub fn mark_pending_forks_as_abandoned(&mut self) {
        for fs in &mut self.core.forks {
            if fs.pending_response {
                fs.abandoned = true;
            }
        }
    }

    pub fn fork_state(&self, fork: ForkId) -> Option<ForkState> {
        self.core.forks.get(fork.index()).map(ForkStatus::snapshot)
    }

    /// 挂起定时器；宿主定时器服务拒绝时返回 `None`。
    pub fn schedule_timer(&mut self, context: u64, after: Duration) -> Option<TimerId> {
        let timer = self.timers.allocate(self.core.id, context);
        let key = TimerKey {
            transaction: self.transaction,
            timer,
        };
        if !self.timer_service.schedule(key, after) {
            warn!(
                transaction = %self.transaction,
                adapter = %self.core.id,
                %timer,
                "timer service refused to schedule timer"
            );
            return None;
        }
        self.timers.arm(timer);
        self.core.pending_timers.insert(timer);
        Some(timer)
    }

    pub fn cancel_timer(&mut self, timer: TimerId) {
        if self.core.pending_timers.remove(&timer) {
            self.timers.cancel(timer);
            self.timer_service.cancel(TimerKey {
                transaction: self.transaction,
                timer,
            });
        }
    }

    pub fn timer_running(&self, timer: TimerId) -> bool {
        self.core.pending_timers.contains(&timer) && self.timers.is_running(timer)
    }

    pub fn uri_locality(&self, uri: &SipUri) -> Locality {
        self.router.uri_locality(uri)
    }

    pub fn is_uri_reflexive(&self, uri: &SipUri) -> bool {
        self.router.is_uri_reflexive(uri)
    }

    /// 外部重新进入本服务的路由 URI。
    pub fn routing_uri(&self) -> SipUri {
        self.router.build_routing_uri(&self.core.spec.service_name)
    }

    pub fn next_hop_uri(&self, service: &str, base: &SipUri) -> SipUri {
        self.router.next_hop_uri(service, base)
    }

    pub fn depth(&self) -> u32 {
        self.core.spec.depth
    }

    pub fn network_function(&self) -> &str {
        &self.core.spec.network_function
    }

    pub fn upstream_network_function(&self) -> &str {
        &self.core.spec.upstream_network_function
    }

    /// 请求进入本 Adapter 时是否跨越了网络功能边界。
    pub fn is_network_func_boundary(&self) -> bool {
        self.core.spec.network_function != self.core.spec.upstream_network_function
    }

    /// 跨越的是部署内部两个网络功能之间的边界。
    pub fn is_internal_network_func_boundary(&self) -> bool {
        self.is_network_func_boundary()
            && self.core.spec.upstream_network_function != EXTERNAL_NETWORK_FUNCTION
    }

    pub fn service_name(&self) -> &str {
        &self.core.spec.service_name
    }

    pub fn alias(&self) -> &str {
        &self.core.spec.alias
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction
    }
}

/// 事务树节点。
pub(crate) struct SproutletAdapter {
    tsx: Box<dyn SproutletTsx>,
    core: AdapterCore,
}

impl fmt::Debug for SproutletAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SproutletAdapter")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl SproutletAdapter {
    pub(crate) fn new(
        id: AdapterId,
        spec: AdapterSpec,
        tsx: Box<dyn SproutletTsx>,
        request: &SipMessage,
    ) -> Self {
        Self {
            tsx,
            core: AdapterCore {
                id,
                spec,
                request: request.clone(),
                expects_response: !request.is_ack(),
                forks: Vec::new(),
                queued_requests: Vec::new(),
                queued_responses: VecDeque::new(),
                best_response: None,
                final_sent: false,
                pending_timers: BTreeSet::new(),
                entered: 0,
            },
        }
    }

    pub(crate) fn spec(&self) -> &AdapterSpec {
        &self.core.spec
    }

    pub(crate) fn enter(&mut self) {
        self.core.entered += 1;
    }

    pub(crate) fn leave(&mut self) {
        self.core.entered = self.core.entered.saturating_sub(1);
    }

    pub(crate) fn entered(&self) -> usize {
        self.core.entered
    }

    pub(crate) fn has_pending_timers(&self) -> bool {
        !self.core.pending_timers.is_empty()
    }

    /// 义务已完成且没有任何未决事项。
    pub(crate) fn is_complete(&self) -> bool {
        (self.core.final_sent || !self.core.expects_response)
            && self.core.queued_requests.is_empty()
            && self.core.queued_responses.is_empty()
            && self.core.awaiting_responses() == 0
            && self.core.pending_timers.is_empty()
    }

    /// 控制器把分支交给同一事务内的 Adapter 时调用；返回此前因等待临时响应而延后的取消。
    pub(crate) fn link_internal(&mut self, fork: ForkId) -> Option<AdapterAction> {
        let fs = self.core.forks.get_mut(fork.index())?;
        fs.internal = true;
        take_cancel(fs, fork)
    }

    pub(crate) fn rx_request(
        &mut self,
        env: &mut AdapterEnv<'_>,
        request: SipMessage,
    ) -> Vec<AdapterAction> {
        debug!(
            transaction = %env.transaction,
            adapter = %self.core.id,
            service = %self.core.spec.service_name,
            depth = self.core.spec.depth,
            request = %request.summary(),
            "delivering request to sproutlet"
        );
        let mut ctx = TsxContext::new(&mut self.core, env);
        self.tsx.on_rx_request(&mut ctx, request);
        self.process_actions(env.transaction)
    }

    pub(crate) fn rx_response(
        &mut self,
        env: &mut AdapterEnv<'_>,
        fork: ForkId,
        response: SipMessage,
    ) -> Vec<AdapterAction> {
        let Some(status) = response.status_code() else {
            return Vec::new();
        };
        let Some(fs) = self.core.forks.get_mut(fork.index()) else {
            warn!(
                transaction = %env.transaction,
                adapter = %self.core.id,
                %fork,
                "response for unknown fork, dropping"
            );
            return Vec::new();
        };
        let additional_success = fs.is_invite && (200..300).contains(&status);
        if fs.state.is_terminal() && !additional_success {
            debug!(
                transaction = %env.transaction,
                adapter = %self.core.id,
                %fork,
                status,
                "response on terminated fork, dropping"
            );
            return Vec::new();
        }

        let target = if status < 200 {
            BranchState::Provisional
        } else {
            BranchState::Terminated
        };
        fs.advance(target);
        let deliver = !fs.abandoned && status != 100;

        if deliver {
            let mut ctx = TsxContext::new(&mut self.core, env);
            self.tsx.on_rx_response(&mut ctx, response, fork);
        } else {
            debug!(
                transaction = %env.transaction,
                adapter = %self.core.id,
                %fork,
                status,
                "response not delivered to sproutlet"
            );
        }
        self.process_actions(env.transaction)
    }

    /// 分支失败：记录错误状态并合成 408/503 走正常响应路径。
    pub(crate) fn rx_fork_error(
        &mut self,
        env: &mut AdapterEnv<'_>,
        fork: ForkId,
        error: ForkErrorState,
    ) -> Vec<AdapterAction> {
        let original = &self.core.request;
        let Some(fs) = self.core.forks.get_mut(fork.index()) else {
            return Vec::new();
        };
        if fs.state.is_terminal() {
            return Vec::new();
        }
        fs.error_state = error;
        let status = error.status_code();
        let response = SipMessage::response_to(fs.request.as_ref().unwrap_or(original), status, None);
        info!(
            transaction = %env.transaction,
            adapter = %self.core.id,
            %fork,
            error = error.as_str(),
            status,
            outcome = RoutingOutcome::BranchFailure.as_str(),
            "fork failed, synthesizing response"
        );
        self.rx_response(env, fork, response)
    }

    pub(crate) fn rx_cancel(
        &mut self,
        env: &mut AdapterEnv<'_>,
        status: u16,
        reason: &str,
    ) -> Vec<AdapterAction> {
        if self.core.final_sent || !self.core.is_invite() {
            debug!(
                transaction = %env.transaction,
                adapter = %self.core.id,
                "cancel ignored, nothing left to cancel"
            );
            return Vec::new();
        }

        let mut ctx = TsxContext::new(&mut self.core, env);
        self.tsx.on_rx_cancel(&mut ctx, status, reason);
        self.core.cancel_pending_forks(status, reason);

        let final_queued = self
            .core
            .queued_responses
            .iter()
            .any(SipMessage::is_final_response);
        if !final_queued && self.core.best_response.is_none() && self.core.awaiting_responses() == 0
        {
            let terminated = SipMessage::response_to(&self.core.request, 487, None);
            self.core.queued_responses.push_back(terminated);
        }
        self.process_actions(env.transaction)
    }

    pub(crate) fn on_timer_pop(
        &mut self,
        env: &mut AdapterEnv<'_>,
        timer: TimerId,
        context: u64,
    ) -> Vec<AdapterAction> {
        if !self.core.pending_timers.remove(&timer) {
            debug!(
                transaction = %env.transaction,
                adapter = %self.core.id,
                %timer,
                outcome = RoutingOutcome::TimerRace.as_str(),
                "timer no longer pending, ignoring pop"
            );
            return Vec::new();
        }
        let mut ctx = TsxContext::new(&mut self.core, env);
        self.tsx.on_timer_expiry(&mut ctx, context);
        self.process_actions(env.transaction)
    }

    fn process_actions(&mut self, transaction: TransactionId) -> Vec<AdapterAction> {
        let mut actions = Vec::new();

        let queued = std::mem::take(&mut self.core.queued_requests);
        for QueuedRequest {
            fork,
            request,
            allowed_host_state,
        } in queued
        {
            let final_sent = self.core.final_sent;
            let Some(fs) = self.core.forks.get_mut(fork.index()) else {
                continue;
            };
            if fs.state != BranchState::None {
                continue;
            }
            if final_sent && !request.is_ack() {
                warn!(
                    %transaction,
                    adapter = %self.core.id,
                    %fork,
                    "final response already sent, refusing to fork"
                );
                fs.advance(BranchState::Terminated);
                continue;
            }
            if request.is_ack() {
                fs.advance(BranchState::Terminated);
            } else {
                fs.advance(BranchState::Issued);
                fs.pending_response = true;
                fs.request = Some(request.clone());
            }
            actions.push(AdapterAction::Request {
                fork,
                request,
                allowed_host_state,
            });
        }

        while let Some(response) = self.core.queued_responses.pop_front() {
            self.aggregate_response(transaction, response, &mut actions);
        }

        for (index, fs) in self.core.forks.iter_mut().enumerate() {
            match fs.state {
                BranchState::None | BranchState::Terminated => fs.pending_cancel = None,
                _ => actions.extend(take_cancel(fs, ForkId::new(index))),
            }
        }

        if self.core.is_stalled() {
            warn!(
                %transaction,
                adapter = %self.core.id,
                service = %self.core.spec.service_name,
                "sproutlet left the transaction without a final response"
            );
            let response = SipMessage::response_to(&self.core.request, 500, None);
            self.aggregate_response(transaction, response, &mut actions);
        }

        actions
    }

    fn aggregate_response(
        &mut self,
        transaction: TransactionId,
        response: SipMessage,
        actions: &mut Vec<AdapterAction>,
    ) {
        let Some(status) = response.status_code() else {
            return;
        };
        if status == 100 {
            return;
        }
        if !self.core.expects_response {
            debug!(%transaction, adapter = %self.core.id, status, "dropping response to ACK");
            return;
        }
        if self.core.final_sent {
            if (200..300).contains(&status) && self.core.is_invite() {
                debug!(%transaction, adapter = %self.core.id, status, "forwarding additional 2xx");
                actions.push(AdapterAction::Response(response));
            } else {
                debug!(
                    %transaction,
                    adapter = %self.core.id,
                    status,
                    "final response already sent, dropping"
                );
            }
            return;
        }
        if status < 200 {
            actions.push(AdapterAction::Response(response));
            return;
        }

        let replace = self
            .core
            .best_response
            .as_ref()
            .and_then(SipMessage::status_code)
            .is_none_or(|best| is_better(status, best));
        if replace {
            self.core.best_response = Some(response);
        }

        let Some(best_status) = self
            .core
            .best_response
            .as_ref()
            .and_then(SipMessage::status_code)
        else {
            return;
        };
        if !forwards_immediately(best_status) && self.core.has_actionable_forks() {
            debug!(
                %transaction,
                adapter = %self.core.id,
                best = best_status,
                "holding best response until remaining forks complete"
            );
            return;
        }

        if let Some(best) = self.core.best_response.take() {
            debug!(
                %transaction,
                adapter = %self.core.id,
                status = best_status,
                "forwarding final response upstream"
            );
            self.core.final_sent = true;
            actions.push(AdapterAction::Response(best));
        }

        if (200..300).contains(&best_status) {
            self.core
                .cancel_pending_forks(200, CALL_COMPLETED_ELSEWHERE);
        } else {
            self.core
                .cancel_pending_forks(best_status, reason_phrase(best_status));
        }
    }
}

/// 分支可以取消时取出挂起的取消，构造 CANCEL 动作。
fn take_cancel(fs: &mut ForkStatus, fork: ForkId) -> Option<AdapterAction> {
    if !fs.cancel_ready() {
        return None;
    }
    let pending = fs.pending_cancel.take()?;
    let cancel = SipMessage::cancel_for(fs.request.as_ref()?, pending.status, &pending.reason);
    fs.cancel_sent = true;
    Some(AdapterAction::Cancel {
        fork,
        cancel,
        status: pending.status,
        reason: pending.reason,
    })
}
