//! # TransactionController：单个入站事务的路由状态机
//!
//! ## 核心意图（Why）
//! - 一个入站事务会在部署内部穿过多个 Sproutlet，每个 Sproutlet 又可能分叉出多条分支；
//!   控制器拥有这棵事务树的全部状态：Adapter arena、双向分支关联表、待调度请求队列与
//!   定时器表；
//! - Adapter 之间的递归交互（子 Adapter 的响应回到父 Adapter，父 Adapter 又发出新分支……）
//!   被展开为显式事件队列，由 `drive` 循环逐个投递，避免深递归与重入借用。
//!
//! ## 状态机约束（What）
//! - `Initialized → Scheduling → Terminated → Destroyed`：
//!   - `init` 创建根 Adapter 后进入 `Scheduling`；
//!   - 根 Adapter 完成义务并被销毁后进入 `Terminated`；
//!   - 所有 Adapter 销毁、队列清空、入口计数归零且无定时器时进入 `Destroyed`，
//!     此时释放定时器记录；
//! - 关联表双向一致：`downstream[(adapter, fork)] = d` 当且仅当 `upstream[d] = (adapter, fork)`；
//! - 深度每跳加一，超过上限的请求合成 482 且不会进入任何 Sproutlet。
//!
//! ## 失败处理（How）
//! - Max-Forwards 耗尽、深度超限、分支失败、定时器竞态均转换为合法响应或被静默丢弃，
//!   错误不会以 `Err` 形式离开控制器；
//! - 定时器触发总是经过控制器校验后才投递给所属 Adapter。

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    core::{
        adapter::{
            AdapterAction, AdapterEnv, AdapterId, AdapterSpec, EXTERNAL_NETWORK_FUNCTION,
            PASS_THROUGH_NETWORK_FUNCTION, SproutletAdapter,
        },
        fork::{ForkErrorState, ForkId},
        timer::{TimerId, TimerService, TimerTable},
    },
    message::{Method, SipMessage},
    routing::{Locality, ProxyRouter, RoutingOutcome, ServiceEntry, ServiceMatch},
    sproutlet::{PassThroughTsx, SproutletTsx, TsxDecision},
    transport::{AllowedHostState, BranchId, OutboundRequest, OutboundTransport, TransactionId},
};

/// 控制器生命周期。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Initialized,
    Scheduling,
    Terminated,
    Destroyed,
}

/// 分支的下游：另一个 Adapter，或一条真实出站分支。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Downstream {
    Adapter(AdapterId),
    Outbound(BranchId),
}

#[derive(Debug)]
enum AdapterEvent {
    Request {
        adapter: AdapterId,
        request: SipMessage,
    },
    Response {
        adapter: AdapterId,
        fork: ForkId,
        response: SipMessage,
    },
    ForkError {
        adapter: AdapterId,
        fork: ForkId,
        error: ForkErrorState,
    },
    Cancel {
        adapter: AdapterId,
        status: u16,
        reason: String,
    },
    TimerPop {
        adapter: AdapterId,
        timer: TimerId,
        context: u64,
    },
}

impl AdapterEvent {
    fn adapter(&self) -> AdapterId {
        match self {
            AdapterEvent::Request { adapter, .. }
            | AdapterEvent::Response { adapter, .. }
            | AdapterEvent::ForkError { adapter, .. }
            | AdapterEvent::Cancel { adapter, .. }
            | AdapterEvent::TimerPop { adapter, .. } => *adapter,
        }
    }
}

/// 等待路由的分支请求。
#[derive(Debug)]
struct PendingRequest {
    request: SipMessage,
    upstream: (AdapterId, ForkId),
    allowed_host_state: AllowedHostState,
    depth: u32,
    upstream_network_function: String,
}

struct Selection {
    tsx: Box<dyn SproutletTsx>,
    service: Arc<ServiceEntry>,
    alias: String,
}

/// 单个入站事务的所有者。
///
/// # 教案式说明
/// - **意图 (Why)**：集中维护事务树，保证 Adapter 的创建、关联、销毁顺序正确；
/// - **契约 (What)**：
///   - 所有入口方法都接收 `&mut self`，跨线程访问由
///     [`TransactionTable`](super::TransactionTable) 的互斥锁串行化；
///   - 每个入口结束时调用 `check_destroy`，调用方通过 [`is_destroyed`](Self::is_destroyed)
///     决定是否移除控制器；
/// - **风险 (Trade-offs)**：`OutboundTransport` 在持锁期间被调用，实现需保持非阻塞。
pub struct TransactionController {
    id: TransactionId,
    router: Arc<ProxyRouter>,
    transport: Arc<dyn OutboundTransport>,
    timer_service: Arc<dyn TimerService>,
    state: ControllerState,
    root: Option<AdapterId>,
    adapters: Vec<Option<SproutletAdapter>>,
    downstream: HashMap<(AdapterId, ForkId), Downstream>,
    upstream: HashMap<Downstream, (AdapterId, ForkId)>,
    pending_requests: VecDeque<PendingRequest>,
    events: VecDeque<AdapterEvent>,
    timers: TimerTable,
    next_branch: u64,
    entered: usize,
}

impl fmt::Debug for TransactionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionController")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("root", &self.root)
            .field("live_adapters", &self.live_adapters())
            .field("pending_timers", &self.timers.pending_count())
            .field("timer_records", &self.timers.record_count())
            .finish_non_exhaustive()
    }
}

impl TransactionController {
    pub(crate) fn new(
        id: TransactionId,
        router: Arc<ProxyRouter>,
        transport: Arc<dyn OutboundTransport>,
        timer_service: Arc<dyn TimerService>,
    ) -> Self {
        Self {
            id,
            router,
            transport,
            timer_service,
            state: ControllerState::Initialized,
            root: None,
            adapters: Vec::new(),
            downstream: HashMap::new(),
            upstream: HashMap::new(),
            pending_requests: VecDeque::new(),
            events: VecDeque::new(),
            timers: TimerTable::default(),
            next_branch: 0,
            entered: 0,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == ControllerState::Destroyed
    }

    /// 仍存活的 Adapter 数量。
    pub fn live_adapters(&self) -> usize {
        self.adapters.iter().filter(|slot| slot.is_some()).count()
    }

    /// 尚未触发或取消的定时器数量。
    pub fn pending_timers(&self) -> usize {
        self.timers.pending_count()
    }

    /// 根 Adapter 承载的服务名；透明转发时为 `pass-through`。
    pub fn root_service(&self) -> Option<&str> {
        self.root
            .and_then(|root| self.adapter(root))
            .map(|adapter| adapter.spec().service_name.as_str())
    }

    /// 以入站请求启动事务。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - Max-Forwards 为 0 时直接回 483，不创建任何 Adapter；
    ///   - INVITE 先向上游回 `100 Trying`；
    ///   - 以上游网络功能 `EXTERNAL` 和接收端口选择服务，没有命中时使用透明转发；
    /// - **前置条件**：只能调用一次，重复调用被忽略。
    pub fn init(&mut self, request: SipMessage, port: u16) {
        if self.state != ControllerState::Initialized {
            warn!(transaction = %self.id, state = ?self.state, "init called twice, ignoring");
            return;
        }
        self.entered += 1;
        self.start(request, port);
        self.entered -= 1;
        self.check_destroy();
    }

    /// 下游响应到达出站分支 `branch`。
    pub fn on_inbound_response(&mut self, branch: BranchId, response: SipMessage) {
        self.entered += 1;
        match self.upstream.get(&Downstream::Outbound(branch)).copied() {
            Some((adapter, fork)) => {
                self.enqueue(AdapterEvent::Response {
                    adapter,
                    fork,
                    response,
                });
                self.drive();
            }
            None => debug!(
                transaction = %self.id,
                %branch,
                status = response.status_code(),
                "response for unknown branch, dropping"
            ),
        }
        self.entered -= 1;
        self.check_destroy();
    }

    /// 出站分支 `branch` 超时或传输失败。
    pub fn on_branch_failure(&mut self, branch: BranchId, error: ForkErrorState) {
        self.entered += 1;
        match self.upstream.get(&Downstream::Outbound(branch)).copied() {
            Some((adapter, fork)) => {
                self.enqueue(AdapterEvent::ForkError {
                    adapter,
                    fork,
                    error,
                });
                self.drive();
            }
            None => debug!(transaction = %self.id, %branch, "failure for unknown branch, dropping"),
        }
        self.entered -= 1;
        self.check_destroy();
    }

    /// 上游取消了事务。
    pub fn on_cancel(&mut self, status: u16, reason: &str) {
        self.entered += 1;
        match self.root {
            Some(adapter) => {
                self.enqueue(AdapterEvent::Cancel {
                    adapter,
                    status,
                    reason: reason.to_owned(),
                });
                self.drive();
            }
            None => debug!(transaction = %self.id, "cancel after completion, ignoring"),
        }
        self.entered -= 1;
        self.check_destroy();
    }

    /// 宿主定时器服务回报定时器到期。
    pub fn on_timer_pop(&mut self, timer: TimerId) {
        self.entered += 1;
        match self.timers.pop(timer) {
            Some(record) => {
                self.enqueue(AdapterEvent::TimerPop {
                    adapter: record.adapter,
                    timer,
                    context: record.context,
                });
                self.drive();
            }
            None => debug!(
                transaction = %self.id,
                %timer,
                outcome = RoutingOutcome::TimerRace.as_str(),
                "timer pop raced a cancel, ignoring"
            ),
        }
        self.entered -= 1;
        self.check_destroy();
    }

    fn start(&mut self, mut request: SipMessage, port: u16) {
        if request.max_forwards() == Some(0) {
            warn!(
                transaction = %self.id,
                request = %request.summary(),
                outcome = RoutingOutcome::TooManyHops.as_str(),
                "Max-Forwards exhausted on arrival"
            );
            if !request.is_ack() {
                let response = SipMessage::response_to(&request, 483, None);
                self.transport.send_response(self.id, response);
            }
            self.state = ControllerState::Terminated;
            return;
        }

        if request.is_method(&Method::Invite) {
            let trying = SipMessage::response_to(&request, 100, None);
            self.transport.send_response(self.id, trying);
        }

        let (spec, tsx) = match self.select_tsx(&mut request, port, EXTERNAL_NETWORK_FUNCTION, false)
        {
            Some(selection) => (
                AdapterSpec {
                    service_name: selection.service.name().to_owned(),
                    alias: selection.alias,
                    depth: 0,
                    network_function: selection.service.network_function().to_owned(),
                    upstream_network_function: EXTERNAL_NETWORK_FUNCTION.to_owned(),
                    allowed_host_state: AllowedHostState::All,
                },
                selection.tsx,
            ),
            None => (
                AdapterSpec {
                    service_name: PASS_THROUGH_NETWORK_FUNCTION.to_owned(),
                    alias: String::new(),
                    depth: 0,
                    network_function: PASS_THROUGH_NETWORK_FUNCTION.to_owned(),
                    upstream_network_function: EXTERNAL_NETWORK_FUNCTION.to_owned(),
                    allowed_host_state: AllowedHostState::All,
                },
                Box::new(PassThroughTsx) as Box<dyn SproutletTsx>,
            ),
        };

        let root = self.create_adapter(spec, tsx, &mut request);
        self.root = Some(root);
        self.state = ControllerState::Scheduling;
        self.enqueue(AdapterEvent::Request {
            adapter: root,
            request,
        });
        self.drive();
    }

    /// 交替处理事件队列与待调度请求，直到两者都为空。
    fn drive(&mut self) {
        loop {
            while let Some(event) = self.events.pop_front() {
                self.dispatch(event);
            }
            if self.pending_requests.is_empty() {
                break;
            }
            self.schedule_requests();
        }
    }

    fn schedule_requests(&mut self) {
        while let Some(pending) = self.pending_requests.pop_front() {
            self.schedule_request(pending);
        }
    }

    fn schedule_request(&mut self, pending: PendingRequest) {
        let PendingRequest {
            mut request,
            upstream: (parent, fork),
            allowed_host_state,
            depth,
            upstream_network_function,
        } = pending;
        let is_ack = request.is_ack();

        if !is_ack && self.adapter(parent).is_none() {
            debug!(transaction = %self.id, adapter = %parent, %fork, "originating adapter gone, dropping request");
            return;
        }

        if request.max_forwards() == Some(0) {
            warn!(
                transaction = %self.id,
                adapter = %parent,
                %fork,
                outcome = RoutingOutcome::TooManyHops.as_str(),
                "Max-Forwards exhausted, rejecting fork"
            );
            self.reject_fork(parent, fork, &request, 483);
            return;
        }

        if depth > self.router.max_sproutlet_depth() {
            warn!(
                transaction = %self.id,
                adapter = %parent,
                %fork,
                depth,
                outcome = RoutingOutcome::LoopDetected.as_str(),
                "sproutlet depth exceeded, rejecting fork"
            );
            self.reject_fork(parent, fork, &request, 482);
            return;
        }

        // 透明转发根节点已在 init 时完成过服务选择。
        if upstream_network_function == PASS_THROUGH_NETWORK_FUNCTION {
            self.send_outbound(parent, fork, request, allowed_host_state);
            return;
        }

        match self.select_tsx(&mut request, 0, &upstream_network_function, true) {
            Some(selection) => {
                let spec = AdapterSpec {
                    service_name: selection.service.name().to_owned(),
                    alias: selection.alias,
                    depth,
                    network_function: selection.service.network_function().to_owned(),
                    upstream_network_function,
                    allowed_host_state,
                };
                let child = self.create_adapter(spec, selection.tsx, &mut request);
                self.link(parent, fork, Downstream::Adapter(child));
                self.enqueue(AdapterEvent::Request {
                    adapter: child,
                    request,
                });
                // 父 Adapter 在本分支调度前已要求取消的，随请求之后投递给子 Adapter。
                let deferred = self
                    .adapter_mut(parent)
                    .and_then(|adapter| adapter.link_internal(fork));
                if let Some(cancel) = deferred {
                    self.execute(parent, vec![cancel]);
                }
            }
            None => self.send_outbound(parent, fork, request, allowed_host_state),
        }
    }

    fn reject_fork(&mut self, parent: AdapterId, fork: ForkId, request: &SipMessage, status: u16) {
        if request.is_ack() {
            return;
        }
        let response = SipMessage::response_to(request, status, None);
        self.enqueue(AdapterEvent::Response {
            adapter: parent,
            fork,
            response,
        });
    }

    /// 为请求选择接手的服务实例，可能改写请求的 Route 集合。
    ///
    /// # 教案式注释
    /// - **执行 (How)**：
    ///   1. 来自 Adapter 的请求若 top Route 指向本部署且带有已注册的 `service=`，
    ///      直接交给该服务；
    ///   2. 否则通过 `target_service` + 本地性判定选择服务；未命中时弹出指向本部署的
    ///      top Route 再试；
    ///   3. 服务拒绝时弹出选中它的 Route，压入其指定的下一跳后重试；
    /// - **契约 (What)**：返回 `None` 表示请求应按当前形态真实转发；重试次数受最大深度约束。
    fn select_tsx(
        &self,
        request: &mut SipMessage,
        mut port: u16,
        upstream_network_function: &str,
        from_adapter: bool,
    ) -> Option<Selection> {
        let router = self.router.as_ref();
        for _ in 0..router.max_sproutlet_depth() {
            if from_adapter {
                if let Some(service) = self.internal_route_target(request) {
                    let alias = service.name().to_owned();
                    debug!(
                        transaction = %self.id,
                        service = %alias,
                        "internal route names a service, dispatching directly"
                    );
                    let decision = service.sproutlet().get_tsx(request, &alias);
                    request.pop_route();
                    match decision {
                        TsxDecision::Accept(tsx) => {
                            return Some(Selection {
                                tsx,
                                service,
                                alias,
                            });
                        }
                        TsxDecision::Decline { next_hop } => {
                            debug!(transaction = %self.id, service = %alias, "service declined");
                            if let Some(next_hop) = next_hop {
                                request.push_route(next_hop);
                            }
                            port = 0;
                            continue;
                        }
                    }
                }
            }

            let matched = router.target_service(request, port);
            let Some(service) = matched.service.clone() else {
                if request
                    .top_route()
                    .is_some_and(|route| router.is_uri_reflexive(route))
                {
                    request.pop_route();
                    continue;
                }
                debug!(
                    transaction = %self.id,
                    request = %request.summary(),
                    outcome = RoutingOutcome::NoMatch.as_str(),
                    "no service matched"
                );
                return None;
            };

            if !self.accept_match(&matched, &service, upstream_network_function, request) {
                return None;
            }

            let via_route = request.top_route().is_some();
            match service.sproutlet().get_tsx(request, &matched.alias) {
                TsxDecision::Accept(tsx) => {
                    if via_route {
                        request.pop_route();
                    }
                    debug!(
                        transaction = %self.id,
                        service = %service.name(),
                        alias = %matched.alias,
                        selection = matched.selection.as_str(),
                        locality = matched.locality.as_str(),
                        "service accepted request"
                    );
                    return Some(Selection {
                        tsx,
                        service,
                        alias: matched.alias,
                    });
                }
                TsxDecision::Decline { next_hop } => {
                    debug!(transaction = %self.id, service = %service.name(), "service declined");
                    if via_route {
                        request.pop_route();
                    }
                    match next_hop {
                        Some(next_hop) => request.push_route(next_hop),
                        None if !via_route => return None,
                        None => {}
                    }
                    port = 0;
                }
            }
        }

        warn!(
            transaction = %self.id,
            request = %request.summary(),
            "service selection did not settle, forwarding request"
        );
        None
    }

    /// 指向本部署的 top Route 以 `service=` 参数命名的已注册服务。
    fn internal_route_target(&self, request: &SipMessage) -> Option<Arc<ServiceEntry>> {
        let route = request.top_route()?;
        if !self.router.is_uri_reflexive(route) {
            return None;
        }
        let name = route.param_value("service")?;
        self.router.service(name).cloned()
    }

    /// 本地命中一律接受；远端命中仅在强制本地处理或未跨越网络功能边界时接受。
    fn accept_match(
        &self,
        matched: &ServiceMatch,
        service: &ServiceEntry,
        upstream_network_function: &str,
        request: &SipMessage,
    ) -> bool {
        match matched.locality {
            Locality::Local => true,
            Locality::NoMatch => false,
            Locality::Remote => {
                let accepted = self.router.always_serve_remote_aliases()
                    || service.network_function() == upstream_network_function;
                if let Some(method) = request.method() {
                    if accepted {
                        self.router.metrics().accepted_for_remote_alias(method);
                    } else {
                        self.router.metrics().routed_to_remote_alias(method);
                    }
                }
                if !accepted {
                    info!(
                        transaction = %self.id,
                        service = %service.name(),
                        upstream_network_function,
                        outcome = RoutingOutcome::RemoteMatchRejected.as_str(),
                        "remote alias crosses a network function boundary, routing to remote site"
                    );
                }
                accepted
            }
        }
    }

    fn create_adapter(
        &mut self,
        spec: AdapterSpec,
        tsx: Box<dyn SproutletTsx>,
        request: &mut SipMessage,
    ) -> AdapterId {
        if spec.network_function != spec.upstream_network_function {
            request.decrement_max_forwards();
        }
        let id = AdapterId::new(self.adapters.len());
        debug!(
            transaction = %self.id,
            adapter = %id,
            service = %spec.service_name,
            depth = spec.depth,
            network_function = %spec.network_function,
            "adapter created"
        );
        self.adapters
            .push(Some(SproutletAdapter::new(id, spec, tsx, request)));
        id
    }

    fn send_outbound(
        &mut self,
        parent: AdapterId,
        fork: ForkId,
        request: SipMessage,
        allowed_host_state: AllowedHostState,
    ) {
        let branch = BranchId::new(self.next_branch);
        self.next_branch += 1;

        let stateless_next_hop = request
            .top_route()
            .or(request.request_uri())
            .is_some_and(|next_hop| self.router.is_stateless_proxy(next_hop));
        let is_ack = request.is_ack();
        if !is_ack {
            self.link(parent, fork, Downstream::Outbound(branch));
        }
        debug!(
            transaction = %self.id,
            adapter = %parent,
            %fork,
            %branch,
            request = %request.summary(),
            stateless_next_hop,
            "sending request outbound"
        );

        let outbound = OutboundRequest {
            transaction: self.id,
            branch,
            request,
            allowed_host_state,
            stateless_next_hop,
        };
        if let Err(failure) = self.transport.send_request(outbound) {
            warn!(
                transaction = %self.id,
                %branch,
                error = %failure,
                outcome = RoutingOutcome::BranchFailure.as_str(),
                "outbound send failed"
            );
            if !is_ack {
                self.enqueue(AdapterEvent::ForkError {
                    adapter: parent,
                    fork,
                    error: ForkErrorState::from(&failure),
                });
            }
        }
    }

    fn dispatch(&mut self, event: AdapterEvent) {
        let target = event.adapter();
        let Some(adapter) = self
            .adapters
            .get_mut(target.index())
            .and_then(Option::as_mut)
        else {
            debug!(transaction = %self.id, adapter = %target, "adapter gone, dropping event");
            return;
        };

        let mut env = AdapterEnv {
            transaction: self.id,
            router: self.router.as_ref(),
            timers: &mut self.timers,
            timer_service: self.timer_service.as_ref(),
        };
        let actions = match event {
            AdapterEvent::Request { request, .. } => adapter.rx_request(&mut env, request),
            AdapterEvent::Response { fork, response, .. } => {
                adapter.rx_response(&mut env, fork, response)
            }
            AdapterEvent::ForkError { fork, error, .. } => {
                adapter.rx_fork_error(&mut env, fork, error)
            }
            AdapterEvent::Cancel { status, reason, .. } => {
                adapter.rx_cancel(&mut env, status, &reason)
            }
            AdapterEvent::TimerPop { timer, context, .. } => {
                adapter.on_timer_pop(&mut env, timer, context)
            }
        };

        self.execute(target, actions);
        if let Some(adapter) = self.adapter_mut(target) {
            adapter.leave();
        }
        self.maybe_destroy_adapter(target);
    }

    fn execute(&mut self, source: AdapterId, actions: Vec<AdapterAction>) {
        for action in actions {
            match action {
                AdapterAction::Request {
                    fork,
                    request,
                    allowed_host_state,
                } => self.tx_request(source, fork, request, allowed_host_state),
                AdapterAction::Response(response) => self.tx_response(source, response),
                AdapterAction::Cancel {
                    fork,
                    cancel,
                    status,
                    reason,
                } => self.tx_cancel(source, fork, cancel, status, reason),
            }
        }
    }

    fn tx_request(
        &mut self,
        source: AdapterId,
        fork: ForkId,
        request: SipMessage,
        allowed_host_state: AllowedHostState,
    ) {
        let Some((depth, upstream_network_function)) = self
            .adapter(source)
            .map(|adapter| (adapter.spec().depth + 1, adapter.spec().network_function.clone()))
        else {
            return;
        };
        self.pending_requests.push_back(PendingRequest {
            request,
            upstream: (source, fork),
            allowed_host_state,
            depth,
            upstream_network_function,
        });
    }

    fn tx_response(&mut self, source: AdapterId, response: SipMessage) {
        if self.root == Some(source) {
            debug!(
                transaction = %self.id,
                response = %response.summary(),
                "forwarding response upstream"
            );
            self.transport.send_response(self.id, response);
            return;
        }
        match self.upstream.get(&Downstream::Adapter(source)).copied() {
            Some((parent, fork)) => self.enqueue(AdapterEvent::Response {
                adapter: parent,
                fork,
                response,
            }),
            None => debug!(
                transaction = %self.id,
                adapter = %source,
                "upstream adapter gone, dropping response"
            ),
        }
    }

    fn tx_cancel(
        &mut self,
        source: AdapterId,
        fork: ForkId,
        cancel: SipMessage,
        status: u16,
        reason: String,
    ) {
        match self.downstream.get(&(source, fork)).copied() {
            Some(Downstream::Adapter(child)) => self.enqueue(AdapterEvent::Cancel {
                adapter: child,
                status,
                reason,
            }),
            Some(Downstream::Outbound(branch)) => {
                debug!(transaction = %self.id, adapter = %source, %fork, %branch, "sending CANCEL");
                self.transport.send_cancel(self.id, branch, cancel);
            }
            None => debug!(
                transaction = %self.id,
                adapter = %source,
                %fork,
                "cancel for unlinked fork, dropping"
            ),
        }
    }

    fn enqueue(&mut self, event: AdapterEvent) {
        match self.adapter_mut(event.adapter()) {
            Some(adapter) => {
                adapter.enter();
                self.events.push_back(event);
            }
            None => debug!(transaction = %self.id, adapter = %event.adapter(), "adapter gone, dropping event"),
        }
    }

    fn link(&mut self, adapter: AdapterId, fork: ForkId, downstream: Downstream) {
        self.downstream.insert((adapter, fork), downstream);
        self.upstream.insert(downstream, (adapter, fork));
    }

    fn maybe_destroy_adapter(&mut self, id: AdapterId) {
        let Some(adapter) = self.adapter(id) else {
            return;
        };
        if adapter.entered() > 0 || adapter.has_pending_timers() || !adapter.is_complete() {
            return;
        }
        if let Some(slot) = self.adapters.get_mut(id.index()) {
            *slot = None;
        }

        if let Some(key) = self.upstream.remove(&Downstream::Adapter(id)) {
            self.downstream.remove(&key);
        }
        let owned: Vec<(AdapterId, ForkId)> = self
            .downstream
            .keys()
            .filter(|(owner, _)| *owner == id)
            .copied()
            .collect();
        for key in owned {
            if let Some(downstream) = self.downstream.remove(&key) {
                self.upstream.remove(&downstream);
            }
        }

        if self.root == Some(id) {
            self.root = None;
            if self.state == ControllerState::Scheduling {
                self.state = ControllerState::Terminated;
            }
        }
        debug!(transaction = %self.id, adapter = %id, "adapter destroyed");
    }

    fn check_destroy(&mut self) {
        if self.state == ControllerState::Destroyed || self.entered > 0 {
            return;
        }
        if !self.events.is_empty() || !self.pending_requests.is_empty() {
            return;
        }
        if !self.timers.is_idle() || self.adapters.iter().any(Option::is_some) {
            return;
        }
        self.state = ControllerState::Destroyed;
        self.timers.release();
        self.adapters.clear();
        self.downstream.clear();
        self.upstream.clear();
        debug!(transaction = %self.id, "transaction destroyed");
    }

    fn adapter(&self, id: AdapterId) -> Option<&SproutletAdapter> {
        self.adapters.get(id.index()).and_then(Option::as_ref)
    }

    fn adapter_mut(&mut self, id: AdapterId) -> Option<&mut SproutletAdapter> {
        self.adapters.get_mut(id.index()).and_then(Option::as_mut)
    }
}
