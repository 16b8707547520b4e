//! 集成测试共用的录制型替身与测试 Sproutlet。

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use spark_sproutlet::{
    ProxyConfig, ProxyRouter, SipMessage, SipUri, Sproutlet, SproutletTsx, TransactionTable,
    TsxContext, TsxDecision,
    core::{TimerId, TimerKey, TimerService},
    message::Method,
    metrics::AliasRoutingCounters,
    routing::RouterHandle,
    transport::{BranchId, OutboundRequest, OutboundTransport, SendFailure, TransactionId},
};

/// 录制所有出站动作的传输替身。
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<OutboundRequest>>,
    cancels: Mutex<Vec<(BranchId, SipMessage)>>,
    responses: Mutex<Vec<SipMessage>>,
    failure: Mutex<Option<SendFailure>>,
}

impl RecordingTransport {
    /// 之后的所有 `send_request` 同步失败。
    pub fn fail_sends_with(&self, failure: SendFailure) {
        *self.failure.lock() = Some(failure);
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    pub fn cancels(&self) -> Vec<(BranchId, SipMessage)> {
        self.cancels.lock().clone()
    }

    pub fn responses(&self) -> Vec<SipMessage> {
        self.responses.lock().clone()
    }

    pub fn statuses(&self) -> Vec<u16> {
        self.responses
            .lock()
            .iter()
            .filter_map(SipMessage::status_code)
            .collect()
    }

    pub fn final_statuses(&self) -> Vec<u16> {
        self.statuses()
            .into_iter()
            .filter(|status| *status >= 200)
            .collect()
    }
}

impl OutboundTransport for RecordingTransport {
    fn send_request(&self, request: OutboundRequest) -> Result<(), SendFailure> {
        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }
        self.requests.lock().push(request);
        Ok(())
    }

    fn send_cancel(&self, _: TransactionId, branch: BranchId, cancel: SipMessage) {
        self.cancels.lock().push((branch, cancel));
    }

    fn send_response(&self, _: TransactionId, response: SipMessage) {
        self.responses.lock().push(response);
    }
}

/// 只记录挂起/取消，由测试手动触发的定时器服务。
#[derive(Default)]
pub struct ManualTimerService {
    scheduled: Mutex<Vec<(TimerKey, Duration)>>,
    cancelled: Mutex<Vec<TimerKey>>,
}

impl ManualTimerService {
    pub fn scheduled(&self) -> Vec<TimerKey> {
        self.scheduled.lock().iter().map(|(key, _)| *key).collect()
    }

    pub fn cancelled(&self) -> Vec<TimerKey> {
        self.cancelled.lock().clone()
    }
}

impl TimerService for ManualTimerService {
    fn schedule(&self, key: TimerKey, after: Duration) -> bool {
        self.scheduled.lock().push((key, after));
        true
    }

    fn cancel(&self, key: TimerKey) {
        self.cancelled.lock().push(key);
    }
}

/// 一个测试部署：路由器句柄、事务表与两个替身。
pub struct Harness {
    pub router: RouterHandle,
    pub table: TransactionTable,
    pub transport: Arc<RecordingTransport>,
    pub timers: Arc<ManualTimerService>,
    pub counters: Arc<AliasRoutingCounters>,
}

impl Harness {
    pub fn new(config: ProxyConfig, sproutlets: Vec<Arc<dyn Sproutlet>>) -> Self {
        let counters = Arc::new(AliasRoutingCounters::new());
        let mut builder = ProxyRouter::builder(config).metrics(Arc::clone(&counters) as _);
        for sproutlet in sproutlets {
            builder = builder.sproutlet(sproutlet);
        }
        let router = builder.build().expect("router builds");

        let transport = Arc::new(RecordingTransport::default());
        let timers = Arc::new(ManualTimerService::default());
        let table = TransactionTable::new(
            Arc::clone(&transport) as Arc<dyn OutboundTransport>,
            Arc::clone(&timers) as Arc<dyn TimerService>,
        );
        Self {
            router: RouterHandle::new(router),
            table,
            transport,
            timers,
            counters,
        }
    }

    pub fn start(&self, request: SipMessage) -> TransactionId {
        self.start_on_port(request, 0)
    }

    pub fn start_on_port(&self, request: SipMessage, port: u16) -> TransactionId {
        self.table.start(&self.router, request, port)
    }

    /// 以原请求为模板回送下游响应。
    pub fn respond(&self, txn: TransactionId, branch: u64, request: &SipMessage, status: u16) -> bool {
        self.table.deliver_response(
            txn,
            BranchId::new(branch),
            SipMessage::response_to(request, status, None),
        )
    }

    pub fn pop_timer(&self, txn: TransactionId, timer: TimerId) -> bool {
        self.table.deliver_timer_pop(TimerKey {
            transaction: txn,
            timer,
        })
    }
}

/// `sprout.example.com` 为本地、`sprout-site2.example.com` 为远端的部署配置。
pub fn config() -> ProxyConfig {
    let mut config = ProxyConfig::new("sip:sprout.example.com");
    config.local_aliases = vec!["sprout.example.com".to_owned(), "10.0.0.1".to_owned()];
    config.remote_aliases = vec!["sprout-site2.example.com".to_owned()];
    config
}

pub fn invite() -> SipMessage {
    SipMessage::request(Method::Invite, SipUri::new("example.com").with_user("bob"))
        .with_call_id("call-1@example.com")
        .with_header("Via", "SIP/2.0/UDP client.example.com;branch=z9hG4bK1")
}

/// `sip:<host>;lr;service=<name>`。
pub fn service_route(host: &str, service: &str) -> SipUri {
    SipUri::new(host)
        .with_param("lr", None)
        .with_param("service", Some(service))
}

pub fn loose_route(host: &str) -> SipUri {
    SipUri::new(host).with_param("lr", None)
}

/// 记录到达请求的可观察信息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seen {
    pub alias: String,
    pub depth: u32,
    pub max_forwards: Option<u32>,
    pub routes: usize,
    pub network_function_boundary: bool,
}

/// 测试 Sproutlet 对请求的处理方式。
#[derive(Clone, Debug)]
pub enum Behaviour {
    /// 原样转发。
    Forward,
    /// 压入指向 `service` 的内部路由后转发。
    ForwardTo { service: String },
    /// 在深度 0 时压入 `route` 后转发，其余深度原样转发。
    RouteOnceVia { route: SipUri },
    /// 直接回应 `status`。
    Respond { status: u16 },
    /// 以给定 Request-URI 各发一条分支。
    Fork { targets: Vec<SipUri> },
    /// 每个 Route 压入一条分支后发出。
    ForkVia { routes: Vec<SipUri> },
    /// 拒绝处理，可指定下一跳。
    Decline { next_hop: Option<SipUri> },
}

/// 按 [`Behaviour`] 行动并记录每次调用的测试 Sproutlet。
pub struct Scripted {
    name: String,
    network_function: Option<String>,
    port: Option<u16>,
    behaviour: Behaviour,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Scripted {
    pub fn new(name: &str, behaviour: Behaviour) -> Self {
        Self {
            name: name.to_owned(),
            network_function: None,
            port: None,
            behaviour,
            seen: Arc::default(),
        }
    }

    pub fn network_function(mut self, network_function: &str) -> Self {
        self.network_function = Some(network_function.to_owned());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<Seen>>> {
        Arc::clone(&self.seen)
    }
}

impl Sproutlet for Scripted {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> Option<u16> {
        self.port
    }

    fn network_function(&self) -> Option<&str> {
        self.network_function.as_deref()
    }

    fn get_tsx(&self, _: &SipMessage, _: &str) -> TsxDecision {
        if let Behaviour::Decline { next_hop } = &self.behaviour {
            return TsxDecision::Decline {
                next_hop: next_hop.clone(),
            };
        }
        TsxDecision::accept(ScriptedTsx {
            behaviour: self.behaviour.clone(),
            seen: Arc::clone(&self.seen),
        })
    }
}

struct ScriptedTsx {
    behaviour: Behaviour,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl SproutletTsx for ScriptedTsx {
    fn on_rx_request(&mut self, ctx: &mut TsxContext<'_>, mut request: SipMessage) {
        self.seen.lock().push(Seen {
            alias: ctx.alias().to_owned(),
            depth: ctx.depth(),
            max_forwards: request.max_forwards(),
            routes: request.routes().len(),
            network_function_boundary: ctx.is_network_func_boundary(),
        });

        match &self.behaviour {
            Behaviour::Forward | Behaviour::Decline { .. } => {
                ctx.send_request(request);
            }
            Behaviour::ForwardTo { service } => {
                let base = ctx.routing_uri();
                request.push_route(ctx.next_hop_uri(service, &base));
                ctx.send_request(request);
            }
            Behaviour::RouteOnceVia { route } => {
                if ctx.depth() == 0 {
                    request.push_route(route.clone());
                }
                ctx.send_request(request);
            }
            Behaviour::Respond { status } => {
                let response = ctx.create_response(&request, *status, None);
                ctx.send_response(response);
            }
            Behaviour::Fork { targets } => {
                for target in targets {
                    let mut branch = request.clone();
                    if let Some(uri) = branch.request_uri_mut() {
                        *uri = target.clone();
                    }
                    ctx.send_request(branch);
                }
            }
            Behaviour::ForkVia { routes } => {
                for route in routes {
                    let mut branch = request.clone();
                    branch.push_route(route.clone());
                    ctx.send_request(branch);
                }
            }
        }
    }
}
