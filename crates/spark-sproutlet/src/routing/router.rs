//! # ProxyRouter：不可变路由视图与事务控制器工厂
//!
//! ## 核心意图（Why）
//! - 汇总服务注册表、别名表与路由策略（远端别名、最大深度、无状态下一跳），为每个事务
//!   提供一致的只读视图；
//! - 热更新通过 [`RouterHandle`] 整体替换 `Arc<ProxyRouter>` 完成：已创建的事务继续使用
//!   创建时的快照，新事务立即看到新配置。
//!
//! ## 行为契约（What）
//! - 根 URI 的主机名总是本地别名；
//! - 构建期发现服务名/别名/端口冲突时返回 [`SproutletError`]，不会得到半成品路由器；
//! - 所有查询方法为纯函数，可并发调用。

use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;

use crate::{
    config::ProxyConfig,
    core::{TimerService, TransactionController},
    error::SproutletError,
    message::SipMessage,
    metrics::{NoopRoutingMetrics, RoutingMetrics},
    routing::{
        locality::{AliasTable, Locality, LocalityResolver, SelectionKind, ServiceMatch},
        registry::{ServiceEntry, ServiceRegistry},
    },
    sproutlet::Sproutlet,
    transport::{OutboundTransport, TransactionId},
    uri::SipUri,
};

/// 路由器构建器。
///
/// # 教案式说明
/// - **意图 (Why)**：配置只描述“服务名 → 实现名”的绑定，实现对象由宿主在代码中提供，
///   构建器负责把两者拼装并完成冲突校验；
/// - **契约 (What)**：
///   - 配置的 `services` 为空时，按提供顺序注册全部实现并使用其自身声明的元数据；
///   - 否则仅注册配置列出的绑定；绑定名与实现名一致时，未填写的字段沿用实现的声明；
///     改名挂载的绑定只使用绑定里写明的别名、端口与网络功能；
/// - **风险 (Trade-offs)**：同名实现只取首个，重复提供不会报错。
pub struct ProxyRouterBuilder {
    config: ProxyConfig,
    implementations: Vec<Arc<dyn Sproutlet>>,
    metrics: Arc<dyn RoutingMetrics>,
}

impl ProxyRouterBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            implementations: Vec::new(),
            metrics: Arc::new(NoopRoutingMetrics),
        }
    }

    #[must_use]
    pub fn sproutlet(mut self, sproutlet: Arc<dyn Sproutlet>) -> Self {
        self.implementations.push(sproutlet);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn RoutingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<ProxyRouter, SproutletError> {
        let root_uri = self.config.validate()?;

        let mut aliases = AliasTable::new(&self.config.local_aliases, &self.config.remote_aliases);
        aliases.add_local(&root_uri.host);

        let mut registry = ServiceRegistry::default();
        if self.config.services.is_empty() {
            for implementation in &self.implementations {
                registry.register(ServiceEntry::from_sproutlet(Arc::clone(implementation)))?;
            }
        } else {
            for binding in &self.config.services {
                let implementation = self
                    .implementations
                    .iter()
                    .find(|candidate| candidate.service_name() == binding.implementation_name())
                    .ok_or_else(|| SproutletError::UnknownImplementation {
                        binding: binding.name.clone(),
                        implementation: binding.implementation_name().to_owned(),
                    })?;

                let same_name = binding.name == implementation.service_name();
                let mut service_aliases = binding.aliases.clone();
                let mut port = binding.port;
                let mut network_function = binding.network_function.clone();
                if same_name {
                    for alias in implementation.aliases() {
                        if !service_aliases.contains(alias) {
                            service_aliases.push(alias.clone());
                        }
                    }
                    port = port.or(implementation.port());
                    network_function =
                        network_function.or_else(|| implementation.network_function().map(str::to_owned));
                }
                registry.register(ServiceEntry::new(
                    binding.name.clone(),
                    service_aliases,
                    port,
                    network_function,
                    Arc::clone(implementation),
                ))?;
            }
        }

        let stateless_proxies = self
            .config
            .stateless_proxies
            .iter()
            .map(|next_hop| next_hop.to_ascii_lowercase())
            .collect();

        Ok(ProxyRouter {
            root_uri,
            resolver: LocalityResolver::new(aliases, registry),
            always_serve_remote_aliases: self.config.always_serve_remote_aliases,
            max_sproutlet_depth: self.config.max_sproutlet_depth,
            stateless_proxies,
            metrics: self.metrics,
        })
    }
}

/// 部署级的不可变路由视图。
pub struct ProxyRouter {
    root_uri: SipUri,
    resolver: LocalityResolver,
    always_serve_remote_aliases: bool,
    max_sproutlet_depth: u32,
    stateless_proxies: HashSet<String>,
    metrics: Arc<dyn RoutingMetrics>,
}

impl fmt::Debug for ProxyRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRouter")
            .field("root_uri", &self.root_uri)
            .field("resolver", &self.resolver)
            .field("always_serve_remote_aliases", &self.always_serve_remote_aliases)
            .field("max_sproutlet_depth", &self.max_sproutlet_depth)
            .field("stateless_proxies", &self.stateless_proxies)
            .finish_non_exhaustive()
    }
}

impl ProxyRouter {
    pub fn builder(config: ProxyConfig) -> ProxyRouterBuilder {
        ProxyRouterBuilder::new(config)
    }

    pub fn root_uri(&self) -> &SipUri {
        &self.root_uri
    }

    pub fn resolver(&self) -> &LocalityResolver {
        &self.resolver
    }

    pub fn service(&self, name: &str) -> Option<&Arc<ServiceEntry>> {
        self.resolver.registry().lookup(name)
    }

    pub fn always_serve_remote_aliases(&self) -> bool {
        self.always_serve_remote_aliases
    }

    pub fn max_sproutlet_depth(&self) -> u32 {
        self.max_sproutlet_depth
    }

    pub fn metrics(&self) -> &dyn RoutingMetrics {
        self.metrics.as_ref()
    }

    pub fn host_locality(&self, host: &str) -> Locality {
        self.resolver.host_locality(host)
    }

    pub fn uri_locality(&self, uri: &SipUri) -> Locality {
        self.resolver.uri_locality(uri)
    }

    pub fn is_uri_reflexive(&self, uri: &SipUri) -> bool {
        self.resolver.is_uri_reflexive(uri)
    }

    pub fn match_service(&self, uri: &SipUri) -> ServiceMatch {
        self.resolver.match_service(uri)
    }

    /// 为请求选择目标服务。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 目标 URI 为 top Route，缺失时为 Request-URI；
    ///   - 名称类匹配失败且（没有 Route 或目标指向本部署）时，回退到端口匹配：
    ///     优先使用 `port`，为 0 时仅在目标指向本部署的情况下使用目标 URI 的端口；
    ///   - 端口匹配总是 LOCAL，选择方式为 [`SelectionKind::Port`]。
    pub fn target_service(&self, request: &SipMessage, port: u16) -> ServiceMatch {
        let route = request.top_route();
        let Some(target) = route.or(request.request_uri()) else {
            return ServiceMatch::no_match();
        };

        let matched = self.resolver.match_service(target);
        if matched.is_match() {
            return matched;
        }

        let reflexive = self.is_uri_reflexive(target);
        if route.is_some() && !reflexive {
            return matched;
        }

        let port = if port != 0 {
            Some(port)
        } else if reflexive {
            target.port
        } else {
            None
        };
        match port.and_then(|port| self.resolver.registry().lookup_port(port)) {
            Some(service) => ServiceMatch {
                alias: service.name().to_owned(),
                service: Some(Arc::clone(service)),
                selection: SelectionKind::Port,
                locality: Locality::Local,
            },
            None => matched,
        }
    }

    /// 外部重新进入本部署时使用的路由 URI：`sip:<根主机>;lr;service=<名称>`。
    pub fn build_routing_uri(&self, service: &str) -> SipUri {
        SipUri {
            scheme: self.root_uri.scheme,
            host: self.root_uri.host.clone(),
            ..SipUri::default()
        }
        .with_param("lr", None)
        .with_param("service", Some(service))
    }

    /// 内部逐跳分发使用的路由 URI：克隆 `base` 并加上 `lr` 与 `service=<名称>`。
    pub fn build_internal_routing_uri(&self, service: &str, base: &SipUri) -> SipUri {
        base.clone()
            .with_param("lr", None)
            .with_param("service", Some(service))
    }

    /// 拒绝处理的服务指定下一跳时使用，与内部路由 URI 同形。
    pub fn next_hop_uri(&self, service: &str, base: &SipUri) -> SipUri {
        self.build_internal_routing_uri(service, base)
    }

    /// 下一跳是否为配置的无状态代理。
    pub fn is_stateless_proxy(&self, uri: &SipUri) -> bool {
        self.stateless_proxies
            .contains(&uri.host_port().to_ascii_lowercase())
            || self
                .stateless_proxies
                .contains(&uri.host.to_ascii_lowercase())
    }

    /// 创建绑定到当前路由快照的事务控制器。
    pub fn create_transaction_controller(
        self: &Arc<Self>,
        id: TransactionId,
        transport: Arc<dyn OutboundTransport>,
        timers: Arc<dyn TimerService>,
    ) -> TransactionController {
        TransactionController::new(id, Arc::clone(self), transport, timers)
    }
}

/// 可热更新的路由器句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：读路径零锁（`ArcSwap::load_full`），写路径整表替换；
/// - **契约 (What)**：[`update`](Self::update) 之后创建的事务看到新路由器，
///   之前创建的事务继续持有旧快照直到销毁。
pub struct RouterHandle {
    current: ArcSwap<ProxyRouter>,
    revision: AtomicU64,
}

impl RouterHandle {
    pub fn new(router: ProxyRouter) -> Self {
        Self {
            current: ArcSwap::from_pointee(router),
            revision: AtomicU64::new(0),
        }
    }

    /// 当前快照。
    pub fn load(&self) -> Arc<ProxyRouter> {
        self.current.load_full()
    }

    /// 先替换路由器再发布版本号：读到新版本号的读者一定能取到对应的路由器。
    pub fn update(&self, revision: u64, router: ProxyRouter) {
        self.current.store(Arc::new(router));
        self.revision.store(revision, Ordering::Release);
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterHandle")
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ServiceBinding,
        message::Method,
        sproutlet::TsxDecision,
    };

    struct Named {
        name: &'static str,
        port: Option<u16>,
    }

    impl Sproutlet for Named {
        fn service_name(&self) -> &str {
            self.name
        }

        fn port(&self) -> Option<u16> {
            self.port
        }

        fn get_tsx(&self, _: &SipMessage, _: &str) -> TsxDecision {
            TsxDecision::decline()
        }
    }

    fn named(name: &'static str, port: Option<u16>) -> Arc<dyn Sproutlet> {
        Arc::new(Named { name, port })
    }

    fn router() -> ProxyRouter {
        let mut config = ProxyConfig::new("sip:sprout.example.com:5054");
        config.remote_aliases = vec!["sprout-b.example.com".to_owned()];
        config.stateless_proxies = vec!["bgcf.example.com:5060".to_owned()];
        ProxyRouter::builder(config)
            .sproutlet(named("scscf", Some(5054)))
            .sproutlet(named("icscf", None))
            .build()
            .expect("router builds")
    }

    fn request(uri: &str) -> SipMessage {
        SipMessage::request(Method::Invite, SipUri::parse(uri).expect("uri"))
    }

    #[test]
    fn root_host_is_always_local() {
        let router = router();
        assert_eq!(router.host_locality("sprout.example.com"), Locality::Local);
    }

    #[test]
    fn route_header_takes_precedence_over_request_uri() {
        let router = router();
        let req = request("sip:scscf@sprout.example.com")
            .with_route(SipUri::parse("sip:icscf.sprout.example.com;lr").expect("uri"));
        let matched = router.target_service(&req, 0);
        assert_eq!(matched.service_name(), Some("icscf"));
        assert_eq!(matched.selection, SelectionKind::DomainPart);
    }

    #[test]
    fn port_fallback_applies_without_route() {
        let router = router();
        let req = request("sip:bob@elsewhere.net");
        let matched = router.target_service(&req, 5054);
        assert_eq!(matched.service_name(), Some("scscf"));
        assert_eq!(matched.selection, SelectionKind::Port);
        assert_eq!(matched.locality, Locality::Local);

        assert!(!router.target_service(&req, 0).is_match());
    }

    #[test]
    fn port_fallback_uses_reflexive_target_port() {
        let router = router();
        let req = request("sip:sprout.example.com:5054");
        assert_eq!(router.target_service(&req, 0).service_name(), Some("scscf"));

        let foreign = request("sip:elsewhere.net:5054");
        assert!(!router.target_service(&foreign, 0).is_match());
    }

    #[test]
    fn foreign_route_disables_port_fallback() {
        let router = router();
        let req = request("sip:bob@sprout.example.com")
            .with_route(SipUri::parse("sip:edge.elsewhere.net;lr").expect("uri"));
        assert!(!router.target_service(&req, 5054).is_match());
    }

    #[test]
    fn routing_uri_formats() {
        let router = router();
        assert_eq!(
            router.build_routing_uri("scscf").to_string(),
            "sip:sprout.example.com;lr;service=scscf"
        );
        let base = SipUri::parse("sip:sprout.example.com:5054").expect("uri");
        assert_eq!(
            router.build_internal_routing_uri("icscf", &base).to_string(),
            "sip:sprout.example.com:5054;lr;service=icscf"
        );
        assert_eq!(
            router.next_hop_uri("icscf", &base),
            router.build_internal_routing_uri("icscf", &base)
        );
    }

    #[test]
    fn stateless_proxy_matches_host_port() {
        let router = router();
        assert!(router.is_stateless_proxy(&SipUri::parse("sip:BGCF.example.com:5060").expect("uri")));
        assert!(!router.is_stateless_proxy(&SipUri::parse("sip:bgcf.example.com").expect("uri")));
    }

    #[test]
    fn bindings_can_rename_and_must_reference_known_implementations() {
        let mut config = ProxyConfig::new("sip:sprout.example.com");
        let mut renamed = ServiceBinding::new("icscf");
        renamed.implementation = Some("scscf".to_owned());
        renamed.network_function = Some("i-cscf".to_owned());
        config.services = vec![ServiceBinding::new("scscf"), renamed];

        let router = ProxyRouter::builder(config.clone())
            .sproutlet(named("scscf", Some(5054)))
            .build()
            .expect("router builds");
        let icscf = router.service("icscf").expect("renamed binding registered");
        assert_eq!(icscf.port(), None);
        assert_eq!(icscf.network_function(), "i-cscf");
        assert_eq!(router.service("scscf").and_then(|s| s.port()), Some(5054));

        let err = ProxyRouter::builder(config)
            .sproutlet(named("bgcf", None))
            .build()
            .expect_err("unknown implementation");
        assert!(matches!(err, SproutletError::UnknownImplementation { .. }));
    }

    #[test]
    fn duplicate_ports_fail_the_build() {
        let err = ProxyRouter::builder(ProxyConfig::new("sip:sprout.example.com"))
            .sproutlet(named("scscf", Some(5054)))
            .sproutlet(named("bgcf", Some(5054)))
            .build()
            .expect_err("duplicate port");
        assert!(matches!(err, SproutletError::DuplicatePort { port: 5054, .. }));
    }

    #[test]
    fn handle_swaps_whole_router() {
        let handle = RouterHandle::new(router());
        let before = handle.load();
        assert!(before.service("icscf").is_some());

        let replacement = ProxyRouter::builder(ProxyConfig::new("sip:sprout.example.com"))
            .sproutlet(named("bgcf", None))
            .build()
            .expect("router builds");
        handle.update(2, replacement);

        assert_eq!(handle.revision(), 2);
        assert!(handle.load().service("icscf").is_none());
        assert!(before.service("icscf").is_some());
    }

    #[test]
    fn published_revision_never_outruns_router() {
        fn router_at(revision: u64) -> ProxyRouter {
            let mut config = ProxyConfig::new("sip:sprout.example.com");
            config.max_sproutlet_depth = u32::try_from(revision + 1).expect("small revision");
            ProxyRouter::builder(config).build().expect("router builds")
        }

        let handle = RouterHandle::new(router_at(0));
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for revision in 1..=200 {
                    handle.update(revision, router_at(revision));
                }
            });
            scope.spawn(|| {
                for _ in 0..2_000 {
                    let revision = handle.revision();
                    let depth = handle.load().max_sproutlet_depth();
                    assert!(u64::from(depth) > revision);
                }
            });
        });
        assert_eq!(handle.revision(), 200);
        assert_eq!(handle.load().max_sproutlet_depth(), 201);
    }
}
