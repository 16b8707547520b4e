//! # 别名与本地性判定
//!
//! ## 核心意图（Why）
//! - 部署对外暴露多个主机名：本站点的“本地别名”与同一逻辑部署在其它站点的“远端别名”；
//! - 判定一个 URI 是否指向本部署，以及它点名了哪个服务，是所有路由决策的起点。
//!
//! ## 行为契约（What）
//! - 主机名比较忽略大小写；同时出现在两个集合中的主机按 LOCAL 处理；
//! - 服务选择优先级：`service=` 参数 → `<服务>.<别名>` 域名 → `<服务>@<别名>` 用户名，
//!   首个命中者胜出，且主机必须是本地或远端别名；
//! - 全部方法只读、无副作用，可在任意线程并发调用。

use std::{collections::HashSet, sync::Arc};

use crate::{
    routing::registry::{ServiceEntry, ServiceRegistry},
    uri::SipUri,
};

/// 主机或 URI 相对本部署的位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Locality {
    NoMatch,
    Remote,
    Local,
}

impl Locality {
    pub fn is_match(self) -> bool {
        !matches!(self, Locality::NoMatch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Locality::NoMatch => "no_match",
            Locality::Remote => "remote",
            Locality::Local => "local",
        }
    }
}

/// 服务是如何被选中的。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SelectionKind {
    ServiceParam,
    DomainPart,
    UserPart,
    Port,
    None,
}

impl SelectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionKind::ServiceParam => "service_param",
            SelectionKind::DomainPart => "domain_part",
            SelectionKind::UserPart => "user_part",
            SelectionKind::Port => "port",
            SelectionKind::None => "none",
        }
    }
}

/// 服务匹配结果。
///
/// `service` 为 `None` 时即 NO_MATCH 哨兵，此时 `alias` 为空、`locality` 为
/// [`Locality::NoMatch`]。
#[derive(Clone, Debug)]
pub struct ServiceMatch {
    pub service: Option<Arc<ServiceEntry>>,
    /// 选中服务时使用的名字（服务名或别名）。
    pub alias: String,
    pub selection: SelectionKind,
    pub locality: Locality,
}

impl ServiceMatch {
    pub fn no_match() -> Self {
        Self {
            service: None,
            alias: String::new(),
            selection: SelectionKind::None,
            locality: Locality::NoMatch,
        }
    }

    fn found(
        service: &Arc<ServiceEntry>,
        alias: &str,
        selection: SelectionKind,
        locality: Locality,
    ) -> Self {
        Self {
            service: Some(Arc::clone(service)),
            alias: alias.to_owned(),
            selection,
            locality,
        }
    }

    pub fn is_match(&self) -> bool {
        self.service.is_some()
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service.as_deref().map(ServiceEntry::name)
    }
}

/// 本地/远端别名集合，内部统一保存小写形式。
#[derive(Clone, Debug, Default)]
pub struct AliasTable {
    local: HashSet<String>,
    remote: HashSet<String>,
}

impl AliasTable {
    pub fn new<L, R>(local: L, remote: R) -> Self
    where
        L: IntoIterator,
        L::Item: AsRef<str>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        Self {
            local: local
                .into_iter()
                .map(|host| host.as_ref().to_ascii_lowercase())
                .collect(),
            remote: remote
                .into_iter()
                .map(|host| host.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn add_local(&mut self, host: &str) {
        self.local.insert(host.to_ascii_lowercase());
    }

    pub fn host_locality(&self, host: &str) -> Locality {
        let host = host.to_ascii_lowercase();
        if self.local.contains(&host) {
            Locality::Local
        } else if self.remote.contains(&host) {
            Locality::Remote
        } else {
            Locality::NoMatch
        }
    }
}

/// 结合别名表与服务注册表的解析器。
#[derive(Debug, Default)]
pub struct LocalityResolver {
    aliases: AliasTable,
    registry: ServiceRegistry,
}

impl LocalityResolver {
    pub fn new(aliases: AliasTable, registry: ServiceRegistry) -> Self {
        Self { aliases, registry }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn host_locality(&self, host: &str) -> Locality {
        self.aliases.host_locality(host)
    }

    /// URI 的“本地主机名”：主机本身是别名时即主机；否则若形如 `<服务>.<后缀>`
    /// 且前缀是已注册服务，则为后缀；其余情况返回主机本身。
    pub fn local_hostname<'u>(&self, uri: &'u SipUri) -> &'u str {
        let host = uri.host.as_str();
        if self.host_locality(host).is_match() {
            return host;
        }
        match host.split_once('.') {
            Some((prefix, suffix))
                if self.lookup_service_label(prefix).is_some()
                    && self.host_locality(suffix).is_match() =>
            {
                suffix
            }
            _ => host,
        }
    }

    pub fn uri_locality(&self, uri: &SipUri) -> Locality {
        self.host_locality(self.local_hostname(uri))
    }

    /// URI 是否指向本部署（本地主机名为 LOCAL）。
    pub fn is_uri_reflexive(&self, uri: &SipUri) -> bool {
        self.uri_locality(uri) == Locality::Local
    }

    /// 按 `service=` 参数、域名前缀、用户名的顺序选择服务。
    pub fn match_service(&self, uri: &SipUri) -> ServiceMatch {
        if let Some(name) = uri.param_value("service") {
            if let Some(service) = self.registry.lookup(name) {
                let locality = self.uri_locality(uri);
                if locality.is_match() {
                    return ServiceMatch::found(
                        service,
                        name,
                        SelectionKind::ServiceParam,
                        locality,
                    );
                }
            }
        }

        if let Some((prefix, suffix)) = uri.host.split_once('.') {
            if let Some(service) = self.lookup_service_label(prefix) {
                let locality = self.host_locality(suffix);
                if locality.is_match() {
                    return ServiceMatch::found(
                        service,
                        &prefix.to_ascii_lowercase(),
                        SelectionKind::DomainPart,
                        locality,
                    );
                }
            }
        }

        if let Some(user) = uri.user.as_deref() {
            if let Some(service) = self.registry.lookup(user) {
                let locality = self.host_locality(&uri.host);
                if locality.is_match() {
                    return ServiceMatch::found(service, user, SelectionKind::UserPart, locality);
                }
            }
        }

        ServiceMatch::no_match()
    }

    fn lookup_service_label(&self, label: &str) -> Option<&Arc<ServiceEntry>> {
        self.registry
            .lookup(label)
            .or_else(|| self.registry.lookup(&label.to_ascii_lowercase()))
    }
}
