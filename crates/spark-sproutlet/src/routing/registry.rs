//! 服务注册表：服务名/别名 → 服务、端口 → 服务。

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{error::SproutletError, sproutlet::Sproutlet};

/// 已注册的服务条目。
///
/// # 教案式说明
/// - **意图 (Why)**：同一个 [`Sproutlet`] 实现可以按不同绑定多次挂载，条目记录的是
///   “绑定后”的最终元数据，而非实现自身的声明；
/// - **契约 (What)**：`network_function` 总是非空，缺省等于服务名。
pub struct ServiceEntry {
    name: String,
    aliases: Vec<String>,
    port: Option<u16>,
    network_function: String,
    sproutlet: Arc<dyn Sproutlet>,
}

impl ServiceEntry {
    /// 以实现自身的声明构造条目。
    pub fn from_sproutlet(sproutlet: Arc<dyn Sproutlet>) -> Self {
        let name = sproutlet.service_name().to_owned();
        Self {
            aliases: sproutlet.aliases().to_vec(),
            port: sproutlet.port(),
            network_function: sproutlet
                .network_function()
                .map_or_else(|| name.clone(), str::to_owned),
            name,
            sproutlet,
        }
    }

    /// 以显式元数据构造条目；`network_function` 为 `None` 时取服务名。
    pub fn new(
        name: impl Into<String>,
        aliases: Vec<String>,
        port: Option<u16>,
        network_function: Option<String>,
        sproutlet: Arc<dyn Sproutlet>,
    ) -> Self {
        let name = name.into();
        Self {
            network_function: network_function.unwrap_or_else(|| name.clone()),
            name,
            aliases,
            port,
            sproutlet,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn network_function(&self) -> &str {
        &self.network_function
    }

    pub fn sproutlet(&self) -> &Arc<dyn Sproutlet> {
        &self.sproutlet
    }
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("port", &self.port)
            .field("network_function", &self.network_function)
            .finish_non_exhaustive()
    }
}

/// 不可变的服务索引，由 [`ProxyRouterBuilder`](super::ProxyRouterBuilder) 构建。
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    ordered: Vec<Arc<ServiceEntry>>,
    by_name: HashMap<String, Arc<ServiceEntry>>,
    by_port: HashMap<u16, Arc<ServiceEntry>>,
}

impl ServiceRegistry {
    /// 注册服务；名称、别名或端口与已有条目冲突时返回错误且不修改注册表。
    pub fn register(&mut self, entry: ServiceEntry) -> Result<Arc<ServiceEntry>, SproutletError> {
        let mut names = Vec::with_capacity(entry.aliases.len() + 1);
        names.push(entry.name.clone());
        for alias in &entry.aliases {
            if !names.contains(alias) {
                names.push(alias.clone());
            }
        }
        if let Some(taken) = names.iter().find(|name| self.by_name.contains_key(*name)) {
            return Err(SproutletError::DuplicateService {
                name: taken.clone(),
            });
        }
        if let Some(port) = entry.port {
            if let Some(existing) = self.by_port.get(&port) {
                return Err(SproutletError::DuplicatePort {
                    port,
                    existing: existing.name.clone(),
                });
            }
        }

        let entry = Arc::new(entry);
        for name in names {
            self.by_name.insert(name, Arc::clone(&entry));
        }
        if let Some(port) = entry.port {
            self.by_port.insert(port, Arc::clone(&entry));
        }
        self.ordered.push(Arc::clone(&entry));
        Ok(entry)
    }

    /// 按服务名或别名查找。
    pub fn lookup(&self, name: &str) -> Option<&Arc<ServiceEntry>> {
        self.by_name.get(name)
    }

    pub fn lookup_port(&self, port: u16) -> Option<&Arc<ServiceEntry>> {
        self.by_port.get(&port)
    }

    /// 按注册顺序遍历。
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceEntry>> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::SipMessage, sproutlet::TsxDecision};

    struct Named(&'static str);

    impl Sproutlet for Named {
        fn service_name(&self) -> &str {
            self.0
        }

        fn get_tsx(&self, _: &SipMessage, _: &str) -> TsxDecision {
            TsxDecision::decline()
        }
    }

    fn entry(name: &str, aliases: &[&str], port: Option<u16>) -> ServiceEntry {
        ServiceEntry::new(
            name,
            aliases.iter().map(|alias| (*alias).to_owned()).collect(),
            port,
            None,
            Arc::new(Named("impl")),
        )
    }

    #[test]
    fn lookups_cover_names_aliases_and_ports() {
        let mut registry = ServiceRegistry::default();
        registry
            .register(entry("scscf", &["s-cscf"], Some(5054)))
            .expect("first registration succeeds");

        assert_eq!(registry.lookup("scscf").map(|e| e.name()), Some("scscf"));
        assert_eq!(registry.lookup("s-cscf").map(|e| e.name()), Some("scscf"));
        assert_eq!(registry.lookup_port(5054).map(|e| e.name()), Some("scscf"));
        assert_eq!(
            registry.lookup("scscf").map(|e| e.network_function()),
            Some("scscf")
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_alias_is_rejected_atomically() {
        let mut registry = ServiceRegistry::default();
        registry
            .register(entry("scscf", &["shared"], None))
            .expect("first registration succeeds");

        let err = registry
            .register(entry("icscf", &["shared"], Some(5052)))
            .expect_err("alias collision must fail");
        assert!(matches!(err, SproutletError::DuplicateService { ref name } if name == "shared"));
        assert!(registry.lookup("icscf").is_none());
        assert!(registry.lookup_port(5052).is_none());
    }

    #[test]
    fn duplicate_port_is_rejected() {
        let mut registry = ServiceRegistry::default();
        registry
            .register(entry("scscf", &[], Some(5054)))
            .expect("first registration succeeds");
        let err = registry
            .register(entry("bgcf", &[], Some(5054)))
            .expect_err("port collision must fail");
        assert!(matches!(
            err,
            SproutletError::DuplicatePort { port: 5054, ref existing } if existing == "scscf"
        ));
    }

    #[test]
    fn declared_metadata_is_used_by_default() {
        struct Declared;
        impl Sproutlet for Declared {
            fn service_name(&self) -> &str {
                "mmtel"
            }
            fn port(&self) -> Option<u16> {
                Some(5055)
            }
            fn network_function(&self) -> Option<&str> {
                Some("as")
            }
            fn get_tsx(&self, _: &SipMessage, _: &str) -> TsxDecision {
                TsxDecision::decline()
            }
        }

        let entry = ServiceEntry::from_sproutlet(Arc::new(Declared));
        assert_eq!(entry.name(), "mmtel");
        assert_eq!(entry.port(), Some(5055));
        assert_eq!(entry.network_function(), "as");
    }
}
