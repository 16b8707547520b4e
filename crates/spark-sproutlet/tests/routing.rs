//! 配置驱动的服务选择与路由器热更新。

mod support;

use std::sync::Arc;

use spark_sproutlet::{ProxyConfig, ProxyRouter, SipUri, message::Method};
use support::{Behaviour, Harness, Scripted, config, invite, loose_route, service_route};

const DEPLOYMENT: &str = r#"
root_uri = "sip:sprout.example.com:5054"
local_aliases = ["10.0.0.1"]
remote_aliases = ["sprout-site2.example.com"]
stateless_proxies = ["edge.example.net:5060"]

[[services]]
name = "scscf"
port = 5054

[[services]]
name = "bgcf"
implementation = "scscf"
aliases = ["breakout"]
network_function = "bgcf"
"#;

fn deployment(scscf: Scripted) -> Harness {
    let config = ProxyConfig::from_toml_str(DEPLOYMENT).expect("valid deployment");
    Harness::new(config, vec![Arc::new(scscf)])
}

#[test]
fn renamed_binding_is_selected_by_its_alias() {
    let scscf = Scripted::new("scscf", Behaviour::Respond { status: 200 });
    let seen = scscf.seen();
    let h = deployment(scscf);

    h.start(invite().with_route(loose_route("breakout.sprout.example.com")));

    assert_eq!(seen.lock()[0].alias, "breakout");
    assert!(seen.lock()[0].network_function_boundary);
    assert_eq!(h.transport.statuses(), vec![100, 200]);
}

#[test]
fn bound_port_selects_service() {
    let scscf = Scripted::new("scscf", Behaviour::Respond { status: 404 });
    let seen = scscf.seen();
    let h = deployment(scscf);

    h.start_on_port(invite(), 5054);

    assert_eq!(seen.lock()[0].alias, "scscf");
    assert_eq!(h.transport.final_statuses(), vec![404]);
}

#[test]
fn secondary_local_alias_is_reflexive() {
    let scscf = Scripted::new("scscf", Behaviour::Respond { status: 200 });
    let seen = scscf.seen();
    let h = deployment(scscf);

    h.start(
        spark_sproutlet::SipMessage::request(
            Method::Invite,
            SipUri::new("10.0.0.1").with_user("scscf"),
        ),
    );

    assert_eq!(seen.lock().len(), 1);
    assert!(h.transport.requests().is_empty());
}

#[test]
fn stateless_next_hop_is_flagged() {
    let h = deployment(Scripted::new("scscf", Behaviour::Forward));

    h.start(invite().with_route(
        SipUri::new("edge.example.net")
            .with_port(5060)
            .with_param("lr", None),
    ));

    let sent = h.transport.requests();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].stateless_next_hop);
}

#[test]
fn router_update_only_affects_new_transactions() {
    let h = Harness::new(config(), vec![]);
    let first_request = invite();
    let first = h.start(first_request.clone());
    assert_eq!(h.router.revision(), 0);

    let busy = Scripted::new("busy", Behaviour::Respond { status: 486 });
    let updated = ProxyRouter::builder(config())
        .sproutlet(Arc::new(busy))
        .build()
        .expect("router builds");
    h.router.update(1, updated);
    assert_eq!(h.router.revision(), 1);

    let second = h.start(invite().with_route(service_route("sprout.example.com", "busy")));
    assert_eq!(h.transport.final_statuses(), vec![486]);
    assert!(!h.table.contains(second));

    assert!(h.table.contains(first), "in-flight transaction keeps its snapshot");
    h.respond(first, 0, &first_request, 200);
    assert_eq!(h.transport.final_statuses(), vec![486, 200]);
    assert!(h.table.is_empty());
}
