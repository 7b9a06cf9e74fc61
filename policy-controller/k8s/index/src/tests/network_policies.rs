use super::*;
use netpol_controller_core::{PortRange, Protocol};
use netpol_controller_k8s_api::IntOrString;

fn web_policy(name: &str, peer: k8s::NetworkPolicyPeer) -> k8s::NetworkPolicy {
    mk_policy(
        "ns-0",
        name,
        label_selector(Some(("app", "web"))),
        Some(mk_ingress(Some(peer))),
    )
}

#[test]
fn targeted_pods_leave_the_default_allow_set() {
    let test = TestConfig::default();
    let web = mk_pod("ns-0", "web-0", Some(("app", "web")), Some("10.0.0.1"));
    let db = mk_pod("ns-0", "db-0", Some(("app", "db")), Some("10.0.0.2"));
    test.index.write().add_pod(&web).unwrap();
    test.index.write().add_pod(&db).unwrap();
    assert_eq!(
        test.default_allowed("ns-0"),
        Some(ips(["10.0.0.1", "10.0.0.2"]))
    );
    assert_eq!(
        test.index.read().kernel().rules(Chain::Default),
        vec![RuleSpec::allow_to(SetName::default_allow("ns-0"))]
    );

    // A policy without ingress rules isolates its targets without admitting anything.
    let deny = mk_policy("ns-0", "deny-web", label_selector(Some(("app", "web"))), None);
    test.index.write().add_network_policy(&deny).unwrap();
    assert_eq!(test.default_allowed("ns-0"), Some(ips(["10.0.0.2"])));
    assert!(test.ingress_rules().is_empty());

    test.index.write().delete_network_policy(&deny).unwrap();
    assert_eq!(
        test.default_allowed("ns-0"),
        Some(ips(["10.0.0.1", "10.0.0.2"]))
    );
}

#[test]
fn egress_only_policies_do_not_isolate() {
    let test = TestConfig::default();
    let pod = mk_pod("ns-0", "pod-0", None, Some("10.0.0.1"));
    test.index.write().add_pod(&pod).unwrap();

    let mut np = mk_policy("ns-0", "egress", LabelSelector::default(), None);
    np.spec.as_mut().unwrap().policy_types = Some(vec!["Egress".to_string()]);
    test.index.write().add_network_policy(&np).unwrap();
    assert_eq!(test.default_allowed("ns-0"), Some(ips(["10.0.0.1"])));

    // The policy still keeps the namespace alive.
    test.index.write().delete_pod(&pod).unwrap();
    assert_eq!(test.namespaces(), vec!["ns-0".to_string()]);
    test.index.write().delete_network_policy(&np).unwrap();
    test.assert_clean();
}

#[test]
fn shared_selectors_are_reference_counted() {
    let test = TestConfig::default();
    let client = SelectorKey::pods("ns-0", selector(Some(("role", "client"))));
    let web = SelectorKey::pods("ns-0", selector(Some(("app", "web"))));

    let np0 = web_policy("np-0", pod_peer(Some(("role", "client"))));
    let np1 = mk_policy(
        "ns-0",
        "np-1",
        label_selector(Some(("app", "db"))),
        Some(mk_ingress(Some(pod_peer(Some(("role", "client")))))),
    );

    test.index.write().add_network_policy(&np0).unwrap();
    assert_eq!(test.refs(&client), Some(1));
    assert_eq!(test.refs(&web), Some(1));

    test.index.write().add_network_policy(&np1).unwrap();
    assert_eq!(test.refs(&client), Some(2));
    assert_eq!(test.refs(&web), Some(1));
    assert_eq!(test.ingress_rules().len(), 2);

    test.index.write().delete_network_policy(&np0).unwrap();
    assert_eq!(test.refs(&client), Some(1));
    assert_eq!(test.refs(&web), None);
    assert_eq!(test.members(&web.set_name()), None);
    assert_eq!(test.members(&client.set_name()), Some(BTreeSet::new()));
    assert_eq!(test.ingress_rules().len(), 1);

    test.index.write().delete_network_policy(&np1).unwrap();
    assert_eq!(test.refs(&client), None);
    assert_eq!(test.members(&client.set_name()), None);
    test.assert_clean();
}

#[test]
fn identical_rules_are_installed_once() {
    let test = TestConfig::default();
    let np0 = web_policy("np-0", pod_peer(Some(("role", "client"))));
    let np1 = web_policy("np-1", pod_peer(Some(("role", "client"))));

    test.index.write().add_network_policy(&np0).unwrap();
    test.index.write().add_network_policy(&np1).unwrap();
    let rules = test.ingress_rules();
    assert_eq!(rules.len(), 1);

    test.index.write().delete_network_policy(&np0).unwrap();
    assert_eq!(test.ingress_rules(), rules);
    test.index.write().delete_network_policy(&np1).unwrap();
    test.assert_clean();
}

#[test]
fn updates_keep_shared_sets_in_place() {
    let test = TestConfig::default();
    let pod = mk_pod("ns-0", "web-0", Some(("app", "web")), Some("10.0.0.1"));
    test.index.write().add_pod(&pod).unwrap();

    let web = SelectorKey::pods("ns-0", selector(Some(("app", "web"))));
    let client = SelectorKey::pods("ns-0", selector(Some(("role", "client"))));
    let admin = SelectorKey::pods("ns-0", selector(Some(("role", "admin"))));

    let old = web_policy("np-0", pod_peer(Some(("role", "client"))));
    test.index.write().add_network_policy(&old).unwrap();
    assert_eq!(test.members(&web.set_name()), Some(ips(["10.0.0.1"])));

    // Swap the peer. The target set is retained, and the old peer's set is released only after
    // the new rule is in place.
    let new = web_policy("np-0", pod_peer(Some(("role", "admin"))));
    test.index.write().update_network_policy(&old, &new).unwrap();
    assert_eq!(test.refs(&web), Some(1));
    assert_eq!(test.refs(&client), None);
    assert_eq!(test.refs(&admin), Some(1));
    assert_eq!(
        test.ingress_rules(),
        vec![RuleSpec {
            protocol: None,
            sources: vec![admin.set_name()],
            destination: web.set_name(),
            ports: None,
        }]
    );
    assert_eq!(test.members(&web.set_name()), Some(ips(["10.0.0.1"])));
    assert_eq!(test.default_allowed("ns-0"), Some(BTreeSet::new()));

    // Retarget the policy away from the pod.
    let mut retargeted = new.clone();
    retargeted.spec.as_mut().unwrap().pod_selector = label_selector(Some(("app", "db"))).into();
    test.index
        .write()
        .update_network_policy(&new, &retargeted)
        .unwrap();
    assert_eq!(test.refs(&web), None);
    assert_eq!(test.default_allowed("ns-0"), Some(ips(["10.0.0.1"])));
}

#[test]
fn combined_peers_match_both_sets() {
    let test = TestConfig::default();
    test.index
        .write()
        .add_namespace(&mk_ns("ns-1", Some(("env", "prod"))))
        .unwrap();
    test.index
        .write()
        .add_pod(&mk_pod("ns-1", "client-0", Some(("role", "client")), Some("10.0.1.1")))
        .unwrap();
    test.index
        .write()
        .add_pod(&mk_pod("ns-2", "client-0", Some(("role", "client")), Some("10.0.2.1")))
        .unwrap();

    let np = web_policy(
        "np-0",
        k8s::NetworkPolicyPeer {
            pod_selector: Some(label_selector(Some(("role", "client")))),
            namespace_selector: Some(label_selector(Some(("env", "prod")))),
            ..Default::default()
        },
    );
    test.index.write().add_network_policy(&np).unwrap();

    let prod = SelectorKey::namespaces(selector(Some(("env", "prod"))));
    let clients = SelectorKey::cluster_pods(selector(Some(("role", "client"))));
    assert_eq!(
        test.members(&prod.set_name()),
        Some(sets([SetName::all_pods("ns-1")]))
    );
    assert_eq!(
        test.members(&clients.set_name()),
        Some(ips(["10.0.1.1", "10.0.2.1"]))
    );
    assert_eq!(
        test.ingress_rules(),
        vec![RuleSpec {
            protocol: None,
            sources: vec![prod.set_name(), clients.set_name()],
            destination: SelectorKey::pods("ns-0", selector(Some(("app", "web")))).set_name(),
            ports: None,
        }]
    );

    // Cluster-scoped pod selectors pick up pods in namespaces created later.
    test.index
        .write()
        .add_pod(&mk_pod("ns-3", "client-0", Some(("role", "client")), Some("10.0.3.1")))
        .unwrap();
    assert_eq!(
        test.members(&clients.set_name()),
        Some(ips(["10.0.1.1", "10.0.2.1", "10.0.3.1"]))
    );
}

#[test]
fn ports_compile_to_one_rule_each() {
    let test = TestConfig::default();
    let np = mk_policy(
        "ns-0",
        "np-0",
        label_selector(Some(("app", "web"))),
        Some(k8s::NetworkPolicyIngressRule {
            from: None,
            ports: Some(vec![
                k8s::NetworkPolicyPort {
                    port: Some(IntOrString::Int(8080)),
                    ..Default::default()
                },
                k8s::NetworkPolicyPort {
                    protocol: Some("UDP".to_string()),
                    port: Some(IntOrString::Int(5000)),
                    end_port: Some(5010),
                },
                k8s::NetworkPolicyPort {
                    port: Some(IntOrString::String("http".to_string())),
                    ..Default::default()
                },
            ]),
        }),
    );
    test.index.write().add_network_policy(&np).unwrap();

    let dst = SelectorKey::pods("ns-0", selector(Some(("app", "web")))).set_name();
    let mut rules = test.ingress_rules();
    rules.sort();
    let mut expected = vec![
        RuleSpec {
            protocol: Some(Protocol::Tcp),
            sources: vec![],
            destination: dst.clone(),
            ports: Some(PortRange::single(8080)),
        },
        RuleSpec {
            protocol: Some(Protocol::Udp),
            sources: vec![],
            destination: dst,
            ports: Some(PortRange::new(5000, 5010).unwrap()),
        },
    ];
    expected.sort();
    assert_eq!(rules, expected);
}

#[test]
fn invalid_policies_are_rejected() {
    let test = TestConfig::default();
    let np = mk_policy(
        "ns-0",
        "np-0",
        LabelSelector {
            match_expressions: Some(vec![k8s::LabelSelectorRequirement {
                key: "app".to_string(),
                operator: "In".to_string(),
                values: None,
            }]),
            ..Default::default()
        },
        None,
    );
    test.index
        .write()
        .add_network_policy(&np)
        .expect_err("In requires values");
    test.assert_clean();
}
