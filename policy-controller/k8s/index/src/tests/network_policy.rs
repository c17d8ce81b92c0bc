use super::*;
use proptest::prelude::*;
use serde_json::json;

fn allow_from(app: &str) -> serde_json::Value {
    json!({
        "podSelector": { "matchLabels": { "app": "api" } },
        "ingress": [{ "from": [{ "podSelector": { "matchLabels": { "app": app } } }] }],
    })
}

#[test]
fn policies_with_the_same_selector_are_merged() {
    let mut test = TestConfig::default();

    test.add_policy(mk_policy("ns-0", "from-web", allow_from("web")));
    assert_eq!(
        test.rules(),
        vec![
            "ingress allow src=[ns-ns-0,podlabel-app:web] dst=[ns-ns-0,podlabel-app:api]",
            "ingress drop src=[] dst=[ns-ns-0,podlabel-app:api]",
        ]
    );

    // The new allow rule is installed ahead of the drop rule, which is
    // reinstalled.
    let ops = test.add_policy(mk_policy("ns-0", "from-batch", allow_from("batch")));
    assert!(!ops.contains(&Op::BootstrapSharedInfra));
    assert_eq!(
        test.rules(),
        vec![
            "ingress allow src=[ns-ns-0,podlabel-app:web] dst=[ns-ns-0,podlabel-app:api]",
            "ingress allow src=[ns-ns-0,podlabel-app:batch] dst=[ns-ns-0,podlabel-app:api]",
            "ingress drop src=[] dst=[ns-ns-0,podlabel-app:api]",
        ]
    );
    {
        let index = test.index.read();
        let ns = &index.namespaces.by_ns["ns-0"];
        assert_eq!(ns.policies.len(), 2);
        assert_eq!(ns.processed.len(), 1);
        let processed = ns.processed.values().next().unwrap();
        assert_eq!(processed.contributors, vec!["from-batch", "from-web"]);
        assert!(processed.has_default_deny(Direction::Ingress));
    }

    // Removing one policy leaves only the other's rules.
    test.remove_policy("ns-0", "from-web");
    assert_eq!(
        test.rules(),
        vec![
            "ingress allow src=[ns-ns-0,podlabel-app:batch] dst=[ns-ns-0,podlabel-app:api]",
            "ingress drop src=[] dst=[ns-ns-0,podlabel-app:api]",
        ]
    );
    assert!(!test.index.read().contains_set("podlabel-app:web"));
    assert!(test.index.read().contains_set("podlabel-app:batch"));

    test.remove_policy("ns-0", "from-batch");
    assert!(test.rules().is_empty());
    test.assert_sets_collected();
    assert!(test.index.read().can_tear_down_shared_infra());
    assert!(test.index.read().namespaces.by_ns.is_empty());
}

#[test]
fn policies_with_different_selectors_are_not_merged() {
    let mut test = TestConfig::default();
    test.add_policy(mk_policy("ns-0", "api", allow_from("web")));
    test.add_policy(mk_policy(
        "ns-0",
        "db",
        json!({
            "podSelector": { "matchLabels": { "app": "db" } },
            "ingress": [{ "from": [{ "podSelector": { "matchLabels": { "app": "api" } } }] }],
        }),
    ));
    assert_eq!(test.index.read().namespaces.by_ns["ns-0"].processed.len(), 2);
    assert_eq!(test.rules().len(), 4);

    // The same selector in another namespace is enforced separately.
    test.add_policy(mk_policy("ns-1", "api", allow_from("web")));
    assert_eq!(test.index.read().namespaces.by_ns["ns-1"].processed.len(), 1);
    assert_eq!(test.rules().len(), 6);
}

#[test]
fn merged_drop_rules_are_not_duplicated() {
    let mut test = TestConfig::default();
    test.add_policy(mk_policy(
        "ns-0",
        "deny-a",
        json!({ "podSelector": {}, "policyTypes": ["Ingress"] }),
    ));
    test.add_policy(mk_policy(
        "ns-0",
        "deny-b",
        json!({ "podSelector": {}, "policyTypes": ["Ingress"] }),
    ));
    assert_eq!(test.rules(), vec!["ingress drop src=[] dst=[ns-ns-0]"]);
    assert_eq!(test.dataplane.rules()[0].policy, "ns-0/deny-a");

    // The remaining policy's own drop rule replaces the first one.
    test.remove_policy("ns-0", "deny-a");
    assert_eq!(test.rules(), vec!["ingress drop src=[] dst=[ns-ns-0]"]);
    assert_eq!(test.dataplane.rules()[0].policy, "ns-0/deny-b");
}

#[test]
fn reapplying_a_policy_is_idempotent() {
    let mut test = TestConfig::default();
    let policy = mk_policy("ns-0", "from-web", allow_from("web"));
    assert!(!test.add_policy(policy.clone()).is_empty());
    assert!(test.add_policy(policy).is_empty());
}

#[test]
fn updating_a_policy_replaces_its_rules() {
    let mut test = TestConfig::default();
    test.add_policy(mk_policy("ns-0", "api", allow_from("web")));
    test.add_policy(mk_policy("ns-0", "api", allow_from("batch")));
    assert_eq!(
        test.rules(),
        vec![
            "ingress allow src=[ns-ns-0,podlabel-app:batch] dst=[ns-ns-0,podlabel-app:api]",
            "ingress drop src=[] dst=[ns-ns-0,podlabel-app:api]",
        ]
    );
    assert!(!test.index.read().contains_set("podlabel-app:web"));
}

#[test]
fn changing_the_pod_selector_moves_the_policy() {
    let mut test = TestConfig::default();
    test.add_policy(mk_policy("ns-0", "web", allow_from("web")));
    let ops = test.add_policy(mk_policy(
        "ns-0",
        "web",
        json!({
            "podSelector": { "matchLabels": { "app": "gateway" } },
            "ingress": [{ "from": [{ "podSelector": { "matchLabels": { "app": "web" } } }] }],
        }),
    ));
    assert!(!ops.contains(&Op::TeardownSharedInfra));
    assert_eq!(
        test.rules(),
        vec![
            "ingress allow src=[ns-ns-0,podlabel-app:web] dst=[ns-ns-0,podlabel-app:gateway]",
            "ingress drop src=[] dst=[ns-ns-0,podlabel-app:gateway]",
        ]
    );
    assert_eq!(test.index.read().namespaces.by_ns["ns-0"].processed.len(), 1);
    assert!(!test.index.read().contains_set("podlabel-app:api"));
    assert!(test.index.read().contains_set("podlabel-app:web"));
}

#[test]
fn update_policy_handles_deletion() {
    let mut test = TestConfig::default();
    let old = mk_policy("ns-0", "api", allow_from("web"));
    test.add_policy(old.clone());

    let new = mk_policy("ns-0", "api", allow_from("batch"));
    let ops = test.index.write().update_policy(&old, new.clone());
    test.sync(ops);
    assert_eq!(test.rules().len(), 2);
    assert!(test.index.read().contains_set("podlabel-app:batch"));

    let ops = test.index.write().update_policy(&old, deleting(new));
    test.sync(ops);
    assert!(test.rules().is_empty());
    assert!(!test.dataplane.is_bootstrapped());
}

#[test]
fn deletion_timestamp_removes_policy() {
    let mut test = TestConfig::default();
    let policy = mk_policy("ns-0", "api", allow_from("web"));
    test.add_policy(policy.clone());

    let ops = test.index.write().apply_policy(deleting(policy)).unwrap();
    test.sync(ops);
    assert!(test.rules().is_empty());
}

#[test]
fn rejected_updates_keep_the_previous_version() {
    let mut test = TestConfig::default();
    test.add_policy(mk_policy("ns-0", "api", allow_from("web")));
    let before = test.rules();

    let invalid = mk_policy(
        "ns-0",
        "api",
        json!({
            "podSelector": {
                "matchExpressions": [{ "key": "app", "operator": "Matches", "values": ["x"] }],
            },
        }),
    );
    assert!(test.index.write().add_policy(invalid).is_err());
    assert_eq!(test.rules(), before);
}

#[test]
fn shared_infra_is_torn_down_after_the_last_policy() {
    let mut test = TestConfig::default();
    let policies = [
        mk_policy("ns-0", "a", allow_from("web")),
        mk_policy("ns-0", "b", json!({ "podSelector": {}, "policyTypes": ["Egress"] })),
        mk_policy("ns-1", "c", allow_from("batch")),
    ];

    for (i, policy) in policies.iter().enumerate() {
        let ops = test.add_policy(policy.clone());
        assert_eq!(ops.contains(&Op::BootstrapSharedInfra), i == 0);
    }
    assert!(!test.index.read().can_tear_down_shared_infra());

    for (ns, name) in [("ns-0", "a"), ("ns-1", "c")] {
        let ops = test.remove_policy(ns, name);
        assert!(!ops.contains(&Op::TeardownSharedInfra));
        assert!(!test.index.read().can_tear_down_shared_infra());
    }

    let ops = test.remove_policy("ns-0", "b");
    assert_eq!(ops.last(), Some(&Op::TeardownSharedInfra));
    assert!(test.index.read().can_tear_down_shared_infra());
    assert!(!test.dataplane.is_bootstrapped());
    test.assert_sets_collected();
}

#[test]
fn sets_shared_between_policies_outlive_either() {
    let mut test = TestConfig::default();
    test.add_policy(mk_policy("ns-0", "api", allow_from("web")));
    test.add_policy(mk_policy(
        "ns-0",
        "db",
        json!({
            "podSelector": { "matchLabels": { "app": "db" } },
            "ingress": [{ "from": [{ "podSelector": { "matchLabels": { "app": "web" } } }] }],
        }),
    ));

    test.remove_policy("ns-0", "api");
    assert!(test.index.read().contains_set("podlabel-app:web"));
    assert!(!test.index.read().contains_set("podlabel-app:api"));

    test.remove_policy("ns-0", "db");
    assert!(!test.index.read().contains_set("podlabel-app:web"));
}

#[test]
fn cidr_sets_follow_policy_updates() {
    let mut test = TestConfig::default();
    let egress = |cidr: &str| {
        json!({
            "podSelector": {},
            "egress": [{ "to": [{ "ipBlock": { "cidr": cidr, "except": ["10.0.1.0/24"] } }] }],
            "policyTypes": ["Egress"],
        })
    };

    test.add_policy(mk_policy("ns-0", "ext", egress("10.0.0.0/16")));
    assert_eq!(
        test.members("ext-in-ns-ns-0-0OUT"),
        vec!["10.0.0.0/16", "10.0.1.0/24 nomatch"]
    );

    test.add_policy(mk_policy("ns-0", "ext", egress("10.0.0.0/8")));
    assert_eq!(
        test.members("ext-in-ns-ns-0-0OUT"),
        vec!["10.0.0.0/8", "10.0.1.0/24 nomatch"]
    );
    assert_eq!(
        test.rules(),
        vec![
            "egress allow src=[ns-ns-0] dst=[ext-in-ns-ns-0-0OUT]",
            "egress drop src=[ns-ns-0] dst=[]",
        ]
    );

    test.remove_policy("ns-0", "ext");
    test.assert_sets_collected();
}

#[test]
fn nested_sets_are_created_before_use() {
    let mut test = TestConfig::default();
    test.add_policy(mk_policy(
        "ns-0",
        "nested",
        json!({
            "podSelector": {
                "matchExpressions": [{ "key": "app", "operator": "In", "values": ["a", "b"] }],
            },
            "ingress": [{
                "from": [{
                    "namespaceSelector": {
                        "matchExpressions": [{ "key": "team", "operator": "In", "values": ["x", "y"] }],
                    },
                }],
            }],
        }),
    ));
    assert_eq!(
        test.members("nestedlabel-app:a:b"),
        vec!["podlabel-app:a", "podlabel-app:b"]
    );
    assert_eq!(
        test.members("nestednslabel-team:x:y"),
        vec!["nslabel-team:x", "nslabel-team:y"]
    );

    test.remove_policy("ns-0", "nested");
    test.assert_sets_collected();
}

#[test]
fn combined_selectors_follow_cluster_info() {
    let mut test = TestConfig::from_cluster_info(ClusterInfo {
        combined_selectors_and: false,
        ..cluster_info()
    });
    test.add_policy(mk_policy(
        "ns-0",
        "combined",
        json!({
            "podSelector": {},
            "ingress": [{
                "from": [{
                    "namespaceSelector": { "matchLabels": { "team": "a" } },
                    "podSelector": { "matchLabels": { "app": "web" } },
                }],
            }],
        }),
    ));
    assert_eq!(test.rules(), vec!["ingress drop src=[] dst=[ns-ns-0]"]);

    let ops = test.index.write().set_cluster_info(cluster_info());
    test.sync(ops);
    assert_eq!(
        test.rules(),
        vec![
            "ingress allow src=[nslabel-team:a,podlabel-app:web] dst=[ns-ns-0]",
            "ingress drop src=[] dst=[ns-ns-0]",
        ]
    );
    assert!(test.index.read().cluster_info().combined_selectors_and);
}

/// Policies spread over two namespaces, some sharing a target selector.
fn policy_pool() -> Vec<(&'static str, &'static str, serde_json::Value)> {
    vec![
        ("ns-0", "a", allow_from("web")),
        ("ns-0", "b", allow_from("batch")),
        (
            "ns-0",
            "c",
            json!({
                "podSelector": { "matchLabels": { "app": "api" } },
                "policyTypes": ["Ingress", "Egress"],
            }),
        ),
        ("ns-0", "d", json!({ "podSelector": {}, "egress": [{ "to": [] }] })),
        (
            "ns-0",
            "e",
            json!({
                "podSelector": {},
                "ingress": [{
                    "from": [{ "ipBlock": { "cidr": "10.0.0.0/16", "except": ["10.0.1.0/24"] } }],
                }],
            }),
        ),
        ("ns-1", "a", allow_from("web")),
        (
            "ns-1",
            "f",
            json!({
                "podSelector": {},
                "ingress": [{ "from": [{ "namespaceSelector": { "matchLabels": { "team": "a" } } }] }],
            }),
        ),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any interleaving of adds and removes, once every policy is removed,
    /// leaves nothing behind. Every intermediate batch must be accepted by
    /// the dataplane model.
    #[test]
    fn merge_and_unmerge_in_any_order(
        events in prop::collection::vec((any::<bool>(), 0..policy_pool().len()), 0..24),
        removals in Just((0..policy_pool().len()).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let pool = policy_pool();
        let mut test = TestConfig::default();
        for (add, i) in events {
            let (ns, name, spec) = &pool[i];
            if add {
                test.add_policy(mk_policy(ns, name, spec.clone()));
            } else {
                test.remove_policy(ns, name);
            }
        }
        for i in removals {
            let (ns, name, _) = &pool[i];
            test.remove_policy(ns, name);
        }

        let index = test.index.read();
        prop_assert!(index.can_tear_down_shared_infra());
        prop_assert!(index.namespaces.by_ns.is_empty());
        prop_assert_eq!(index.set_count(), 1);
        drop(index);
        prop_assert!(!test.dataplane.is_bootstrapped());
        prop_assert!(test.rules().is_empty());
        prop_assert_eq!(test.dataplane.set_count(), 1);
    }
}
