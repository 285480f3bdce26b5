//! Route merger (spec.md §4.3): the materialization algorithm that groups
//! `RouteRule`s by matching criteria and resolves weighted backends from
//! the live `ServiceInventory`.

use std::collections::{HashMap, HashSet};

use crate::endpoints::Endpoint;
use crate::model::{Backend, MaterializedRoute, RouteRule, ServiceRef, VHostSpec};

/// Mapping from service key (`"{namespace}/{service}"`) to the current set
/// of ready endpoints (spec.md §3). A key is present iff at least one
/// ready endpoint was observed and the key is in the current watch set.
pub type ServiceInventory = HashMap<String, HashSet<Endpoint>>;

/// Structural grouping key over the fields spec.md §4.3 defines as "the
/// same match criteria": `path_match`, `method`, `headers` (ordered),
/// `query_params` (ordered), `filters` (deep equality, via its canonical
/// JSON string), `priority`, `rule_index`. Rules sharing a key merge into
/// one `MaterializedRoute`.
#[derive(PartialEq, Eq, Hash)]
struct GroupKey {
    path_match: Option<crate::model::PathMatch>,
    method: Option<String>,
    headers: Vec<crate::model::HeaderMatch>,
    query_params: Vec<crate::model::QueryParamMatch>,
    filters_key: String,
    priority: i64,
    rule_index: i64,
}

impl GroupKey {
    fn from_rule(rule: &RouteRule) -> Self {
        GroupKey {
            path_match: rule.path_match.clone(),
            method: rule.method.clone(),
            headers: rule.headers.clone(),
            query_params: rule.query_params.clone(),
            filters_key: rule
                .filters
                .as_ref()
                .map(|f| f.canonical_key())
                .unwrap_or_default(),
            priority: rule.priority,
            rule_index: rule.rule_index,
        }
    }
}

/// Resolve one rule's candidate backends against the inventory (spec.md
/// §4.3): absent service key contributes nothing; a slice-sentinel port
/// (`0`) is replaced by the rule's declared port; a non-zero, differing
/// endpoint port is filtered out (multi-port service filtering).
fn resolve_rule_backends(rule: &RouteRule, inventory: &ServiceInventory) -> Vec<Backend> {
    let Some(endpoints) = inventory.get(&rule.service_key()) else {
        return Vec::new();
    };
    endpoints
        .iter()
        .filter_map(|endpoint| {
            let resolved_port = if endpoint.port == 0 {
                rule.port
            } else if rule.port != 0 && rule.port != endpoint.port {
                return None;
            } else {
                endpoint.port
            };
            Some(Backend {
                address: endpoint.ip.clone(),
                port: resolved_port,
                weight: rule.weight,
            })
        })
        .collect()
}

/// Merge a vhost's routes against the current inventory into its
/// `MaterializedRoute` sequence. Groups with identical match criteria are
/// combined (traffic splitting); every group is emitted even when its
/// resolved `backends` list is empty (spec.md §4.3). Output ordering is
/// unspecified (spec.md §4.3) — the proxy sorts by `priority`/`rule_index`.
pub fn merge_vhost(vhost: &VHostSpec, inventory: &ServiceInventory) -> Vec<MaterializedRoute> {
    let mut groups: HashMap<GroupKey, Vec<&RouteRule>> = HashMap::new();
    for rule in &vhost.routes {
        groups.entry(GroupKey::from_rule(rule)).or_default().push(rule);
    }

    groups
        .into_iter()
        .map(|(key, rules)| {
            let backends = rules
                .iter()
                .flat_map(|rule| resolve_rule_backends(rule, inventory))
                .collect();
            let filters = rules[0].filters.clone();
            MaterializedRoute {
                path_match: key.path_match,
                method: key.method,
                headers: key.headers,
                query_params: key.query_params,
                filters,
                priority: key.priority,
                rule_index: key.rule_index,
                backends,
            }
        })
        .collect()
}

/// Materialize a `ServiceRef` (a vhost's `default_route`, or the
/// top-level `default`) directly, with no grouping (spec.md §4.3).
pub fn merge_default_ref(service_ref: &ServiceRef, inventory: &ServiceInventory) -> Vec<Backend> {
    let Some(endpoints) = inventory.get(&service_ref.service_key()) else {
        return Vec::new();
    };
    endpoints
        .iter()
        .filter_map(|endpoint| {
            let resolved_port = if endpoint.port == 0 {
                service_ref.port
            } else if service_ref.port != 0 && service_ref.port != endpoint.port {
                return None;
            } else {
                endpoint.port
            };
            Some(Backend {
                address: endpoint.ip.clone(),
                port: resolved_port,
                weight: service_ref.weight,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HeaderMatch, MatchType, PathMatch, PathMatchType, RouteRule};

    fn endpoint(ip: &str, port: u16) -> Endpoint {
        Endpoint { ip: ip.to_string(), port }
    }

    fn basic_rule(service: &str, path: &str, priority: i64, weight: u32) -> RouteRule {
        RouteRule {
            path_match: Some(PathMatch {
                match_type: PathMatchType::PathPrefix,
                value: path.to_string(),
            }),
            method: None,
            headers: Vec::new(),
            query_params: Vec::new(),
            filters: None,
            service: service.to_string(),
            namespace: "default".to_string(),
            port: 8080,
            weight,
            priority,
            rule_index: 0,
        }
    }

    #[test]
    fn single_vhost_two_endpoints() {
        let vhost = VHostSpec {
            routes: vec![basic_rule("api", "/", 1, 100)],
            default_route: None,
        };
        let mut inventory = ServiceInventory::new();
        inventory.insert(
            "default/api".to_string(),
            HashSet::from([endpoint("10.0.0.1", 8080), endpoint("10.0.0.2", 8080)]),
        );
        let materialized = merge_vhost(&vhost, &inventory);
        assert_eq!(materialized.len(), 1);
        assert_eq!(materialized[0].backends.len(), 2);
        assert!(materialized[0].backends.iter().all(|b| b.weight == 100));
    }

    #[test]
    fn traffic_split_merges_into_one_route_with_four_backends() {
        let mut stable = basic_rule("app-stable", "/", 1010, 90);
        stable.rule_index = 0;
        let mut canary = basic_rule("app-canary", "/", 1010, 10);
        canary.rule_index = 0;
        let vhost = VHostSpec {
            routes: vec![stable, canary],
            default_route: None,
        };
        let mut inventory = ServiceInventory::new();
        inventory.insert(
            "default/app-stable".to_string(),
            HashSet::from([endpoint("10.0.0.1", 8080), endpoint("10.0.0.2", 8080)]),
        );
        inventory.insert(
            "default/app-canary".to_string(),
            HashSet::from([endpoint("10.0.1.1", 8080), endpoint("10.0.1.2", 8080)]),
        );
        let materialized = merge_vhost(&vhost, &inventory);
        assert_eq!(materialized.len(), 1);
        assert_eq!(materialized[0].backends.len(), 4);
        let weight_90 = materialized[0].backends.iter().filter(|b| b.weight == 90).count();
        let weight_10 = materialized[0].backends.iter().filter(|b| b.weight == 10).count();
        assert_eq!(weight_90, 2);
        assert_eq!(weight_10, 2);
    }

    #[test]
    fn distinct_paths_do_not_merge() {
        let v1 = basic_rule("api", "/v1/", 1, 100);
        let v2 = basic_rule("api", "/v2/", 1, 100);
        let vhost = VHostSpec {
            routes: vec![v1, v2],
            default_route: None,
        };
        let mut inventory = ServiceInventory::new();
        inventory.insert(
            "default/api".to_string(),
            HashSet::from([endpoint("10.0.0.1", 8080)]),
        );
        let materialized = merge_vhost(&vhost, &inventory);
        assert_eq!(materialized.len(), 2);
        for route in &materialized {
            assert_eq!(route.backends.len(), 1);
        }
    }

    #[test]
    fn differing_rule_index_does_not_merge() {
        let mut a = basic_rule("api", "/", 1, 100);
        a.rule_index = 0;
        let mut b = basic_rule("api", "/", 1, 100);
        b.rule_index = 1;
        let vhost = VHostSpec {
            routes: vec![a, b],
            default_route: None,
        };
        let materialized = merge_vhost(&vhost, &ServiceInventory::new());
        assert_eq!(materialized.len(), 2);
    }

    #[test]
    fn missing_endpoints_emits_route_with_empty_backends() {
        let vhost = VHostSpec {
            routes: vec![basic_rule("api", "/", 1, 100)],
            default_route: None,
        };
        let materialized = merge_vhost(&vhost, &ServiceInventory::new());
        assert_eq!(materialized.len(), 1);
        assert!(materialized[0].backends.is_empty());
    }

    #[test]
    fn multi_port_service_filters_to_matching_port() {
        let vhost = VHostSpec {
            routes: vec![basic_rule("api", "/", 1, 100)],
            default_route: None,
        };
        let mut inventory = ServiceInventory::new();
        inventory.insert(
            "default/api".to_string(),
            HashSet::from([
                endpoint("10.0.0.1", 8080),
                endpoint("10.0.0.1", 9090),
                endpoint("10.0.0.2", 8080),
            ]),
        );
        let materialized = merge_vhost(&vhost, &inventory);
        assert_eq!(materialized[0].backends.len(), 2);
        assert!(materialized[0].backends.iter().all(|b| b.port == 8080));
    }

    #[test]
    fn sentinel_zero_port_is_substituted_with_rule_port() {
        let vhost = VHostSpec {
            routes: vec![basic_rule("api", "/", 1, 100)],
            default_route: None,
        };
        let mut inventory = ServiceInventory::new();
        inventory.insert(
            "default/api".to_string(),
            HashSet::from([endpoint("10.0.0.1", 0)]),
        );
        let materialized = merge_vhost(&vhost, &inventory);
        assert_eq!(materialized[0].backends[0].port, 8080);
    }

    #[test]
    fn differing_headers_do_not_merge() {
        let mut a = basic_rule("api", "/", 1, 100);
        a.headers = vec![HeaderMatch {
            name: "x-env".into(),
            value: "prod".into(),
            match_type: MatchType::Exact,
        }];
        let b = basic_rule("api", "/", 1, 100);
        let vhost = VHostSpec {
            routes: vec![a, b],
            default_route: None,
        };
        let materialized = merge_vhost(&vhost, &ServiceInventory::new());
        assert_eq!(materialized.len(), 2);
    }

    #[test]
    fn weight_is_passed_through_verbatim_never_defaulted() {
        let vhost = VHostSpec {
            routes: vec![basic_rule("api", "/", 1, 0)],
            default_route: None,
        };
        let mut inventory = ServiceInventory::new();
        inventory.insert(
            "default/api".to_string(),
            HashSet::from([endpoint("10.0.0.1", 8080)]),
        );
        let materialized = merge_vhost(&vhost, &inventory);
        assert_eq!(materialized[0].backends[0].weight, 0);
    }
}
