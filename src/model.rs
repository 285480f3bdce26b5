//! Config codec and data model (spec.md §3, §4.1).
//!
//! `RoutingSpec` is the input (versioned, decoded from a ConfigMap key or a
//! file); `BackendFile` is the output written atomically for the proxy.

use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::err::ConfigError;

pub const ROUTING_SPEC_VERSION: i64 = 2;
pub const BACKEND_FILE_VERSION: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PathMatchType {
    Exact,
    PathPrefix,
    RegularExpression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum MatchType {
    Exact,
    RegularExpression,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathMatch {
    #[serde(rename = "type")]
    pub match_type: PathMatchType,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeaderMatch {
    pub name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub match_type: MatchType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryParamMatch {
    pub name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub match_type: MatchType,
}

/// A reference to a named service in the cluster, with a target port and a
/// traffic weight. Used both for `RouteRule`'s target fields and for
/// `VHostSpec::default_route` / `RoutingSpec::default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    pub service: String,
    pub namespace: String,
    pub port: u16,
    pub weight: u32,
}

impl ServiceRef {
    pub fn service_key(&self) -> String {
        service_key(&self.namespace, &self.service)
    }
}

pub fn service_key(namespace: &str, service: &str) -> String {
    format!("{namespace}/{service}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_match: Option<PathMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
    #[serde(default)]
    pub query_params: Vec<QueryParamMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FiltersValue>,
    pub service: String,
    pub namespace: String,
    pub port: u16,
    pub weight: u32,
    pub priority: i64,
    pub rule_index: i64,
}

impl RouteRule {
    pub fn service_key(&self) -> String {
        service_key(&self.namespace, &self.service)
    }
}

/// `filters` is opaque to the core (spec.md §3): it is round-tripped
/// verbatim and only ever compared for deep structural equality when
/// grouping routes. `serde_json::Value` already orders object keys via a
/// `BTreeMap` (the `preserve_order` feature is not enabled), so two
/// structurally-equal filter blocks always serialize to an identical
/// canonical string regardless of the order they were written in the
/// source document. That canonical string is what grouping hashes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FiltersValue(pub serde_json::Value);

impl FiltersValue {
    pub fn canonical_key(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VHostSpec {
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_route: Option<ServiceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSpec {
    pub version: i64,
    #[serde(default)]
    pub vhosts: HashMap<String, VHostSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ServiceRef>,
}

/// Mirrors `RoutingSpec`'s wire shape but collects `vhosts` as an
/// order-preserving sequence of entries rather than a `HashMap`, so a
/// document with a duplicate hostname key can still be detected: a
/// `HashMap`'s own `Deserialize` impl would silently keep only the last
/// occurrence, the same way `serde_json::Value` does, losing the
/// information needed to reject it (spec.md §3: "uniqueness within the map
/// is required").
#[derive(Deserialize)]
struct RawRoutingSpec {
    version: i64,
    #[serde(default)]
    vhosts: VHostEntries,
    #[serde(default)]
    default: Option<ServiceRef>,
}

#[derive(Default)]
struct VHostEntries(Vec<(String, VHostSpec)>);

impl<'de> Deserialize<'de> for VHostEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = VHostEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of vhost hostname to VHostSpec")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, VHostSpec>()? {
                    entries.push(entry);
                }
                Ok(VHostEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

impl RoutingSpec {
    /// Decode bytes into a `RoutingSpec`, rejecting anything other than
    /// `version == 2` (spec.md §3, §4.1) or a duplicate vhost hostname.
    /// Also validates that every `RegularExpression` pattern in the
    /// document compiles.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        let raw: RawRoutingSpec = serde_json::from_slice(bytes)?;
        if raw.version != ROUTING_SPEC_VERSION {
            return Err(ConfigError::UnsupportedVersion(raw.version));
        }

        let mut vhosts = HashMap::with_capacity(raw.vhosts.0.len());
        for (hostname, vhost) in raw.vhosts.0 {
            if vhosts.insert(hostname.clone(), vhost).is_some() {
                return Err(ConfigError::DuplicateHostname(hostname));
            }
        }

        let spec = RoutingSpec {
            version: raw.version,
            vhosts,
            default: raw.default,
        };
        spec.validate_patterns()?;
        Ok(spec)
    }

    fn validate_patterns(&self) -> Result<(), ConfigError> {
        for vhost in self.vhosts.values() {
            for route in &vhost.routes {
                if let Some(path_match) = &route.path_match
                    && path_match.match_type == PathMatchType::RegularExpression
                {
                    compile_pattern(&path_match.value)?;
                }
                for header in &route.headers {
                    if header.match_type == MatchType::RegularExpression {
                        compile_pattern(&header.value)?;
                    }
                }
                for query_param in &route.query_params {
                    if query_param.match_type == MatchType::RegularExpression {
                        compile_pattern(&query_param.value)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The set of service keys ("{namespace}/{service}") referenced
    /// anywhere in this spec, including `default_route`s and the
    /// top-level `default` (spec.md §4.6.2 step 2).
    pub fn watch_set(&self) -> std::collections::HashSet<String> {
        let mut keys = std::collections::HashSet::new();
        for vhost in self.vhosts.values() {
            for route in &vhost.routes {
                keys.insert(route.service_key());
            }
            if let Some(default_route) = &vhost.default_route {
                keys.insert(default_route.service_key());
            }
        }
        if let Some(default) = &self.default {
            keys.insert(default.service_key());
        }
        keys
    }
}

fn compile_pattern(pattern: &str) -> Result<(), ConfigError> {
    regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub address: String,
    pub port: u16,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_match: Option<PathMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
    #[serde(default)]
    pub query_params: Vec<QueryParamMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FiltersValue>,
    pub priority: i64,
    pub rule_index: i64,
    /// Never serialized as `null`; empty is the explicit "500 for matching
    /// requests" signal (spec.md §4.3).
    pub backends: Vec<Backend>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VHostBackendFile {
    #[serde(default)]
    pub routes: Vec<MaterializedRoute>,
    #[serde(default)]
    pub default_backends: Vec<Backend>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultBackends {
    #[serde(default)]
    pub backends: Vec<Backend>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendFile {
    pub version: i64,
    pub vhosts: HashMap<String, VHostBackendFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultBackends>,
}

impl BackendFile {
    pub fn new() -> Self {
        BackendFile {
            version: BACKEND_FILE_VERSION,
            vhosts: HashMap::new(),
            default: None,
        }
    }

    /// Encode to indented JSON. Empty sequences are emitted as `[]`, never
    /// `null` (spec.md §4.1) because `routes`/`default_backends`/`backends`
    /// are plain `Vec`s, not `Option<Vec<_>>`.
    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

impl Default for BackendFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sample_spec(version: i64) -> serde_json::Value {
        serde_json::json!({
            "version": version,
            "vhosts": {
                "api.example.com": {
                    "routes": [{
                        "path_match": {"type": "PathPrefix", "value": "/"},
                        "service": "api",
                        "namespace": "default",
                        "port": 8080,
                        "weight": 100,
                        "priority": 1,
                        "rule_index": 0
                    }]
                }
            }
        })
    }

    #[test]
    fn decodes_version_2() {
        let bytes = serde_json::to_vec(&sample_spec(2)).unwrap();
        let spec = RoutingSpec::decode(&bytes).unwrap();
        assert_eq!(spec.version, 2);
        assert_eq!(spec.vhosts.len(), 1);
    }

    #[test]
    fn rejects_version_1() {
        let bytes = serde_json::to_vec(&sample_spec(1)).unwrap();
        let err = RoutingSpec::decode(&bytes).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(1)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = RoutingSpec::decode(b"{not json").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedJson(_)));
    }

    #[test]
    fn rejects_duplicate_vhost_hostname() {
        // serde_json::Value (and a plain HashMap) would silently keep only
        // the last "api.example.com" entry, so this is built as a raw JSON
        // string rather than via `sample_spec`/`json!`.
        let bytes = br#"{
            "version": 2,
            "vhosts": {
                "api.example.com": {"routes": []},
                "api.example.com": {"routes": []}
            }
        }"#;
        let err = RoutingSpec::decode(bytes).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateHostname(h) if h == "api.example.com"));
    }

    #[test]
    fn rejects_invalid_regex_pattern() {
        let mut spec = sample_spec(2);
        spec["vhosts"]["api.example.com"]["routes"][0]["path_match"] = serde_json::json!({
            "type": "RegularExpression",
            "value": "(unterminated"
        });
        let bytes = serde_json::to_vec(&spec).unwrap();
        let err = RoutingSpec::decode(&bytes).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRegex { .. }));
    }

    #[test]
    fn watch_set_includes_routes_default_route_and_top_level_default() {
        let mut spec = sample_spec(2);
        spec["vhosts"]["api.example.com"]["default_route"] = serde_json::json!({
            "service": "fallback",
            "namespace": "default",
            "port": 9090,
            "weight": 100
        });
        spec["default"] = serde_json::json!({
            "service": "edge",
            "namespace": "infra",
            "port": 80,
            "weight": 100
        });
        let bytes = serde_json::to_vec(&spec).unwrap();
        let parsed = RoutingSpec::decode(&bytes).unwrap();
        let watch_set = parsed.watch_set();
        assert!(watch_set.contains("default/api"));
        assert!(watch_set.contains("default/fallback"));
        assert!(watch_set.contains("infra/edge"));
        assert_eq!(watch_set.len(), 3);
    }

    #[rstest]
    #[case(Vec::new())]
    #[case(vec![Backend { address: "10.0.0.1".into(), port: 8080, weight: 100 }])]
    fn backend_file_arrays_never_serialize_as_null(#[case] backends: Vec<Backend>) {
        let mut file = BackendFile::new();
        file.vhosts.insert(
            "api.example.com".into(),
            VHostBackendFile {
                routes: vec![MaterializedRoute {
                    path_match: None,
                    method: None,
                    headers: Vec::new(),
                    query_params: Vec::new(),
                    filters: None,
                    priority: 1,
                    rule_index: 0,
                    backends,
                }],
                default_backends: Vec::new(),
            },
        );
        let encoded = file.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        let routes = &value["vhosts"]["api.example.com"]["routes"][0];
        assert!(routes["backends"].is_array());
        let default_backends = &value["vhosts"]["api.example.com"]["default_backends"];
        assert!(default_backends.is_array());
        assert_eq!(default_backends.as_array().unwrap().len(), 0);
    }
}
