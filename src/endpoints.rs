//! Endpoint projection (spec.md §4.2): flattens a raw `EndpointSlice` into
//! `Endpoint`s, honoring readiness and multi-port slices.

use k8s_openapi::api::discovery::v1::EndpointSlice;

pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// An (address, port) pair. Port `0` is the sentinel meaning "the slice
/// declared no port; the merger substitutes the route's declared port."
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    /// Stable `"{ip}:{port}"` identity used for set membership and diffing
    /// (spec.md §3).
    pub fn identity(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Extract the service name this slice belongs to, via the
/// `kubernetes.io/service-name` label. Slices without the label are not
/// associated with any service (spec.md §6).
pub fn service_name(slice: &EndpointSlice) -> Option<&str> {
    slice
        .metadata
        .labels
        .as_ref()?
        .get(SERVICE_NAME_LABEL)
        .map(String::as_str)
}

/// Project an `EndpointSlice` into its flat `Endpoint` sequence, per the
/// ordered rules in spec.md §4.2:
///
/// 1. Skip endpoints whose `conditions.ready` is explicitly `false`; a
///    missing `ready` is treated as ready.
/// 2. Collect the slice's declared, non-null ports; if none remain, use the
///    sentinel port list `{0}`.
/// 3. Emit one `Endpoint` per (surviving endpoint, address, port) triple.
pub fn project_endpoint_slice(slice: &EndpointSlice) -> Vec<Endpoint> {
    let mut ports: Vec<u16> = slice
        .ports
        .iter()
        .flatten()
        .filter_map(|p| p.port)
        .filter_map(|p| u16::try_from(p).ok())
        .collect();
    if ports.is_empty() {
        ports.push(0);
    }

    let mut endpoints = Vec::new();
    for endpoint in &slice.endpoints {
        let ready = endpoint
            .conditions
            .as_ref()
            .and_then(|c| c.ready)
            .unwrap_or(true);
        if !ready {
            continue;
        }
        for address in &endpoint.addresses {
            for &port in &ports {
                endpoints.push(Endpoint {
                    ip: address.clone(),
                    port,
                });
            }
        }
    }
    endpoints
}

/// Diff two endpoint observations into `(added, removed)` under the
/// `"ip:port"` identity (spec.md §4.6.3, §8).
pub fn diff(
    old: &[Endpoint],
    new: &[Endpoint],
) -> (Vec<Endpoint>, Vec<Endpoint>) {
    use std::collections::HashSet;

    let old_set: HashSet<&Endpoint> = old.iter().collect();
    let new_set: HashSet<&Endpoint> = new.iter().collect();

    let added = new_set
        .difference(&old_set)
        .map(|&e| e.clone())
        .collect();
    let removed = old_set
        .difference(&new_set)
        .map(|&e| e.clone())
        .collect();
    (added, removed)
}
