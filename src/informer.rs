//! Cluster-wide EndpointSlice informer (spec.md §4.6.1, §4.6.5): a
//! `kube::runtime::reflector` `Store` backs both the live edge-event stream
//! and the watch-set backfill query.
//!
//! Grounded on `mfadhlika-frp-operator`'s `reflector::store()` /
//! `reflector(writer, watcher(api, cfg))` wiring, adapted from its
//! `Controller::for_stream` consumption to the raw-event forwarding this
//! reconciler needs (see `SourceEvent` in `source/mod.rs` for the analogous
//! shape on the spec side).

use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::endpoints::{self, Endpoint};

/// Cluster-wide (spec.md §4.6.1: routes may reference foreign-namespace
/// services), hence `Api::all` rather than a namespaced API.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum EndpointEvent {
    /// A slice was applied; `service_key` is `"{namespace}/{service}"`,
    /// `None` when the slice carries no `kubernetes.io/service-name` label
    /// (spec.md §4.6.3: such slices are ignored entirely).
    Applied {
        service_key: Option<String>,
        endpoints: Vec<Endpoint>,
    },
    Deleted { service_key: Option<String> },
    Synced,
}

/// Wraps a `Store<EndpointSlice>` so the reconciler can query the cached
/// listing for backfill (spec.md §4.6.5) without re-threading the
/// `kube::Client` through every call site.
#[derive(Clone)]
pub struct EndpointInformer {
    store: Store<EndpointSlice>,
}

impl EndpointInformer {
    /// Build the reflector store and spawn both the edge-event forwarder
    /// and the 30-second periodic resync. Events are sent on `tx` until
    /// `cancel` fires.
    pub fn start(
        client: Client,
        tx: mpsc::UnboundedSender<EndpointEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let api: Api<EndpointSlice> = Api::all(client);
        let (reader, writer) = reflector::store();
        let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()));

        let informer = EndpointInformer {
            store: reader.clone(),
        };

        let forward_tx = tx.clone();
        let forward_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            loop {
                let next = tokio::select! {
                    item = stream.next() => item,
                    () = forward_cancel.cancelled() => return,
                };
                let Some(event) = next else { return };
                match event {
                    Ok(Event::Apply(slice) | Event::InitApply(slice)) => {
                        let service_key = service_key(&slice);
                        let endpoints = endpoints::project_endpoint_slice(&slice);
                        if forward_tx
                            .send(EndpointEvent::Applied { service_key, endpoints })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Event::Delete(slice)) => {
                        let service_key = service_key(&slice);
                        if forward_tx.send(EndpointEvent::Deleted { service_key }).is_err() {
                            return;
                        }
                    }
                    Ok(Event::InitDone) => {
                        if forward_tx.send(EndpointEvent::Synced).is_err() {
                            return;
                        }
                    }
                    Ok(Event::Init) => {}
                    Err(err) => {
                        tracing::warn!("EndpointSlice watch error: {err}");
                    }
                }
            }
        });
        tokio::spawn(periodic_resync(reader, tx, cancel));

        informer
    }

    /// Query the cached listing for every slice labeled with `service_name`
    /// in `namespace` — the backfill source for spec.md §4.6.5.
    pub fn endpoints_for_service(&self, namespace: &str, service_name: &str) -> Vec<Endpoint> {
        self.store
            .state()
            .iter()
            .filter(|slice| {
                slice.metadata.namespace.as_deref() == Some(namespace)
                    && endpoints::service_name(slice) == Some(service_name)
            })
            .flat_map(|slice| endpoints::project_endpoint_slice(slice))
            .collect()
    }
}

/// Implements the "30-second resync interval" spec.md names for the
/// EndpointSlice informer (§4.6.1) as a periodic full replay of the
/// reflector's cached state: every slice currently in `store` is
/// re-projected and re-sent as an `Applied` event, the same way a
/// client-go-style informer resync re-delivers every cached object as an
/// update. This self-heals `ServiceInventory` against any missed edge
/// event without restarting the underlying watch.
async fn periodic_resync(
    store: Store<EndpointSlice>,
    tx: mpsc::UnboundedSender<EndpointEvent>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(RESYNC_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for slice in store.state().iter() {
                    let service_key = service_key(slice);
                    let endpoints = endpoints::project_endpoint_slice(slice);
                    if tx
                        .send(EndpointEvent::Applied { service_key, endpoints })
                        .is_err()
                    {
                        return;
                    }
                }
            }
            () = cancel.cancelled() => return,
        }
    }
}

fn service_key(slice: &EndpointSlice) -> Option<String> {
    let service = endpoints::service_name(slice)?;
    let namespace = slice.metadata.namespace.as_deref()?;
    Some(crate::model::service_key(namespace, service))
}
