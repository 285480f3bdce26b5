//! Reconciler state machine (spec.md §4.6): owns the routing-spec source,
//! the cluster-wide endpoint informer, the initial-sync barrier, dedup,
//! retry-with-backoff, and fatal-error propagation.
//!
//! Lock choice (`parking_lot::RwLock` behind one `Arc`) is grounded on the
//! ghost VMOD's `GhostDirector`, which guards its routing table the same
//! way. The event loop funnels both sources' edge events onto the single
//! task that owns the write side of that lock, so "acquire lock, decide,
//! release, then do I/O" (§4.6.7) is enforced by construction.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::args::{ReconcilerArgs, SourceKind};
use crate::dispatcher::ReloadDispatcher;
use crate::endpoints::{diff, Endpoint};
use crate::err::{ConfigError, ReconcilerError, ReconcilerResult};
use crate::informer::{EndpointEvent, EndpointInformer};
use crate::merger::{self, ServiceInventory};
use crate::model::{BackendFile, DefaultBackends, RoutingSpec, VHostBackendFile};
use crate::source::configmap::ConfigMapSource;
use crate::source::file::FileSource;
use crate::source::{SourceEvent, SpecSource};
use crate::writer::write_backend_file;

const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

#[derive(Default)]
struct ReconcilerState {
    routing_spec: Option<Arc<RoutingSpec>>,
    inventory: ServiceInventory,
    watch_set: HashSet<String>,
    initial_sync_done: bool,
    last_resource_version: Option<String>,
    last_payload: Option<Vec<u8>>,
}

enum SpecApplyOutcome {
    Deduped,
    Rejected(ConfigError),
    Applied { added_watch_keys: Vec<String> },
}

impl ReconcilerState {
    /// Dedup + parse + apply a spec update in place (spec.md §4.6.3). Does
    /// not perform backfill — the caller queries the endpoint informer for
    /// `added_watch_keys` once the lock is released.
    fn dedup_and_apply_spec(&mut self, raw: Vec<u8>, resource_version: Option<String>) -> SpecApplyOutcome {
        if resource_version.is_some() && resource_version == self.last_resource_version {
            return SpecApplyOutcome::Deduped;
        }
        if self.last_payload.as_deref() == Some(raw.as_slice()) {
            self.last_resource_version = resource_version;
            return SpecApplyOutcome::Deduped;
        }
        let spec = match RoutingSpec::decode(&raw) {
            Ok(spec) => spec,
            Err(err) => return SpecApplyOutcome::Rejected(err),
        };
        let new_watch_set = spec.watch_set();
        let added_watch_keys = new_watch_set
            .difference(&self.watch_set)
            .cloned()
            .collect();
        prune_to_watch_set(&mut self.inventory, &new_watch_set);
        self.watch_set = new_watch_set;
        self.routing_spec = Some(Arc::new(spec));
        self.last_resource_version = resource_version;
        self.last_payload = Some(raw);
        SpecApplyOutcome::Applied { added_watch_keys }
    }

    fn backfill(&mut self, key: &str, endpoints: Vec<Endpoint>) {
        if !endpoints.is_empty() {
            self.inventory.insert(key.to_string(), endpoints.into_iter().collect());
        }
    }

    /// EndpointSlice add/update (spec.md §4.6.3). Returns whether the
    /// inventory actually changed.
    fn apply_endpoint_applied(&mut self, service_key: Option<String>, endpoints: Vec<Endpoint>) -> bool {
        let Some(key) = service_key else { return false };
        if !self.watch_set.contains(&key) {
            return false;
        }
        let old: Vec<Endpoint> = self
            .inventory
            .get(&key)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();
        let (added, removed) = diff(&old, &endpoints);
        if added.is_empty() && removed.is_empty() {
            return false;
        }
        if endpoints.is_empty() {
            self.inventory.remove(&key);
        } else {
            self.inventory.insert(key, endpoints.into_iter().collect());
        }
        true
    }

    /// EndpointSlice delete (spec.md §4.6.3).
    fn apply_endpoint_deleted(&mut self, service_key: Option<String>) -> bool {
        let Some(key) = service_key else { return false };
        self.inventory.remove(&key).is_some()
    }
}

/// `inventory` entries are present iff their key is still in `watch_set`
/// (spec.md §3 invariant); a spec reload prunes the rest.
fn prune_to_watch_set(inventory: &mut ServiceInventory, watch_set: &HashSet<String>) {
    inventory.retain(|key, _| watch_set.contains(key));
}

/// Reload is gated on the initial-sync barrier (spec.md §4.6.4): no reload
/// fires from event handlers until the barrier has lifted, independent of
/// whether the event itself changed state.
fn should_dispatch(barrier_lifted: bool, state_changed: bool) -> bool {
    barrier_lifted && state_changed
}

fn build_backend_file(spec: &RoutingSpec, inventory: &ServiceInventory) -> BackendFile {
    let mut file = BackendFile::new();
    for (hostname, vhost) in &spec.vhosts {
        let routes = merger::merge_vhost(vhost, inventory);
        let default_backends = vhost
            .default_route
            .as_ref()
            .map(|service_ref| merger::merge_default_ref(service_ref, inventory))
            .unwrap_or_default();
        file.vhosts
            .insert(hostname.clone(), VHostBackendFile { routes, default_backends });
    }
    file.default = spec.default.as_ref().map(|service_ref| DefaultBackends {
        backends: merger::merge_default_ref(service_ref, inventory),
    });
    file
}

/// The materialize+write+dispatch pipeline (spec.md §4.6.7), cloneable so
/// the retry wrapper can run as its own task without borrowing the
/// reconciler.
#[derive(Clone)]
struct ReconcileContext {
    state: Arc<RwLock<ReconcilerState>>,
    dispatcher: ReloadDispatcher,
    output_path: PathBuf,
    proxy_addr: String,
}

impl ReconcileContext {
    /// Snapshot the spec pointer and inventory under the lock, release it,
    /// then merge/encode/write/dispatch outside the lock (spec.md §4.6.7).
    async fn materialize_write_and_dispatch(&self, cancel: &CancellationToken) -> ReconcilerResult<()> {
        let (spec, inventory) = {
            let state = self.state.read();
            let spec = state
                .routing_spec
                .clone()
                .expect("routing spec is populated before any dispatch is scheduled");
            (spec, state.inventory.clone())
        };
        let backend_file = build_backend_file(&spec, &inventory);
        write_backend_file(&self.output_path, &backend_file)?;
        self.dispatcher.dispatch(&self.proxy_addr, cancel).await?;
        Ok(())
    }

    fn spawn_retry(&self, cancel: CancellationToken, fatal_tx: mpsc::Sender<ReconcilerError>) {
        let ctx = self.clone();
        tokio::spawn(async move { ctx.dispatch_with_retry(cancel, fatal_tx).await });
    }

    /// Fixed backoff {500ms, 1s, 2s}; four total attempts before giving up
    /// and sending on the fatal channel (spec.md §4.6.6).
    async fn dispatch_with_retry(&self, cancel: CancellationToken, fatal_tx: mpsc::Sender<ReconcilerError>) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.materialize_write_and_dispatch(&cancel).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(attempts, "reload attempt failed: {err}");
                    if attempts as usize > RETRY_BACKOFF.len() {
                        tracing::error!("reload retries exhausted, escalating as fatal");
                        let _ = fatal_tx.try_send(ReconcilerError::RetriesExhausted);
                        return;
                    }
                    let backoff = RETRY_BACKOFF[(attempts - 1) as usize];
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        () = cancel.cancelled() => return,
                    }
                }
            }
        }
    }
}

pub struct Reconciler {
    client: Client,
    args: ReconcilerArgs,
    ctx: ReconcileContext,
    ready_tx: Option<oneshot::Sender<()>>,
}

impl Reconciler {
    /// Builds the reconciler and a receiver that resolves exactly once,
    /// after the first successful reload (spec.md §4.6.2 step 7). External
    /// callers (e.g. a readiness probe) hold the receiver; the reconciler
    /// holds the sender.
    pub fn new(client: Client, args: ReconcilerArgs) -> (Self, oneshot::Receiver<()>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let ctx = ReconcileContext {
            state: Arc::new(RwLock::new(ReconcilerState::default())),
            dispatcher: ReloadDispatcher::new(),
            output_path: args.output_path.clone(),
            proxy_addr: args.proxy_addr.clone(),
        };
        (
            Reconciler {
                client,
                args,
                ctx,
                ready_tx: Some(ready_tx),
            },
            ready_rx,
        )
    }

    fn build_source(&self) -> Result<SpecSource, ConfigError> {
        match self.args.source_kind {
            SourceKind::Configmap => {
                let name = self
                    .args
                    .configmap_name
                    .clone()
                    .ok_or(ConfigError::MissingField("configmap_name"))?;
                Ok(SpecSource::ConfigMap(ConfigMapSource::new(
                    self.client.clone(),
                    self.args.configmap_namespace.clone(),
                    name,
                )))
            }
            SourceKind::File => {
                let path = self
                    .args
                    .spec_file_path
                    .clone()
                    .ok_or(ConfigError::MissingField("spec_file_path"))?;
                Ok(SpecSource::File(FileSource::new(path)))
            }
        }
    }

    fn apply_spec_update(
        &self,
        raw: Vec<u8>,
        resource_version: Option<String>,
        informer: &EndpointInformer,
    ) -> bool {
        let outcome = self.ctx.state.write().dedup_and_apply_spec(raw, resource_version);
        match outcome {
            SpecApplyOutcome::Deduped => {
                tracing::debug!("spec update deduped");
                false
            }
            SpecApplyOutcome::Rejected(err) => {
                tracing::warn!("rejected spec update, keeping the previous spec: {err}");
                false
            }
            SpecApplyOutcome::Applied { added_watch_keys } => {
                for key in added_watch_keys {
                    if let Some((namespace, service)) = key.split_once('/') {
                        let endpoints = informer.endpoints_for_service(namespace, service);
                        self.ctx.state.write().backfill(&key, endpoints);
                    }
                }
                true
            }
        }
    }

    fn apply_endpoint_applied(&self, service_key: Option<String>, endpoints: Vec<Endpoint>) -> bool {
        self.ctx.state.write().apply_endpoint_applied(service_key, endpoints)
    }

    fn apply_endpoint_deleted(&self, service_key: Option<String>) -> bool {
        self.ctx.state.write().apply_endpoint_deleted(service_key)
    }

    /// Runs the startup sequence (spec.md §4.6.2) then services spec and
    /// endpoint events until `cancel` fires or a fatal error occurs.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        proxy_ready: Option<oneshot::Receiver<()>>,
    ) -> ReconcilerResult<()> {
        // Step 1.
        if let Some(rx) = proxy_ready {
            tokio::select! {
                _ = rx => {}
                () = cancel.cancelled() => return Err(ReconcilerError::Cancelled),
            }
        }

        // Step 2: eager fetch, populate watch set, before informers start.
        let source = self.build_source()?;
        let raw = source.initial_get().await?;
        let spec = RoutingSpec::decode(&raw)?;
        let watch_set = spec.watch_set();
        {
            let mut state = self.ctx.state.write();
            state.routing_spec = Some(Arc::new(spec));
            state.watch_set = watch_set;
            state.last_payload = Some(raw);
        }

        // Step 3: start both informers.
        let (spec_tx, mut spec_rx) = mpsc::unbounded_channel();
        source.spawn(spec_tx, cancel.clone());

        let (endpoint_tx, mut endpoint_rx) = mpsc::unbounded_channel();
        let informer = EndpointInformer::start(self.client.clone(), endpoint_tx, cancel.clone());

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ReconcilerError>(1);

        let mut spec_synced = false;
        let mut endpoint_synced = false;
        let mut barrier_lifted = false;

        loop {
            // Steps 4-7: once both informer caches are synced, perform the
            // one-time consolidated reload and open the ready gate.
            if !barrier_lifted && spec_synced && endpoint_synced {
                {
                    let mut state = self.ctx.state.write();
                    state.initial_sync_done = true;
                    let backend_count: usize = state.inventory.values().map(HashSet::len).sum();
                    tracing::info!(
                        service_count = state.inventory.len(),
                        backend_count,
                        "initial sync complete"
                    );
                }
                self.ctx
                    .materialize_write_and_dispatch(&cancel)
                    .await
                    .map_err(|err| ReconcilerError::InitialReloadFailed(Box::new(err)))?;
                if let Some(ready_tx) = self.ready_tx.take() {
                    let _ = ready_tx.send(());
                }
                barrier_lifted = true;
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(ReconcilerError::Cancelled),
                Some(err) = fatal_rx.recv() => return Err(err),
                spec_event = spec_rx.recv() => {
                    match spec_event {
                        Some(SourceEvent::Synced) => spec_synced = true,
                        Some(SourceEvent::Updated { raw, resource_version }) => {
                            let changed = self.apply_spec_update(raw, resource_version, &informer);
                            if should_dispatch(barrier_lifted, changed) {
                                self.ctx.spawn_retry(cancel.clone(), fatal_tx.clone());
                            }
                        }
                        Some(SourceEvent::Deleted) => return Err(ReconcilerError::SourceGone),
                        None => return Err(ReconcilerError::SourceGone),
                    }
                }
                endpoint_event = endpoint_rx.recv() => {
                    match endpoint_event {
                        Some(EndpointEvent::Synced) => endpoint_synced = true,
                        Some(EndpointEvent::Applied { service_key, endpoints }) => {
                            let changed = self.apply_endpoint_applied(service_key, endpoints);
                            if should_dispatch(barrier_lifted, changed) {
                                self.ctx.spawn_retry(cancel.clone(), fatal_tx.clone());
                            }
                        }
                        Some(EndpointEvent::Deleted { service_key }) => {
                            let changed = self.apply_endpoint_deleted(service_key);
                            if should_dispatch(barrier_lifted, changed) {
                                self.ctx.spawn_retry(cancel.clone(), fatal_tx.clone());
                            }
                        }
                        None => return Err(ReconcilerError::SourceGone),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(ip: &str, port: u16) -> Endpoint {
        Endpoint { ip: ip.to_string(), port }
    }

    fn sample_spec_bytes(service: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "version": 2,
            "vhosts": {
                "api.example.com": {
                    "routes": [{
                        "path_match": {"type": "PathPrefix", "value": "/"},
                        "service": service,
                        "namespace": "default",
                        "port": 8080,
                        "weight": 100,
                        "priority": 1,
                        "rule_index": 0
                    }]
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn initial_sync_barrier_never_dispatches_before_lifted() {
        assert!(!should_dispatch(false, true));
        assert!(!should_dispatch(false, false));
        assert!(should_dispatch(true, true));
        assert!(!should_dispatch(true, false));
    }

    #[test]
    fn watch_set_pruning_drops_stale_services() {
        let mut inventory = ServiceInventory::new();
        inventory.insert("default/api".into(), HashSet::from([endpoint("10.0.0.1", 80)]));
        inventory.insert("default/stale".into(), HashSet::from([endpoint("10.0.0.2", 80)]));
        let watch_set = HashSet::from(["default/api".to_string()]);
        prune_to_watch_set(&mut inventory, &watch_set);
        assert!(inventory.contains_key("default/api"));
        assert!(!inventory.contains_key("default/stale"));
    }

    #[test]
    fn spec_update_deduped_by_resource_version() {
        let mut state = ReconcilerState::default();
        state.last_resource_version = Some("42".to_string());
        let outcome = state.dedup_and_apply_spec(sample_spec_bytes("api"), Some("42".to_string()));
        assert!(matches!(outcome, SpecApplyOutcome::Deduped));
    }

    #[test]
    fn spec_update_deduped_by_payload_equality() {
        let raw = sample_spec_bytes("api");
        let mut state = ReconcilerState::default();
        state.last_payload = Some(raw.clone());
        let outcome = state.dedup_and_apply_spec(raw, None);
        assert!(matches!(outcome, SpecApplyOutcome::Deduped));
    }

    #[test]
    fn invalid_spec_update_is_rejected_without_clearing_current_spec() {
        let mut state = ReconcilerState::default();
        state.last_payload = Some(sample_spec_bytes("api"));

        let outcome = state.dedup_and_apply_spec(b"not json".to_vec(), None);
        assert!(matches!(outcome, SpecApplyOutcome::Rejected(ConfigError::MalformedJson(_))));
        assert_eq!(state.last_payload.as_deref(), Some(sample_spec_bytes("api").as_slice()));
    }

    #[test]
    fn spec_update_growing_watch_set_reports_added_keys() {
        let mut state = ReconcilerState::default();
        state.watch_set = HashSet::from(["default/api".to_string()]);
        let outcome = state.dedup_and_apply_spec(sample_spec_bytes("new-service"), None);
        match outcome {
            SpecApplyOutcome::Applied { added_watch_keys } => {
                assert_eq!(added_watch_keys, vec!["default/new-service".to_string()]);
            }
            _ => panic!("expected Applied"),
        }
    }

    #[test]
    fn endpoint_applied_ignored_when_service_key_not_watched() {
        let mut state = ReconcilerState::default();
        let changed = state.apply_endpoint_applied(
            Some("default/unwatched".to_string()),
            vec![endpoint("10.0.0.1", 80)],
        );
        assert!(!changed);
        assert!(state.inventory.is_empty());
    }

    #[test]
    fn endpoint_applied_noop_diff_reports_no_change() {
        let mut state = ReconcilerState::default();
        state.watch_set.insert("default/api".to_string());
        state.inventory.insert("default/api".to_string(), HashSet::from([endpoint("10.0.0.1", 80)]));
        let changed = state.apply_endpoint_applied(
            Some("default/api".to_string()),
            vec![endpoint("10.0.0.1", 80)],
        );
        assert!(!changed);
    }

    #[test]
    fn endpoint_applied_with_empty_list_removes_entry() {
        let mut state = ReconcilerState::default();
        state.watch_set.insert("default/api".to_string());
        state.inventory.insert("default/api".to_string(), HashSet::from([endpoint("10.0.0.1", 80)]));
        let changed = state.apply_endpoint_applied(Some("default/api".to_string()), Vec::new());
        assert!(changed);
        assert!(!state.inventory.contains_key("default/api"));
    }

    #[test]
    fn endpoint_deleted_on_absent_key_is_a_noop() {
        let mut state = ReconcilerState::default();
        assert!(!state.apply_endpoint_deleted(Some("default/api".to_string())));
    }

    #[test]
    fn endpoint_deleted_removes_existing_entry() {
        let mut state = ReconcilerState::default();
        state.inventory.insert("default/api".to_string(), HashSet::from([endpoint("10.0.0.1", 80)]));
        assert!(state.apply_endpoint_deleted(Some("default/api".to_string())));
        assert!(state.inventory.is_empty());
    }
}
