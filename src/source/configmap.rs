//! ConfigMap routing-spec source (spec.md §4.6.1, §6): reads `routing.json`
//! from a named ConfigMap in the reconciler's namespace via a
//! namespace-scoped informer.

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SourceEvent;
use crate::err::SourceError;

pub const ROUTING_SPEC_KEY: &str = "routing.json";

#[derive(Clone)]
pub struct ConfigMapSource {
    client: Client,
    namespace: String,
    name: String,
}

impl ConfigMapSource {
    pub fn new(client: Client, namespace: String, name: String) -> Self {
        ConfigMapSource {
            client,
            namespace,
            name,
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub async fn initial_get(&self) -> Result<Vec<u8>, SourceError> {
        let cm = self.api().get(&self.name).await?;
        extract_payload(&cm)
    }

    pub fn spawn(self, tx: mpsc::UnboundedSender<SourceEvent>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let config =
                watcher::Config::default().fields(&format!("metadata.name={}", self.name));
            let mut stream = Box::pin(watcher::watcher(self.api(), config));

            loop {
                let next = tokio::select! {
                    item = stream.next() => item,
                    () = cancel.cancelled() => return,
                };
                let Some(event) = next else { return };
                match event {
                    Ok(Event::Apply(cm) | Event::InitApply(cm)) => {
                        if cm.name_any() != self.name {
                            continue;
                        }
                        match extract_payload(&cm) {
                            Ok(raw) => {
                                let resource_version = cm.resource_version();
                                if tx
                                    .send(SourceEvent::Updated {
                                        raw,
                                        resource_version,
                                    })
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Err(err) => {
                                tracing::warn!("failed reading ConfigMap payload: {err}");
                            }
                        }
                    }
                    Ok(Event::Delete(cm)) => {
                        if cm.name_any() == self.name {
                            let _ = tx.send(SourceEvent::Deleted);
                        }
                    }
                    Ok(Event::InitDone) => {
                        let _ = tx.send(SourceEvent::Synced);
                    }
                    Ok(Event::Init) => {}
                    Err(err) => {
                        tracing::warn!("ConfigMap watch error: {err}");
                    }
                }
            }
        });
    }
}

fn extract_payload(cm: &ConfigMap) -> Result<Vec<u8>, SourceError> {
    cm.data
        .as_ref()
        .and_then(|data| data.get(ROUTING_SPEC_KEY))
        .map(|s| s.as_bytes().to_vec())
        .ok_or_else(|| SourceError::MissingKey(cm.name_any()))
}
