//! List-then-watch mirror of a set of cluster objects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::sync::watch;

use super::client::{KubeClient, ResourceKind};
use crate::config::format_error_chain;

/// `(namespace, name)`
pub type ObjectKey = (String, String);

type Store = HashMap<ObjectKey, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark(Value),
    Error(Value),
    Unknown(String),
}

#[derive(serde::Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: Value,
}

impl WatchEvent {
    pub fn parse(line: &[u8]) -> anyhow::Result<Self> {
        let raw: RawEvent = serde_json::from_slice(line).context("decode watch event")?;
        Ok(match raw.kind.as_str() {
            "ADDED" => WatchEvent::Added(raw.object),
            "MODIFIED" => WatchEvent::Modified(raw.object),
            "DELETED" => WatchEvent::Deleted(raw.object),
            "BOOKMARK" => WatchEvent::Bookmark(raw.object),
            "ERROR" => WatchEvent::Error(raw.object),
            _ => WatchEvent::Unknown(raw.kind),
        })
    }
}

/// Event sequences the API server should never produce. Any of these means
/// the local mirror has diverged and must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    #[error("{event} event for an object without metadata.name")]
    MissingName { event: &'static str },
    #[error("duplicate ADDED for {namespace}/{name}")]
    DuplicateAdded { namespace: String, name: String },
    #[error("{event} for unknown object {namespace}/{name}")]
    UnknownObject {
        event: &'static str,
        namespace: String,
        name: String,
    },
}

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// The watch reported an error or something unrecognised; resync.
    Restart,
}

pub fn object_key(obj: &Value) -> Option<ObjectKey> {
    let meta = obj.get("metadata")?;
    let name = meta.get("name")?.as_str()?;
    let namespace = meta
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some((namespace.to_string(), name.to_string()))
}

/// Applies `event` to `store`, rejecting duplicate adds and changes to unknown
/// objects. `store` is left untouched on error.
pub fn apply_event(store: &mut Store, event: WatchEvent) -> Result<Applied, WatchError> {
    let (label, obj) = match event {
        WatchEvent::Added(obj) => ("ADDED", obj),
        WatchEvent::Modified(obj) => ("MODIFIED", obj),
        WatchEvent::Deleted(obj) => ("DELETED", obj),
        WatchEvent::Bookmark(_) => return Ok(Applied::Unchanged),
        WatchEvent::Error(_) | WatchEvent::Unknown(_) => return Ok(Applied::Restart),
    };
    let key = object_key(&obj).ok_or(WatchError::MissingName { event: label })?;

    match label {
        "ADDED" => {
            if store.contains_key(&key) {
                return Err(WatchError::DuplicateAdded {
                    namespace: key.0,
                    name: key.1,
                });
            }
            store.insert(key, obj);
        }
        _ => {
            if !store.contains_key(&key) {
                return Err(WatchError::UnknownObject {
                    event: label,
                    namespace: key.0,
                    name: key.1,
                });
            }
            if label == "DELETED" {
                store.remove(&key);
            } else {
                store.insert(key, obj);
            }
        }
    }
    Ok(Applied::Changed)
}

/// `true` once a Deployment reports at least one available replica.
const RESYNC_MIN: Duration = Duration::from_millis(500);
const RESYNC_MAX: Duration = Duration::from_secs(30);
/// A watch that stayed up this long ended normally, not in a failure loop.
const HEALTHY_CYCLE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct ResyncBackoff {
    current: Duration,
}

impl Default for ResyncBackoff {
    fn default() -> Self {
        Self { current: RESYNC_MIN }
    }
}

impl ResyncBackoff {
    fn next_delay(&mut self, lasted: Duration, failed: bool) -> Duration {
        if !failed && lasted >= HEALTHY_CYCLE {
            self.current = RESYNC_MIN;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(RESYNC_MAX);
        delay
    }
}

pub fn deployment_available(obj: &Value) -> bool {
    obj["status"]["availableReplicas"].as_u64().unwrap_or(0) >= 1
}

/// Keeps an in-memory copy of every object of one kind matching a label selector.
pub struct Reflector {
    kind: ResourceKind,
    label_selector: String,
    state: watch::Sender<Arc<Store>>,
}

impl Reflector {
    pub fn new(kind: ResourceKind, label_selector: impl Into<String>) -> Self {
        let (state, _) = watch::channel(Arc::new(Store::new()));
        Self {
            kind,
            label_selector: label_selector.into(),
            state,
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .borrow()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn snapshot(&self) -> Arc<Store> {
        self.state.borrow().clone()
    }

    /// Waits until the object exists and satisfies `pred`. `false` on timeout.
    pub async fn wait_until(
        &self,
        namespace: &str,
        name: &str,
        pred: impl Fn(&Value) -> bool,
        timeout: Duration,
    ) -> bool {
        let key = (namespace.to_string(), name.to_string());
        let mut rx = self.state.subscribe();
        let ready = rx.wait_for(|store| store.get(&key).is_some_and(&pred));
        matches!(tokio::time::timeout(timeout, ready).await, Ok(Ok(_)))
    }

    /// Resync-then-watch forever. Every cycle end waits out a backoff, so a
    /// watch that keeps failing or closing fast cannot spin list calls.
    pub async fn run(self: Arc<Self>, client: KubeClient) {
        let mut backoff = ResyncBackoff::default();
        loop {
            let started = tokio::time::Instant::now();
            let result = self.sync_once(&client).await;
            let lasted = started.elapsed();
            match &result {
                Ok(()) => tracing::debug!(kind = self.kind.as_str(), "watch closed; resyncing"),
                Err(e) => tracing::warn!(
                    kind = self.kind.as_str(),
                    error = %format_error_chain(e),
                    "reflector sync failed"
                ),
            }
            tokio::time::sleep(backoff.next_delay(lasted, result.is_err())).await;
        }
    }

    async fn sync_once(&self, client: &KubeClient) -> anyhow::Result<()> {
        let list = client.list(self.kind, &self.label_selector).await?;
        let mut fresh = Store::new();
        for item in list.items {
            if let Some(key) = object_key(&item) {
                fresh.insert(key, item);
            }
        }
        tracing::debug!(
            kind = self.kind.as_str(),
            objects = fresh.len(),
            resource_version = %list.resource_version,
            "resynced"
        );
        self.state.send_replace(Arc::new(fresh));

        let mut events = client
            .watch(self.kind, &self.label_selector, &list.resource_version)
            .await?;
        while let Some(event) = events.next_event().await {
            let event = event?;
            if let WatchEvent::Error(status) = &event {
                tracing::info!(kind = self.kind.as_str(), status = %status, "watch reported error");
            }
            let mut outcome = Ok(Applied::Unchanged);
            self.state.send_if_modified(|store| {
                let mut next = store.as_ref().clone();
                outcome = apply_event(&mut next, event);
                if matches!(outcome, Ok(Applied::Changed)) {
                    *store = Arc::new(next);
                    true
                } else {
                    false
                }
            });
            match outcome? {
                Applied::Restart => return Ok(()),
                Applied::Changed | Applied::Unchanged => {}
            }
        }
        Ok(())
    }
}
