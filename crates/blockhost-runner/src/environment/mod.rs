//! Provisioned, runnable contexts: one per server per runner.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blockhost_model::RuntimeEnvironment;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::process::ServerProcess;

mod kubernetes;
mod local;

pub use kubernetes::{KubernetesEnvironment, KubernetesEnvironmentPayload};
pub use local::{LocalEnvironment, LocalEnvironmentPayload};

#[async_trait]
pub trait Environment: Send + Sync + 'static {
    fn uuid(&self) -> Uuid;

    fn server_uuid(&self) -> Uuid;

    fn runner_uuid(&self) -> Uuid;

    /// Runner-specific state persisted alongside the environment record.
    fn payload(&self) -> serde_json::Result<serde_json::Value>;

    fn process_slot(&self) -> &ProcessSlot;

    fn current_process(&self) -> Option<Arc<dyn ServerProcess>> {
        self.process_slot().current()
    }

    /// Starts the server. `None` on any failure, leaving the slot untouched.
    async fn run_server(&self, runtime: &RuntimeEnvironment) -> Option<Arc<dyn ServerProcess>>;
}

type SlotValue = Option<Arc<dyn ServerProcess>>;

/// Observable holder of an environment's live process.
///
/// Each published process gets a watcher task that empties the slot when the
/// process's output ends, unless a newer process has been published since.
/// Publishing cancels the previous watcher.
pub struct ProcessSlot {
    current: Arc<watch::Sender<SlotValue>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ProcessSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSlot {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current: Arc::new(current),
            watcher: Mutex::new(None),
        }
    }

    pub fn current(&self) -> SlotValue {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SlotValue> {
        self.current.subscribe()
    }

    pub fn publish(&self, process: Arc<dyn ServerProcess>) {
        let mut output = process.output();
        self.current.send_replace(Some(process.clone()));

        let slot = self.current.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = output.recv().await {
                if msg.is_end() {
                    break;
                }
            }
            slot.send_if_modified(|current| {
                let ours = current.as_ref().is_some_and(|p| Arc::ptr_eq(p, &process));
                if ours {
                    *current = None;
                }
                ours
            });
        });

        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = watcher.replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        let watcher = self.watcher.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
    }
}
