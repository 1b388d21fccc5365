use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockhost_model::RuntimeEnvironment;
use uuid::Uuid;

use super::{Environment, ProcessSlot};
use crate::config::format_error_chain;
use crate::kubernetes::{Reflector, deployment_available, resources};
use crate::process::{MonitorEndpoint, PodProcess, ServerProcess};

/// Persisted state of a [`KubernetesEnvironment`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KubernetesEnvironmentPayload {
    pub monitor_token: String,
}

/// A monitor Deployment in the cluster; the monitor runs the actual server.
pub struct KubernetesEnvironment {
    uuid: Uuid,
    server_uuid: Uuid,
    runner_uuid: Uuid,
    namespace: String,
    monitor_token: String,
    endpoint: MonitorEndpoint,
    deployments: Arc<Reflector>,
    http: reqwest::Client,
    availability_timeout: Duration,
    replay_max_lines: usize,
    slot: ProcessSlot,
    spawn_lock: tokio::sync::Mutex<()>,
}

impl KubernetesEnvironment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: Uuid,
        server_uuid: Uuid,
        runner_uuid: Uuid,
        namespace: String,
        monitor_token: String,
        deployments: Arc<Reflector>,
        http: reqwest::Client,
        availability_timeout: Duration,
        replay_max_lines: usize,
    ) -> Self {
        let endpoint = MonitorEndpoint::new(
            resources::monitor_base_url(server_uuid, &namespace),
            monitor_token.clone(),
        );
        Self {
            uuid,
            server_uuid,
            runner_uuid,
            namespace,
            monitor_token,
            endpoint,
            deployments,
            http,
            availability_timeout,
            replay_max_lines,
            slot: ProcessSlot::new(),
            spawn_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &MonitorEndpoint {
        &self.endpoint
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl Environment for KubernetesEnvironment {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn server_uuid(&self) -> Uuid {
        self.server_uuid
    }

    fn runner_uuid(&self) -> Uuid {
        self.runner_uuid
    }

    fn payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(KubernetesEnvironmentPayload {
            monitor_token: self.monitor_token.clone(),
        })
    }

    fn process_slot(&self) -> &ProcessSlot {
        &self.slot
    }

    async fn run_server(&self, runtime: &RuntimeEnvironment) -> Option<Arc<dyn ServerProcess>> {
        let _guard = self.spawn_lock.lock().await;

        if self.slot.current().is_some() {
            tracing::warn!(environment = %self.uuid, "server already running");
            return None;
        }

        let name = resources::resource_name(self.server_uuid);
        let available = self
            .deployments
            .wait_until(
                &self.namespace,
                &name,
                deployment_available,
                self.availability_timeout,
            )
            .await;
        if !available {
            tracing::warn!(
                environment = %self.uuid,
                deployment = %name,
                timeout_s = self.availability_timeout.as_secs(),
                "monitor deployment not available"
            );
            return None;
        }
        if !self.endpoint.is_alive(&self.http).await {
            tracing::warn!(environment = %self.uuid, "monitor did not answer status probe");
            return None;
        }

        let process: Arc<dyn ServerProcess> = match PodProcess::connect(
            self.endpoint.clone(),
            runtime,
            self.http.clone(),
            self.replay_max_lines,
        )
        .await
        {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::warn!(
                    environment = %self.uuid,
                    error = %format_error_chain(&e),
                    "connect monitor console failed"
                );
                return None;
            }
        };
        self.slot.publish(process.clone());
        Some(process)
    }
}
