use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use blockhost_model::{CurrentRunRecord, DEFAULT_PORT, MinecraftServer, RunnerKind, RuntimeEnvironment};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use super::RunnerBackend;
use crate::config::{RunnerConfig, env_string, format_error_chain};
use crate::environment::{Environment, KubernetesEnvironment, KubernetesEnvironmentPayload};
use crate::kubernetes::{KubeClient, KubeConfig, Reflector, ResourceKind, resources};
use crate::repository::EnvironmentRecord;

const DEFAULT_MONITOR_IMAGE: &str = "blockhost-monitor:latest";
const DEFAULT_STORAGE: &str = "5Gi";
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Creation order; deletion goes the other way.
const RESOURCE_ORDER: [ResourceKind; 4] = [
    ResourceKind::Secret,
    ResourceKind::PersistentVolumeClaim,
    ResourceKind::Deployment,
    ResourceKind::Service,
];

/// Runs each server in its own monitor Deployment.
pub struct KubernetesBackend {
    client: KubeClient,
    monitor_image: String,
    storage: String,
    deployments: Arc<Reflector>,
    http: reqwest::Client,
    replay_max_lines: usize,
    reflector_task: Mutex<Option<JoinHandle<()>>>,
}

impl KubernetesBackend {
    pub fn new(client: KubeClient, monitor_image: impl Into<String>, replay_max_lines: usize) -> Self {
        Self {
            client,
            monitor_image: monitor_image.into(),
            storage: DEFAULT_STORAGE.to_string(),
            deployments: Arc::new(Reflector::new(
                ResourceKind::Deployment,
                resources::managed_selector(),
            )),
            http: reqwest::Client::new(),
            replay_max_lines,
            reflector_task: Mutex::new(None),
        }
    }

    pub fn from_env(config: &RunnerConfig) -> anyhow::Result<Self> {
        let client = KubeClient::new(KubeConfig::from_env()).context("kubernetes client")?;
        let image = env_string("BLOCKHOST_MONITOR_IMAGE")
            .unwrap_or_else(|| DEFAULT_MONITOR_IMAGE.to_string());
        Ok(Self::new(client, image, config.replay_max_lines))
    }

    pub fn namespace(&self) -> &str {
        self.client.namespace()
    }

    fn environment(
        &self,
        uuid: Uuid,
        server_uuid: Uuid,
        runner_uuid: Uuid,
        monitor_token: String,
    ) -> Arc<KubernetesEnvironment> {
        Arc::new(KubernetesEnvironment::new(
            uuid,
            server_uuid,
            runner_uuid,
            self.namespace().to_string(),
            monitor_token,
            self.deployments.clone(),
            self.http.clone(),
            AVAILABILITY_TIMEOUT,
            self.replay_max_lines,
        ))
    }

    /// Deletes `kinds` in reverse order. Already-missing objects count as deleted.
    async fn delete_resources(&self, server_uuid: Uuid, kinds: &[ResourceKind]) -> bool {
        let name = resources::resource_name(server_uuid);
        let mut ok = true;
        for kind in kinds.iter().rev() {
            if let Err(e) = self.client.delete(*kind, &name).await {
                tracing::warn!(
                    server = %server_uuid,
                    kind = kind.as_str(),
                    error = %format_error_chain(&e),
                    "delete kubernetes object failed"
                );
                ok = false;
            }
        }
        ok
    }
}

impl Drop for KubernetesBackend {
    fn drop(&mut self) {
        let task = self.reflector_task.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl RunnerBackend for KubernetesBackend {
    type Env = KubernetesEnvironment;

    fn kind(&self) -> RunnerKind {
        RunnerKind::Kubernetes
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut task = self.reflector_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_none() {
            let span = tracing::info_span!("deployment_reflector", namespace = %self.namespace());
            let reflector = self.deployments.clone();
            *task = Some(tokio::spawn(reflector.run(self.client.clone()).instrument(span)));
        }
        Ok(())
    }

    async fn prepare_environment(
        &self,
        server: &MinecraftServer,
        environment_uuid: Uuid,
        runner_uuid: Uuid,
    ) -> Option<Arc<KubernetesEnvironment>> {
        let ns = self.namespace();
        let token = hex::encode(rand::random::<[u8; 32]>());
        let manifests = [
            resources::secret(server.uuid, ns, &token),
            resources::persistent_volume_claim(server.uuid, ns, &self.storage),
            resources::deployment(server, ns, &self.monitor_image),
            resources::service(server.uuid, ns),
        ];

        for (created, (kind, manifest)) in RESOURCE_ORDER.iter().zip(manifests.iter()).enumerate() {
            if let Err(e) = self.client.create(*kind, manifest).await {
                tracing::warn!(
                    server = %server.uuid,
                    kind = kind.as_str(),
                    error = %format_error_chain(&e),
                    "create kubernetes object failed; rolling back"
                );
                self.delete_resources(server.uuid, &RESOURCE_ORDER[..created]).await;
                return None;
            }
        }

        tracing::info!(server = %server.uuid, namespace = ns, "monitor resources created");
        Some(self.environment(environment_uuid, server.uuid, runner_uuid, token))
    }

    async fn cleanup_environment(&self, env: &KubernetesEnvironment) -> bool {
        self.delete_resources(env.server_uuid(), &RESOURCE_ORDER).await
    }

    async fn restore_environment(
        &self,
        record: &EnvironmentRecord,
    ) -> anyhow::Result<Arc<KubernetesEnvironment>> {
        let payload: KubernetesEnvironmentPayload = serde_json::from_value(record.payload.clone())
            .with_context(|| format!("decode kubernetes environment {}", record.uuid))?;
        Ok(self.environment(
            record.uuid,
            record.server_uuid,
            record.runner_uuid,
            payload.monitor_token,
        ))
    }

    async fn get_log(
        &self,
        record: &CurrentRunRecord,
        env: Option<&KubernetesEnvironment>,
    ) -> Vec<String> {
        let Some(env) = env else {
            return Vec::new();
        };
        match env.endpoint().fetch_log(&self.http).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(run = %record.run_uuid, error = %format_error_chain(&e), "fetch monitor log failed");
                Vec::new()
            }
        }
    }

    fn address(&self, env: &KubernetesEnvironment, _runtime: &RuntimeEnvironment) -> String {
        format!(
            "{}.{}.svc:{}",
            resources::resource_name(env.server_uuid()),
            self.namespace(),
            DEFAULT_PORT
        )
    }

    /// The Service always exposes the default port.
    fn effective_runtime(&self, runtime: RuntimeEnvironment) -> RuntimeEnvironment {
        RuntimeEnvironment {
            port: DEFAULT_PORT,
            ..runtime
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> KubernetesBackend {
        let client = KubeClient::new(KubeConfig {
            api_url: "http://127.0.0.1:9".to_string(),
            token: None,
            namespace: "games".to_string(),
            ca_pem: None,
        })
        .unwrap();
        KubernetesBackend::new(client, "monitor:test", 100)
    }

    #[tokio::test]
    async fn restore_address_and_runtime() {
        let b = backend();
        let server_uuid = Uuid::new_v4();
        let record = EnvironmentRecord {
            uuid: Uuid::new_v4(),
            server_uuid,
            runner_uuid: Uuid::new_v4(),
            kind: "kubernetes".to_string(),
            payload: serde_json::json!({ "monitor_token": "abc" }),
        };
        let env = b.restore_environment(&record).await.unwrap();
        assert_eq!(env.uuid(), record.uuid);
        assert_eq!(env.payload().unwrap(), record.payload);
        assert_eq!(
            env.endpoint().status_url(),
            format!("http://mc-{server_uuid}.games.svc:8080/status")
        );

        let runtime = b.effective_runtime(RuntimeEnvironment {
            port: 25570,
            max_heap_mb: 4096,
            min_heap_mb: 1024,
        });
        assert_eq!(runtime.port, DEFAULT_PORT);
        assert_eq!(runtime.max_heap_mb, 4096);
        assert_eq!(
            b.address(&env, &runtime),
            format!("mc-{server_uuid}.games.svc:25565")
        );
    }

    #[tokio::test]
    async fn unreachable_api_rolls_back_to_nothing() {
        let b = backend();
        let server = MinecraftServer {
            uuid: Uuid::new_v4(),
            name: "s".to_string(),
            version: blockhost_model::ServerVersion::release(1, 20, 0),
            runner_uuid: Uuid::new_v4(),
            creation_time: chrono::Utc::now(),
        };
        assert!(
            b.prepare_environment(&server, Uuid::new_v4(), server.runner_uuid)
                .await
                .is_none()
        );
        let record = CurrentRunRecord {
            run_uuid: Uuid::new_v4(),
            server_uuid: server.uuid,
            runner_uuid: server.runner_uuid,
            start_time: chrono::Utc::now(),
        };
        assert!(b.get_log(&record, None).await.is_empty());
    }
}
