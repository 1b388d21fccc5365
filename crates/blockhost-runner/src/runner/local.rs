use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use blockhost_model::{CurrentRunRecord, MinecraftServer, RunnerKind, RuntimeEnvironment};
use uuid::Uuid;

use super::RunnerBackend;
use crate::config::{RunnerConfig, format_error_chain};
use crate::content::ContentDirectoryRepository;
use crate::environment::{Environment, LocalEnvironment, LocalEnvironmentPayload};
use crate::jar::{Jar, JarResourceManager};
use crate::repository::EnvironmentRecord;

const EULA: &str = "eula=true\n";

/// Runs servers as child processes on this machine.
pub struct LocalBackend {
    content: ContentDirectoryRepository,
    jars: Arc<JarResourceManager>,
    java: String,
    public_host: String,
    replay_max_lines: usize,
}

impl LocalBackend {
    pub fn new(
        content: ContentDirectoryRepository,
        jars: Arc<JarResourceManager>,
        java: impl Into<String>,
        public_host: impl Into<String>,
        replay_max_lines: usize,
    ) -> Self {
        Self {
            content,
            jars,
            java: java.into(),
            public_host: public_host.into(),
            replay_max_lines,
        }
    }

    pub fn from_config(config: &RunnerConfig, jars: Arc<JarResourceManager>) -> Self {
        Self::new(
            ContentDirectoryRepository::new(config.servers_dir()),
            jars,
            config.java.clone(),
            config.public_host.clone(),
            config.replay_max_lines,
        )
    }

    fn environment(
        &self,
        uuid: Uuid,
        server_uuid: Uuid,
        runner_uuid: Uuid,
        dir: PathBuf,
        jar: Jar,
    ) -> Arc<LocalEnvironment> {
        Arc::new(LocalEnvironment::new(
            uuid,
            server_uuid,
            runner_uuid,
            dir,
            jar,
            self.java.clone(),
            self.replay_max_lines,
        ))
    }
}

async fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect())
}

#[async_trait]
impl RunnerBackend for LocalBackend {
    type Env = LocalEnvironment;

    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    async fn start(&self) -> anyhow::Result<()> {
        let pruned = self.jars.prune_unreferenced().await?;
        if pruned > 0 {
            tracing::info!(pruned, "pruned unreferenced jars");
        }
        Ok(())
    }

    async fn prepare_environment(
        &self,
        server: &MinecraftServer,
        environment_uuid: Uuid,
        runner_uuid: Uuid,
    ) -> Option<Arc<LocalEnvironment>> {
        let dir = self.content.get_or_create(server.uuid).await?;

        if let Err(e) = tokio::fs::write(dir.join("eula.txt"), EULA).await {
            tracing::warn!(server = %server.uuid, error = %e, "write eula.txt failed");
            self.content.delete(server.uuid).await;
            return None;
        }

        let Some(jar) = self
            .jars
            .access_jar(&server.version, &environment_uuid.to_string())
            .await
        else {
            self.content.delete(server.uuid).await;
            return None;
        };

        Some(self.environment(environment_uuid, server.uuid, runner_uuid, dir, jar))
    }

    async fn cleanup_environment(&self, env: &LocalEnvironment) -> bool {
        // a failed free is a bookkeeping bug and already logged; it must not pin the environment
        self.jars
            .free_jar(&env.jar().version, &env.uuid().to_string())
            .await;
        self.content.delete(env.server_uuid()).await
    }

    async fn restore_environment(
        &self,
        record: &EnvironmentRecord,
    ) -> anyhow::Result<Arc<LocalEnvironment>> {
        let payload: LocalEnvironmentPayload = serde_json::from_value(record.payload.clone())
            .with_context(|| format!("decode local environment {}", record.uuid))?;

        let jar = match self
            .jars
            .access_jar(&payload.version, &record.uuid.to_string())
            .await
        {
            Some(jar) => jar,
            None => {
                tracing::warn!(
                    environment = %record.uuid,
                    version = %payload.version,
                    "jar unavailable; server will not start until it is"
                );
                Jar {
                    path: self.jars.jar_path(&payload.version),
                    version: payload.version,
                }
            }
        };

        Ok(self.environment(
            record.uuid,
            record.server_uuid,
            record.runner_uuid,
            payload.content_directory,
            jar,
        ))
    }

    async fn get_log(&self, record: &CurrentRunRecord, env: Option<&LocalEnvironment>) -> Vec<String> {
        let dir = match env {
            Some(env) => Some(env.content_directory().clone()),
            None => self.content.get_existing(record.server_uuid).await,
        };
        let Some(dir) = dir else {
            return Vec::new();
        };
        match read_lines(&dir.join("logs").join("latest.log")).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(run = %record.run_uuid, error = %format_error_chain(&e), "recover log failed");
                Vec::new()
            }
        }
    }

    fn address(&self, _env: &LocalEnvironment, runtime: &RuntimeEnvironment) -> String {
        format!("{}:{}", self.public_host, runtime.port)
    }
}

#[cfg(test)]
mod tests {
    use blockhost_model::ServerVersion;
    use chrono::Utc;

    use super::*;
    use crate::jar::testing::StaticFetcher;
    use crate::repository::{DbJarReferenceRepository, JarReferenceRepository, test_db};

    struct Fixture {
        _dir: tempfile::TempDir,
        backend: LocalBackend,
        references: Arc<DbJarReferenceRepository>,
        server: MinecraftServer,
    }

    async fn fixture(fetcher: Arc<StaticFetcher>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let references = Arc::new(DbJarReferenceRepository::new(test_db(dir.path()).await));
        let jars = Arc::new(JarResourceManager::new(
            dir.path().join("jars"),
            fetcher,
            references.clone(),
        ));
        let backend = LocalBackend::new(
            ContentDirectoryRepository::new(dir.path().join("servers")),
            jars,
            "java",
            "play.example.net",
            100,
        );
        Fixture {
            _dir: dir,
            backend,
            references,
            server: MinecraftServer {
                uuid: Uuid::new_v4(),
                name: "s".to_string(),
                version: ServerVersion::release(1, 20, 0),
                runner_uuid: Uuid::new_v4(),
                creation_time: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn prepare_restore_cleanup() {
        let f = fixture(StaticFetcher::ok(b"PK")).await;
        let env_uuid = Uuid::new_v4();
        let env = f
            .backend
            .prepare_environment(&f.server, env_uuid, f.server.runner_uuid)
            .await
            .unwrap();

        let dir = env.content_directory().clone();
        assert_eq!(std::fs::read_to_string(dir.join("eula.txt")).unwrap(), EULA);
        assert!(env.jar().path.is_file());
        let key = f.server.version.cache_key();
        assert_eq!(f.references.count(&key).await.unwrap(), 1);

        let record = EnvironmentRecord {
            uuid: env.uuid(),
            server_uuid: env.server_uuid(),
            runner_uuid: env.runner_uuid(),
            kind: "local".to_string(),
            payload: env.payload().unwrap(),
        };
        let restored = f.backend.restore_environment(&record).await.unwrap();
        assert_eq!(restored.content_directory(), &dir);
        assert_eq!(restored.jar(), env.jar());
        assert_eq!(f.references.count(&key).await.unwrap(), 1);

        assert!(f.backend.cleanup_environment(&env).await);
        assert!(!dir.exists());
        assert!(!env.jar().path.exists());
        assert_eq!(f.references.count(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_jar_download_removes_content_directory() {
        let f = fixture(StaticFetcher::failing()).await;
        let env = f
            .backend
            .prepare_environment(&f.server, Uuid::new_v4(), f.server.runner_uuid)
            .await;
        assert!(env.is_none());
        assert!(f.backend.content.get_existing(f.server.uuid).await.is_none());
    }

    #[tokio::test]
    async fn recovered_log_comes_from_latest_log() {
        let f = fixture(StaticFetcher::ok(b"PK")).await;
        let record = CurrentRunRecord {
            run_uuid: Uuid::new_v4(),
            server_uuid: f.server.uuid,
            runner_uuid: f.server.runner_uuid,
            start_time: Utc::now(),
        };
        assert!(f.backend.get_log(&record, None).await.is_empty());

        let dir = f.backend.content.get_or_create(f.server.uuid).await.unwrap();
        std::fs::create_dir_all(dir.join("logs")).unwrap();
        std::fs::write(dir.join("logs/latest.log"), "[12:00] Starting\n[12:01] Done\n").unwrap();
        assert_eq!(
            f.backend.get_log(&record, None).await,
            vec!["[12:00] Starting", "[12:01] Done"]
        );
        let env = f
            .backend
            .prepare_environment(&f.server, Uuid::new_v4(), f.server.runner_uuid)
            .await
            .unwrap();
        assert_eq!(
            f.backend.get_log(&record, Some(&env)).await,
            vec!["[12:00] Starting", "[12:01] Done"]
        );
        assert_eq!(
            f.backend.address(&env, &RuntimeEnvironment::default()),
            "play.example.net:25565"
        );
    }
}
