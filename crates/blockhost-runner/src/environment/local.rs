use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use blockhost_model::{RuntimeEnvironment, ServerVersion};
use uuid::Uuid;

use super::{Environment, ProcessSlot};
use crate::config::format_error_chain;
use crate::jar::Jar;
use crate::process::{LaunchCommand, LocalProcess, ServerProcess};

/// Persisted state of a [`LocalEnvironment`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LocalEnvironmentPayload {
    pub content_directory: PathBuf,
    pub version: ServerVersion,
}

/// A content directory plus a cached jar on this machine.
pub struct LocalEnvironment {
    uuid: Uuid,
    server_uuid: Uuid,
    runner_uuid: Uuid,
    content_directory: PathBuf,
    jar: Jar,
    java: String,
    replay_max_lines: usize,
    slot: ProcessSlot,
    spawn_lock: tokio::sync::Mutex<()>,
}

impl LocalEnvironment {
    pub fn new(
        uuid: Uuid,
        server_uuid: Uuid,
        runner_uuid: Uuid,
        content_directory: PathBuf,
        jar: Jar,
        java: String,
        replay_max_lines: usize,
    ) -> Self {
        Self {
            uuid,
            server_uuid,
            runner_uuid,
            content_directory,
            jar,
            java,
            replay_max_lines,
            slot: ProcessSlot::new(),
            spawn_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn content_directory(&self) -> &PathBuf {
        &self.content_directory
    }

    pub fn jar(&self) -> &Jar {
        &self.jar
    }

    fn launch_command(&self, runtime: &RuntimeEnvironment) -> LaunchCommand {
        LaunchCommand {
            program: self.java.clone(),
            args: vec![
                format!("-Xmx{}M", runtime.max_heap_mb),
                format!("-Xms{}M", runtime.min_heap_mb),
                "-jar".to_string(),
                self.jar.path.display().to_string(),
                "nogui".to_string(),
                "--port".to_string(),
                runtime.port.to_string(),
            ],
            cwd: self.content_directory.clone(),
        }
    }
}

async fn is_dir(path: &PathBuf) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn is_file(path: &PathBuf) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[async_trait]
impl Environment for LocalEnvironment {
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
        serde_json::to_value(LocalEnvironmentPayload {
            content_directory: self.content_directory.clone(),
            version: self.jar.version.clone(),
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
        if !is_dir(&self.content_directory).await {
            tracing::warn!(
                environment = %self.uuid,
                path = %self.content_directory.display(),
                "content directory missing"
            );
            return None;
        }
        if !is_file(&self.jar.path).await {
            tracing::warn!(
                environment = %self.uuid,
                path = %self.jar.path.display(),
                "server jar missing"
            );
            return None;
        }

        let launch = self.launch_command(runtime);
        let process: Arc<dyn ServerProcess> =
            match LocalProcess::spawn(&launch, self.replay_max_lines) {
                Ok(p) => Arc::new(p),
                Err(e) => {
                    tracing::warn!(
                        environment = %self.uuid,
                        error = %format_error_chain(&e),
                        "spawn server failed"
                    );
                    return None;
                }
            };
        self.slot.publish(process.clone());
        Some(process)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn env(dir: &std::path::Path, java: &str) -> LocalEnvironment {
        let content = dir.join("content");
        std::fs::create_dir_all(&content).unwrap();
        let jar_path = dir.join("1.20---release.jar");
        std::fs::write(&jar_path, b"PK").unwrap();
        LocalEnvironment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            content,
            Jar {
                version: ServerVersion::release(1, 20, 0),
                path: jar_path,
            },
            java.to_string(),
            100,
        )
    }

    #[test]
    fn launch_command_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let e = env(tmp.path(), "java");
        let cmd = e.launch_command(&RuntimeEnvironment {
            port: 25570,
            max_heap_mb: 4096,
            min_heap_mb: 512,
        });
        assert_eq!(cmd.program, "java");
        assert_eq!(cmd.args[0], "-Xmx4096M");
        assert_eq!(cmd.args[1], "-Xms512M");
        assert_eq!(cmd.args[2], "-jar");
        assert_eq!(&cmd.args[4..], ["nogui", "--port", "25570"]);
        assert_eq!(cmd.cwd, tmp.path().join("content"));
    }

    #[tokio::test]
    async fn refuses_second_process_and_missing_jar() {
        let tmp = tempfile::tempdir().unwrap();
        // Stands in for java: ignores its arguments and blocks on stdin.
        let script = tmp.path().join("fake-java");
        std::fs::write(&script, "#!/bin/sh\nwhile IFS= read -r line; do :; done\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let e = env(tmp.path(), script.to_str().unwrap());
        let runtime = RuntimeEnvironment::default();

        let p = e.run_server(&runtime).await.unwrap();
        assert!(e.current_process().is_some());
        assert!(e.run_server(&runtime).await.is_none());

        p.stop(Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();
        let mut rx = e.process_slot().subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(Option::is_none))
            .await
            .unwrap()
            .unwrap();

        std::fs::remove_file(&e.jar().path).unwrap();
        assert!(e.run_server(&runtime).await.is_none());
        assert!(e.current_process().is_none());
    }
}
