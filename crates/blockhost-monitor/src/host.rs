//! The one Minecraft server this monitor looks after.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use blockhost_model::RuntimeEnvironment;
use blockhost_runner::jar::JarFetcher;
use blockhost_runner::process::{LaunchCommand, LocalProcess, ServerProcess};

use crate::config::MonitorConfig;

pub struct ServerHost {
    config: MonitorConfig,
    fetcher: Arc<dyn JarFetcher>,
    process: tokio::sync::Mutex<Option<Arc<LocalProcess>>>,
}

impl ServerHost {
    pub fn new(config: MonitorConfig, fetcher: Arc<dyn JarFetcher>) -> Self {
        Self {
            config,
            fetcher,
            process: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn jar_path(&self) -> PathBuf {
        self.config.data_dir.join("server.jar")
    }

    /// Downloads the jar once; the data volume keeps it across restarts.
    async fn ensure_jar(&self) -> anyhow::Result<PathBuf> {
        let path = self.jar_path();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.config.data_dir)
            .await
            .with_context(|| format!("create {}", self.config.data_dir.display()))?;
        let bytes = self.fetcher.fetch(&self.config.version).await?;
        install_file(&path, &bytes).await?;
        tracing::info!(version = %self.config.version, "server jar downloaded");
        Ok(path)
    }

    fn launch_command(&self, jar: PathBuf, runtime: &RuntimeEnvironment) -> LaunchCommand {
        LaunchCommand {
            program: self.config.java.clone(),
            args: vec![
                format!("-Xmx{}M", runtime.max_heap_mb),
                format!("-Xms{}M", runtime.min_heap_mb),
                "-jar".to_string(),
                jar.to_string_lossy().into_owned(),
                "nogui".to_string(),
                "--port".to_string(),
                runtime.port.to_string(),
            ],
            cwd: self.config.data_dir.clone(),
        }
    }

    /// The running server, started with `runtime` if nothing is running.
    pub async fn attach_or_start(&self, runtime: &RuntimeEnvironment) -> anyhow::Result<Arc<LocalProcess>> {
        let mut current = self.process.lock().await;
        if let Some(process) = current.as_ref().filter(|p| p.exit().is_none()) {
            return Ok(process.clone());
        }

        let jar = self.ensure_jar().await?;
        tokio::fs::write(self.config.data_dir.join("eula.txt"), "eula=true\n")
            .await
            .context("write eula.txt")?;
        let process = Arc::new(LocalProcess::spawn(
            &self.launch_command(jar, runtime),
            self.config.replay_max_lines,
        )?);
        tracing::info!(port = runtime.port, max_heap_mb = runtime.max_heap_mb, "server started");
        *current = Some(process.clone());
        Ok(process)
    }

    /// Forcible stop of the running server, if any. `false` when nothing was running.
    pub async fn kill(&self) -> bool {
        let current = self.process.lock().await.clone();
        match current.filter(|p| p.exit().is_none()) {
            Some(process) => {
                process.request_forcible_stop().await;
                true
            }
            None => false,
        }
    }

    /// Graceful stop on monitor shutdown so the world is saved before the pod goes.
    pub async fn shutdown(&self) {
        let current = self.process.lock().await.take();
        if let Some(process) = current.filter(|p| p.exit().is_none()) {
            let budget = self.config.stop_timeout;
            if process.stop(budget, budget).await.is_none() {
                tracing::error!("server survived shutdown stop");
            }
        }
    }

    pub async fn latest_log(&self) -> Vec<String> {
        let path = self.config.data_dir.join("logs").join("latest.log");
        match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes)
                .lines()
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "read latest.log");
                Vec::new()
            }
        }
    }
}

/// Writes through a sibling temp file; the temp file never outlives a failure.
async fn install_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("jar.tmp");
    let written = async {
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("move jar into {}", path.display()))
    }
    .await;
    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    written
}
