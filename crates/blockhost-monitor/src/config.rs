use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use blockhost_model::{ServerVersion, VersionType};
use blockhost_runner::config::{env_string, env_u64, env_usize};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub token: String,
    pub data_dir: PathBuf,
    pub listen: SocketAddr,
    pub version: ServerVersion,
    pub java: String,
    pub replay_max_lines: usize,
    /// Budget for stopping the server after the console disconnects.
    pub stop_timeout: Duration,
}

impl MonitorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let token = env_string("BLOCKHOST_MONITOR_TOKEN").context("BLOCKHOST_MONITOR_TOKEN is required")?;
        let listen = env_string("BLOCKHOST_MONITOR_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let listen = listen
            .parse()
            .with_context(|| format!("BLOCKHOST_MONITOR_LISTEN is not a socket address: {listen}"))?;

        let raw_version = env_string("BLOCKHOST_SERVER_VERSION").context("BLOCKHOST_SERVER_VERSION is required")?;
        let version = match env_string("BLOCKHOST_SERVER_VERSION_TYPE") {
            Some(ty) => {
                let ty: VersionType = ty.parse()?;
                ServerVersion::parse(&raw_version, ty)?
            }
            None => ServerVersion::infer(&raw_version)?,
        };

        Ok(Self {
            token,
            data_dir: PathBuf::from(env_string("BLOCKHOST_MONITOR_DATA").unwrap_or_else(|| "/data".to_string())),
            listen,
            version,
            java: env_string("BLOCKHOST_JAVA").unwrap_or_else(|| "java".to_string()),
            replay_max_lines: env_usize("BLOCKHOST_REPLAY_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(1000),
            stop_timeout: Duration::from_secs(
                env_u64("BLOCKHOST_STOP_SOFT_TIMEOUT_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(20),
            ),
        })
    }
}
