use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use blockhost_runner::RunnerConfig;
use blockhost_runner::config::{env_flag, env_string};

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub database_url: String,
    pub listen: SocketAddr,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
    pub kubernetes: bool,
    pub runner: RunnerConfig,
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env_string("DATABASE_URL").context("DATABASE_URL is required")?;
        let listen = env_string("BLOCKHOST_LISTEN")
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen
            .parse()
            .with_context(|| format!("BLOCKHOST_LISTEN is not a socket address: {listen}"))?;

        Ok(Self {
            database_url,
            listen,
            log_dir: env_string("BLOCKHOST_LOG_DIR").map(PathBuf::from),
            kubernetes: env_flag("BLOCKHOST_KUBERNETES"),
            runner: RunnerConfig::from_env(),
        })
    }
}
