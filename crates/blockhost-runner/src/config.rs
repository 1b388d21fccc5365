use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_REPLAY_MAX_LINES: usize = 1000;
const DEFAULT_PAST_RUN_MAX_LINES: usize = 5000;
const DEFAULT_STOP_SOFT_TIMEOUT_SEC: u64 = 20;
const DEFAULT_STOP_FORCE_TIMEOUT_SEC: u64 = 10;

pub fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Trimmed, non-empty value of `name`.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_flag(name: &str) -> bool {
    matches!(
        env_string(name).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

/// Settings shared by every runner in the process, read once at startup.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub data_root: PathBuf,
    pub java: String,
    pub public_host: String,
    pub replay_max_lines: usize,
    pub past_run_max_lines: usize,
    pub stop_soft_timeout: Duration,
    pub stop_force_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            java: "java".to_string(),
            public_host: "localhost".to_string(),
            replay_max_lines: DEFAULT_REPLAY_MAX_LINES,
            past_run_max_lines: DEFAULT_PAST_RUN_MAX_LINES,
            stop_soft_timeout: Duration::from_secs(DEFAULT_STOP_SOFT_TIMEOUT_SEC),
            stop_force_timeout: Duration::from_secs(DEFAULT_STOP_FORCE_TIMEOUT_SEC),
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let raw = env_string("BLOCKHOST_DATA_ROOT").unwrap_or_else(|| "./data".to_string());
        let p = PathBuf::from(raw);
        let data_root = if p.is_absolute() {
            p
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(p)
        };

        Self {
            data_root,
            java: env_string("BLOCKHOST_JAVA").unwrap_or_else(|| "java".to_string()),
            public_host: env_string("BLOCKHOST_PUBLIC_HOST")
                .unwrap_or_else(|| "localhost".to_string()),
            replay_max_lines: env_usize("BLOCKHOST_REPLAY_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(DEFAULT_REPLAY_MAX_LINES),
            past_run_max_lines: env_usize("BLOCKHOST_PAST_RUN_MAX_LINES")
                .map(|v| v.clamp(100, 200_000))
                .unwrap_or(DEFAULT_PAST_RUN_MAX_LINES),
            stop_soft_timeout: Duration::from_secs(
                env_u64("BLOCKHOST_STOP_SOFT_TIMEOUT_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(DEFAULT_STOP_SOFT_TIMEOUT_SEC),
            ),
            stop_force_timeout: Duration::from_secs(
                env_u64("BLOCKHOST_STOP_FORCE_TIMEOUT_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(DEFAULT_STOP_FORCE_TIMEOUT_SEC),
            ),
        }
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.data_root.join("servers")
    }

    pub fn jar_cache_dir(&self) -> PathBuf {
        self.data_root.join("cache").join("jars")
    }
}

/// Flattens an error chain into one line, skipping empty and repeated causes.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        return "unknown error".to_string();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_skips_repeats() {
        let err = anyhow::anyhow!("connection refused")
            .context("connection refused")
            .context("fetch version manifest");
        assert_eq!(
            format_error_chain(&err),
            "fetch version manifest: connection refused"
        );
    }

    #[test]
    fn default_layout_under_data_root() {
        let cfg = RunnerConfig {
            data_root: PathBuf::from("/srv/blockhost"),
            ..Default::default()
        };
        assert_eq!(cfg.servers_dir(), PathBuf::from("/srv/blockhost/servers"));
        assert_eq!(
            cfg.jar_cache_dir(),
            PathBuf::from("/srv/blockhost/cache/jars")
        );
    }
}
