use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ServerVersion;

pub const DEFAULT_PORT: u16 = 25565;
pub const DEFAULT_MAX_HEAP_MB: u32 = 2048;
pub const DEFAULT_MIN_HEAP_MB: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MinecraftServer {
    pub uuid: Uuid,
    pub name: String,
    pub version: ServerVersion,
    pub runner_uuid: Uuid,
    pub creation_time: DateTime<Utc>,
}

/// Port and heap sizes a run was started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeEnvironment {
    pub port: u16,
    pub max_heap_mb: u32,
    pub min_heap_mb: u32,
}

impl Default for RuntimeEnvironment {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_heap_mb: DEFAULT_MAX_HEAP_MB,
            min_heap_mb: DEFAULT_MIN_HEAP_MB,
        }
    }
}

/// Caller-supplied run parameters. Unset fields fall back to the defaults,
/// never to a previous run's values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunOverrides {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub max_heap_mb: Option<u32>,
    #[serde(default)]
    pub min_heap_mb: Option<u32>,
}

impl RunOverrides {
    pub fn resolve(&self) -> RuntimeEnvironment {
        let defaults = RuntimeEnvironment::default();
        RuntimeEnvironment {
            port: self.port.unwrap_or(defaults.port),
            max_heap_mb: self.max_heap_mb.unwrap_or(defaults.max_heap_mb),
            min_heap_mb: self.min_heap_mb.unwrap_or(defaults.min_heap_mb),
        }
    }
}

/// Durable shadow of a live run, kept until its past run is saved.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CurrentRunRecord {
    pub run_uuid: Uuid,
    pub server_uuid: Uuid,
    pub runner_uuid: Uuid,
    pub start_time: DateTime<Utc>,
}

/// Wire shape of a live run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CurrentRunInfo {
    pub uuid: Uuid,
    pub server_uuid: Uuid,
    pub runner_uuid: Uuid,
    pub environment_uuid: Uuid,
    pub runtime: RuntimeEnvironment,
    pub address: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PastRun {
    pub uuid: Uuid,
    pub server_uuid: Uuid,
    pub runner_uuid: Uuid,
    pub start_time: DateTime<Utc>,
    /// `None` when the run was cut short by a crash and the real stop time is unknown.
    pub stop_time: Option<DateTime<Utc>>,
    pub log: Vec<String>,
}

impl PastRun {
    pub fn from_record(
        record: &CurrentRunRecord,
        stop_time: Option<DateTime<Utc>>,
        log: Vec<String>,
    ) -> Self {
        Self {
            uuid: record.run_uuid,
            server_uuid: record.server_uuid,
            runner_uuid: record.runner_uuid,
            start_time: record.start_time,
            stop_time,
            log,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Local,
    Kubernetes,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Local => "local",
            RunnerKind::Kubernetes => "kubernetes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunnerInfo {
    pub uuid: Uuid,
    pub name: String,
    pub kind: RunnerKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_fall_back_to_defaults_per_field() {
        let env = RunOverrides {
            port: Some(25570),
            ..Default::default()
        }
        .resolve();
        assert_eq!(env.port, 25570);
        assert_eq!(env.max_heap_mb, DEFAULT_MAX_HEAP_MB);
        assert_eq!(env.min_heap_mb, DEFAULT_MIN_HEAP_MB);

        assert_eq!(RunOverrides::default().resolve(), RuntimeEnvironment::default());
    }

    #[test]
    fn past_run_keeps_run_uuid() {
        let record = CurrentRunRecord {
            run_uuid: Uuid::new_v4(),
            server_uuid: Uuid::new_v4(),
            runner_uuid: Uuid::new_v4(),
            start_time: Utc::now(),
        };
        let past = PastRun::from_record(&record, None, vec!["line".to_string()]);
        assert_eq!(past.uuid, record.run_uuid);
        assert_eq!(past.start_time, record.start_time);
        assert!(past.stop_time.is_none());
    }
}
