use std::fmt;
use std::sync::Arc;

use blockhost_model::{
    CurrentRunInfo, CurrentRunRecord, RuntimeEnvironment, ServerIo, ServerOutput,
};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::process::{ServerProcess, Subscription};

/// A live execution of a server. Exists exactly as long as its process.
pub struct CurrentRun {
    pub uuid: Uuid,
    pub server_uuid: Uuid,
    pub runner_uuid: Uuid,
    pub environment_uuid: Uuid,
    pub runtime: RuntimeEnvironment,
    pub address: String,
    pub start_time: DateTime<Utc>,
    process: Arc<dyn ServerProcess>,
}

impl CurrentRun {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uuid: Uuid,
        server_uuid: Uuid,
        runner_uuid: Uuid,
        environment_uuid: Uuid,
        runtime: RuntimeEnvironment,
        address: String,
        start_time: DateTime<Utc>,
        process: Arc<dyn ServerProcess>,
    ) -> Self {
        Self {
            uuid,
            server_uuid,
            runner_uuid,
            environment_uuid,
            runtime,
            address,
            start_time,
            process,
        }
    }

    pub fn input(&self) -> mpsc::UnboundedSender<String> {
        self.process.input()
    }

    pub fn output(&self) -> Subscription<ServerOutput> {
        self.process.output()
    }

    pub fn interleaved_io(&self) -> Subscription<ServerIo> {
        self.process.interleaved_io()
    }

    pub fn process(&self) -> &Arc<dyn ServerProcess> {
        &self.process
    }

    pub fn record(&self) -> CurrentRunRecord {
        CurrentRunRecord {
            run_uuid: self.uuid,
            server_uuid: self.server_uuid,
            runner_uuid: self.runner_uuid,
            start_time: self.start_time,
        }
    }

    pub fn info(&self) -> CurrentRunInfo {
        CurrentRunInfo {
            uuid: self.uuid,
            server_uuid: self.server_uuid,
            runner_uuid: self.runner_uuid,
            environment_uuid: self.environment_uuid,
            runtime: self.runtime,
            address: self.address.clone(),
            start_time: self.start_time,
        }
    }
}

impl fmt::Debug for CurrentRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentRun")
            .field("uuid", &self.uuid)
            .field("server_uuid", &self.server_uuid)
            .field("runner_uuid", &self.runner_uuid)
            .field("environment_uuid", &self.environment_uuid)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
