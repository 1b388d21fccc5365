//! Runner, environment and process lifecycle for hosted Minecraft servers.
//!
//! A [`Runner`] owns the environments it provisioned for each server and the
//! runs it started in them. Backends ([`LocalBackend`], [`KubernetesBackend`])
//! supply the runner-specific provisioning; everything else (the
//! one-environment-per-server guard, run bookkeeping, archiving and crash
//! recovery) lives in the shared orchestrator.

pub mod config;
pub mod content;
pub mod environment;
pub mod error;
pub mod jar;
pub mod kubernetes;
pub mod process;
pub mod repository;
pub mod run;
pub mod runner;

pub use config::{RunnerConfig, format_error_chain};
pub use error::RunnerError;
pub use run::CurrentRun;
pub use runner::{
    KubernetesBackend, LocalBackend, MinecraftServerRunner, Runner, RunnerBackend, RunnerDeps,
    RunnerSettings, recover_orphaned_runs,
};
