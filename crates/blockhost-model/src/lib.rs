//! Domain types shared by the runner core, the control plane and the monitor.

mod io;
mod run;
mod version;

pub use io::{ConsoleMessage, ProcessMessage, ServerIo, ServerOutput};
pub use run::{
    CurrentRunInfo, CurrentRunRecord, DEFAULT_MAX_HEAP_MB, DEFAULT_MIN_HEAP_MB, DEFAULT_PORT, MinecraftServer,
    PastRun, RunOverrides, RunnerInfo, RunnerKind, RuntimeEnvironment,
};
pub use version::{
    BuildDate, CACHE_KEY_SEPARATOR, PhaseNumber, ServerVersion, VersionParseError, VersionType,
};
