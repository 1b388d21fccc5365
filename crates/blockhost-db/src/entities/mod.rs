pub mod current_run_records;
pub mod environments;
pub mod jar_references;
pub mod past_runs;
pub mod servers;
