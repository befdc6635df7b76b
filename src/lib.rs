pub mod errors;
pub mod executor;
pub mod incremental;
pub mod lock;
pub mod logs;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod telemetry;
pub mod trace;
