//! Orchestration harness: processes, servers, sessions, timing and verification.

pub mod lifecycle;
pub mod logging;
pub mod process;
pub mod scenario;
pub mod session;
pub mod sync;
pub mod verify;

pub use lifecycle::{
    PortRegistry, ServerConfig, ServerHandle, ServerManager, ServerState, StopMode,
    allocate_ports,
};
pub use logging::{
    LogEntry, LogLevel, LogSource, LoggerConfig, PhaseContext, PhaseEvent, PhaseEventInput,
    ScenarioPhase, TestLogger, TestLoggerBuilder,
};
pub use process::{ExitOutcome, ProcessHandle, Signal, StopStatus};
pub use scenario::{
    Scenario, ScenarioBuilder, ScenarioReport, ScenarioState, cleanup_stale_scenarios,
};
pub use session::{SessionHandle, SessionRunner};
pub use sync::{sleep, wait_for, wait_for_port};
pub use verify::{VerificationResult, Verifier, diff_files, list_directory};
