//! dbrace: an orchestration harness for database race and recovery scenarios.
//!
//! The harness starts, signals, kills and restarts external server processes,
//! runs concurrent client sessions against them, and verifies what they left
//! behind. The server itself is a black box reached through [`client::Connector`].

pub mod client;
pub mod config;
pub mod errors;
pub mod harness;
pub mod protocol;
pub mod testing;
pub mod workload;

pub use client::{Connector, JsonLineConnector, ServerClient, ShutdownHandle};
pub use config::HarnessConfig;
pub use errors::{ErrorCode, HarnessError, HarnessResult};
pub use harness::{
    Scenario, ScenarioBuilder, ScenarioReport, ScenarioState, ServerConfig, ServerHandle,
    ServerManager, ServerState, SessionHandle, SessionRunner, Signal, StopMode, StopStatus,
    Verifier, sleep,
};
pub use workload::{Operation, OpResult, SessionWorkload, Spin, Workload, workload_fn};
