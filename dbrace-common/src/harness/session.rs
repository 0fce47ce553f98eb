//! Parallel sessions.
//!
//! Each session is a named OS thread that owns one client connection and runs
//! a [`SessionWorkload`]. `launch` returns only after the connection is
//! established, so a caller's `sleep` after `launch` measures time during
//! which the workload is live against the server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::lifecycle::{ServerHandle, ServerManager, StopMode};
use super::logging::{LogLevel, PhaseContext, PhaseEventInput, ScenarioPhase, TestLogger};
use crate::client::{Connector, ShutdownHandle};
use crate::errors::{HarnessError, HarnessResult};
use crate::workload::{SessionWorkload, StopFlag, WorkloadOutcome};

type SessionThread = JoinHandle<HarnessResult<WorkloadOutcome>>;

/// Launches workloads as concurrent sessions.
pub struct SessionRunner {
    connector: Arc<dyn Connector>,
    logger: TestLogger,
    ready_timeout: Duration,
    next_id: AtomicU64,
}

impl SessionRunner {
    pub fn new(connector: Arc<dyn Connector>, logger: TestLogger, ready_timeout: Duration) -> Self {
        Self {
            connector,
            logger,
            ready_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Start `workload` against the server on `target_port`.
    ///
    /// Blocks until the session has connected or the ready timeout passes.
    pub fn launch<W: SessionWorkload>(
        &self,
        target_port: u16,
        workload: W,
    ) -> HarnessResult<SessionHandle> {
        let id = format!("s{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let workload_name = workload.name().to_string();
        let stop: StopFlag = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel::<HarnessResult<Option<ShutdownHandle>>>(1);

        let thread = {
            let connector = Arc::clone(&self.connector);
            let logger = self.logger.clone();
            let stop = Arc::clone(&stop);
            let id = id.clone();
            thread::Builder::new()
                .name(format!("dbrace-session-{id}"))
                .spawn(move || {
                    run_session(
                        &id,
                        target_port,
                        connector,
                        Box::new(workload),
                        stop,
                        ready_tx,
                        logger,
                    )
                })?
        };

        match ready_rx.recv_timeout(self.ready_timeout) {
            Ok(Ok(shutdown)) => {
                self.logger.phase(
                    ScenarioPhase::Running,
                    format!("session {id} running {workload_name} against port {target_port}"),
                    PhaseContext::decision_only("SESSION_LAUNCH")
                        .port(target_port)
                        .session(&id),
                );
                Ok(SessionHandle {
                    id,
                    target_port,
                    workload: workload_name,
                    thread: Some(thread),
                    shutdown,
                    stop,
                    logger: self.logger.clone(),
                    launched_at: Instant::now(),
                })
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                self.logger
                    .log_session(&id, LogLevel::Error, format!("launch failed: {err}"));
                Err(err)
            }
            Err(_) => {
                stop.store(true, Ordering::Relaxed);
                self.logger.log_session(
                    &id,
                    LogLevel::Error,
                    format!("not connected after {:?}; abandoning", self.ready_timeout),
                );
                Err(HarnessError::Timeout(self.ready_timeout))
            }
        }
    }

    /// Join `session`, killing `server` if it has not finished within `timeout`.
    ///
    /// A session that needed the kill yields `SessionHung` after it has been
    /// joined.
    pub fn join_or_kill(
        &self,
        session: &mut SessionHandle,
        manager: &ServerManager,
        server: &mut ServerHandle,
        timeout: Duration,
    ) -> HarnessResult<WorkloadOutcome> {
        if session.wait_finished(timeout) {
            return session.join();
        }

        self.logger.log_phase_event(
            PhaseEventInput::new(
                ScenarioPhase::Running,
                format!(
                    "session {} still running after {timeout:?}; killing server:{}",
                    session.id,
                    server.port()
                ),
                PhaseContext::decision_only("SESSION_HUNG_KILL")
                    .port(server.port())
                    .session(&session.id),
            )
            .level(LogLevel::Warn),
        );
        if let Err(err) = manager.stop(server, StopMode::Forceful, manager.stop_timeout()) {
            self.logger
                .warn(format!("forced stop of server:{} failed: {err}", server.port()));
        }
        if !session.wait_finished(manager.stop_timeout()) {
            session.terminate();
        }

        let outcome = session.join();
        self.logger.log_session(
            &session.id,
            LogLevel::Warn,
            format!("released by server kill: {outcome:?}"),
        );
        Err(HarnessError::SessionHung {
            session: session.id.clone(),
            port: server.port(),
            waited: timeout,
        })
    }
}

fn run_session(
    id: &str,
    port: u16,
    connector: Arc<dyn Connector>,
    workload: Box<dyn SessionWorkload>,
    stop: StopFlag,
    ready: mpsc::SyncSender<HarnessResult<Option<ShutdownHandle>>>,
    logger: TestLogger,
) -> HarnessResult<WorkloadOutcome> {
    let name = workload.name().to_string();
    let mut client = match connector.connect(port) {
        Ok(client) => client,
        Err(err) => {
            let message = err.to_string();
            let _ = ready.send(Err(err));
            return Err(HarnessError::ConnectFailed {
                port,
                reason: message,
            });
        }
    };
    if ready.send(Ok(client.shutdown_handle())).is_err() || stop.load(Ordering::Relaxed) {
        return Err(HarnessError::Timeout(Duration::ZERO));
    }

    let started = Instant::now();
    logger.log_session(id, LogLevel::Debug, format!("workload {name} started"));
    let result = workload.run(client.as_mut(), &stop);
    let elapsed = started.elapsed();

    match &result {
        Ok(results) => logger.log_session(
            id,
            LogLevel::Info,
            format!(
                "workload {name} finished: {} ops in {elapsed:?}",
                results.len()
            ),
        ),
        Err(err) => logger.log_session(
            id,
            LogLevel::Warn,
            format!("workload {name} ended with error after {elapsed:?}: {err}"),
        ),
    }

    result.map(|results| WorkloadOutcome {
        workload: name,
        results,
        elapsed,
    })
}

/// A launched session. Join it once, or abandon it.
pub struct SessionHandle {
    id: String,
    target_port: u16,
    workload: String,
    thread: Option<SessionThread>,
    shutdown: Option<ShutdownHandle>,
    stop: StopFlag,
    logger: TestLogger,
    launched_at: Instant,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn workload(&self) -> &str {
        &self.workload
    }

    /// True once the workload has returned (or the handle was joined).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Poll until finished or `timeout` passes.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.is_finished() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Block until the workload completes and return its result.
    pub fn join(&mut self) -> HarnessResult<WorkloadOutcome> {
        let Some(thread) = self.thread.take() else {
            return Err(HarnessError::AlreadyJoined {
                session: self.id.clone(),
            });
        };

        let result = thread.join().unwrap_or_else(|_| {
            Err(HarnessError::SessionPanicked {
                session: self.id.clone(),
            })
        });

        let (decision, level) = match &result {
            Ok(_) => ("SESSION_JOIN", LogLevel::Info),
            Err(_) => ("SESSION_JOIN_ERROR", LogLevel::Warn),
        };
        let message = match &result {
            Ok(outcome) => format!(
                "session {} joined after {:?} ({} results)",
                self.id,
                self.launched_at.elapsed(),
                outcome.results.len()
            ),
            Err(err) => format!("session {} joined with error: {err}", self.id),
        };
        self.logger.log_phase_event(
            PhaseEventInput::new(
                ScenarioPhase::Running,
                message,
                PhaseContext::decision_only(decision)
                    .port(self.target_port)
                    .session(&self.id),
            )
            .level(level),
        );
        result
    }

    /// Close the session's connection and end local sleeps and spins.
    pub fn terminate(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(shutdown) = &self.shutdown {
            shutdown.shutdown();
        }
        self.logger
            .log_session(&self.id, LogLevel::Info, "terminated by harness");
    }

    /// Give up on the session without joining it.
    pub fn abandon(mut self) {
        if self.thread.take().is_some() {
            self.terminate();
            self.logger
                .log_session(&self.id, LogLevel::Info, "abandoned");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.thread.take().is_some() {
            self.logger
                .log_session(&self.id, LogLevel::Warn, "dropped without join; abandoning");
            self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ServerClient;
    use crate::harness::logging::TestLoggerBuilder;
    use crate::workload::{OpResult, Operation, Spin, Workload, workload_fn};
    use std::sync::Mutex;

    /// In-memory client: counts documents, blocks on `Count` with a forever
    /// spin until shut down.
    struct MockClient {
        port: u16,
        docs: Arc<Mutex<u64>>,
        closed: Arc<AtomicBool>,
    }

    impl ServerClient for MockClient {
        fn port(&self) -> u16 {
            self.port
        }

        fn execute(&mut self, op: &Operation) -> HarnessResult<OpResult> {
            if self.closed.load(Ordering::Relaxed) {
                return Err(HarnessError::ConnectionClosed { port: self.port });
            }
            match op {
                Operation::Insert { documents, .. } => {
                    *self.docs.lock().unwrap() += documents.len() as u64;
                    Ok(OpResult::Ack {
                        n: documents.len() as u64,
                    })
                }
                Operation::Remove { .. } => {
                    let mut docs = self.docs.lock().unwrap();
                    let n = *docs;
                    *docs = 0;
                    Ok(OpResult::Ack { n })
                }
                Operation::Count {
                    spin: Some(Spin::Forever),
                    ..
                } => {
                    while !self.closed.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(HarnessError::ConnectionClosed { port: self.port })
                }
                Operation::Count { .. } => Ok(OpResult::Count {
                    n: *self.docs.lock().unwrap(),
                }),
                _ => Ok(OpResult::Pong),
            }
        }

        fn shutdown_handle(&self) -> Option<ShutdownHandle> {
            let closed = Arc::clone(&self.closed);
            Some(ShutdownHandle::new(move || closed.store(true, Ordering::Relaxed)))
        }
    }

    struct MockConnector {
        docs: Arc<Mutex<u64>>,
        refuse: bool,
    }

    impl Connector for MockConnector {
        fn connect(&self, port: u16) -> HarnessResult<Box<dyn ServerClient>> {
            if self.refuse {
                return Err(HarnessError::ConnectFailed {
                    port,
                    reason: "refused".to_string(),
                });
            }
            Ok(Box::new(MockClient {
                port,
                docs: Arc::clone(&self.docs),
                closed: Arc::new(AtomicBool::new(false)),
            }))
        }
    }

    fn runner(refuse: bool) -> (SessionRunner, Arc<Mutex<u64>>) {
        let docs = Arc::new(Mutex::new(0));
        let logger = TestLoggerBuilder::new("session_tests")
            .no_files()
            .print_realtime(false)
            .build();
        let connector = Arc::new(MockConnector {
            docs: Arc::clone(&docs),
            refuse,
        });
        (
            SessionRunner::new(connector, logger, Duration::from_secs(2)),
            docs,
        )
    }

    #[test]
    fn test_join_returns_workload_results() {
        let (runner, docs) = runner(false);
        *docs.lock().unwrap() = 5;
        let workload = Workload::new("remove-all")
            .sleep(Duration::from_millis(5))
            .remove("test.c", serde_json::json!({}), false);

        let mut session = runner.launch(30001, workload).unwrap();
        let outcome = session.join().unwrap();
        assert_eq!(outcome.workload, "remove-all");
        assert_eq!(outcome.last(), Some(&OpResult::Ack { n: 5 }));
        assert_eq!(*docs.lock().unwrap(), 0);
        assert!(session.is_finished());
    }

    #[test]
    fn test_second_join_is_already_joined() {
        let (runner, _) = runner(false);
        let mut session = runner
            .launch(30001, Workload::new("ping").op(Operation::Ping))
            .unwrap();
        session.join().unwrap();
        let err = session.join().unwrap_err();
        assert!(matches!(err, HarnessError::AlreadyJoined { ref session } if session == "s1"));
    }

    #[test]
    fn test_launch_failure_is_reported() {
        let (runner, _) = runner(true);
        let err = runner
            .launch(30001, Workload::new("ping").op(Operation::Ping))
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::ConnectFailed { .. }));
    }

    #[test]
    fn test_terminate_releases_blocked_session() {
        let (runner, _) = runner(false);
        let workload = Workload::new("infinite-count").count(
            "test.jstests_killall",
            serde_json::json!({}),
            Some(Spin::Forever),
        );
        let mut session = runner.launch(30001, workload).unwrap();
        assert!(!session.wait_finished(Duration::from_millis(50)));

        session.terminate();
        let err = session.join().unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_terminate_stops_local_spin() {
        let (runner, _) = runner(false);
        let mut session = runner
            .launch(30001, Workload::new("spin").spin(Spin::Forever))
            .unwrap();
        session.terminate();
        assert!(session.join().is_err());
    }

    #[test]
    fn test_closure_workloads() {
        let (runner, _) = runner(false);
        let mut session = runner
            .launch(
                30001,
                workload_fn("insert-then-count", |client: &mut dyn ServerClient| {
                    client.insert("test.a", vec![serde_json::json!({"a": 1})])?;
                    Ok(vec![OpResult::Count {
                        n: client.count("test.a", serde_json::Value::Null)?,
                    }])
                }),
            )
            .unwrap();
        let outcome = session.join().unwrap();
        assert_eq!(outcome.results, vec![OpResult::Count { n: 1 }]);
    }

    fn explode(_client: &mut dyn ServerClient) -> HarnessResult<Vec<OpResult>> {
        panic!("workload exploded")
    }

    #[test]
    fn test_panicking_workload_is_reported() {
        let (runner, _) = runner(false);
        let mut session = runner.launch(30001, workload_fn("boom", explode)).unwrap();
        assert!(matches!(
            session.join(),
            Err(HarnessError::SessionPanicked { .. })
        ));
    }

    #[test]
    fn test_drop_without_join_abandons() {
        let (runner, _) = runner(false);
        let logger = runner.logger.clone();
        let session = runner
            .launch(30001, Workload::new("spin").spin(Spin::Forever))
            .unwrap();
        drop(session);
        assert_eq!(logger.search("dropped without join").len(), 1);
    }

    #[test]
    fn test_abandon_is_silent() {
        let (runner, _) = runner(false);
        let logger = runner.logger.clone();
        let session = runner
            .launch(30001, Workload::new("spin").spin(Spin::Forever))
            .unwrap();
        session.abandon();
        assert!(logger.search("dropped without join").is_empty());
        assert_eq!(logger.search("abandoned").len(), 1);
    }
}
