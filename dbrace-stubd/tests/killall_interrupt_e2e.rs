//! Terminating a server interrupts a never-ending operation promptly.
//!
//! One session counts with a spin that only ends by interruption while a
//! second drops the collection. The server must exit with the interrupt code
//! without escalation, and the drop must survive a restart.

mod common;

use std::time::Duration;

use dbrace_common::{HarnessError, Scenario, ServerConfig, Spin, StopMode, Workload, sleep};
use serde_json::{Value, json};

const NS: &str = "test.jstests_disk_killall";

#[test]
fn test_terminate_interrupts_infinite_count() {
    let report = Scenario::run("killall_interrupt", common::config(), |s| {
        let port = s.allocate_ports(1)?[0];
        let dbpath = s.data_dir("jstests_disk_killall")?;
        let mut server = s.servers().start(ServerConfig::new(port, &dbpath))?;
        let mut client = s.client(port)?;
        client.insert(NS, vec![json!({})])?;
        s.mark_running()?;

        let forever = Workload::new("count-forever").count(NS, Value::Null, Some(Spin::Forever));
        let mut counter = s.sessions().launch(port, forever)?;
        sleep(Duration::from_secs(1));

        let dropper = Workload::new("drop").drop_collection(NS);
        let mut dropping = s.sessions().launch(port, dropper)?;
        sleep(Duration::from_secs(1));

        let timeout = s.servers().stop_timeout();
        let status = s.servers().stop(&mut server, StopMode::Graceful, timeout)?;
        s.verifier().assert_exit_code(
            &status,
            s.interrupt_exit_code(),
            "server stops quickly while evaluating an infinite count",
        )?;

        let counted = counter.join();
        s.logger()
            .info(format!("infinite count ended with {counted:?}"));
        s.verifier().assert(
            matches!(
                counted,
                Err(HarnessError::ServerError { .. } | HarnessError::ConnectionClosed { .. })
            ),
            "infinite count ends with an error",
        )?;
        dropping.join()?;
        drop(client);

        s.mark_teardown()?;
        let mut server = s
            .servers()
            .restart(server, ServerConfig::new(port, &dbpath))?;
        let mut client = s.client(port)?;
        let stats = client.stats(NS)?;
        s.verifier()
            .assert_eq(&stats.count, &0, "collection still dropped after restart")?;
        client.drop_collection(NS)?;

        let status = s.servers().stop(&mut server, StopMode::Graceful, timeout)?;
        s.verifier()
            .assert_exit_code(&status, s.interrupt_exit_code(), "second graceful stop")?;
        Ok(())
    });
    common::assert_verified(&report);
}

#[test]
fn test_interrupted_operation_reports_shutdown_code() {
    let report = Scenario::run("killall_shutdown_code", common::config(), |s| {
        let port = s.allocate_ports(1)?[0];
        let dbpath = s.data_dir("shutdown_code")?;
        let mut server = s.servers().start(ServerConfig::new(port, &dbpath))?;
        let mut client = s.client(port)?;
        client.insert(NS, vec![json!({ "_id": 1 })])?;
        s.mark_running()?;

        let spinner = Workload::new("find-forever").op(dbrace_common::Operation::Find {
            ns: NS.to_string(),
            filter: Value::Null,
            sort: None,
            spin: Some(Spin::Forever),
            explain: false,
        });
        let mut finder = s.sessions().launch(port, spinner)?;
        sleep(Duration::from_millis(500));
        s.verifier()
            .assert(!finder.is_finished(), "spinning find is still running")?;

        s.mark_teardown()?;
        let timeout = s.servers().stop_timeout();
        let status = s.servers().stop(&mut server, StopMode::Graceful, timeout)?;
        s.verifier()
            .assert_exit_code(&status, s.interrupt_exit_code(), "graceful stop")?;

        match finder.join() {
            Err(HarnessError::ServerError { code, .. }) => s.verifier().assert_eq(
                &code,
                &dbrace_common::protocol::CODE_INTERRUPTED_AT_SHUTDOWN,
                "interrupted find error code",
            )?,
            Err(HarnessError::ConnectionClosed { .. }) => {
                s.logger()
                    .warn("server exited before the interruption reply was written");
            }
            other => {
                return Err(HarnessError::assertion(
                    "spinning find outcome",
                    &format!("{other:?}"),
                    &"interrupted".to_string(),
                ));
            }
        }
        Ok(())
    });
    common::assert_verified(&report);
}
