//! Journal recovery after a hard kill yields the same data files a clean
//! shutdown of a non-durable server writes.

mod common;

use std::time::Duration;

use dbrace_common::harness::{ExitOutcome, list_directory};
use dbrace_common::{Scenario, ServerConfig, StopMode, sleep};
use serde_json::{Value, json};

const NS: &str = "test.foo";

#[test]
fn test_recovered_files_match_clean_shutdown() {
    let report = Scenario::run("durability_quick", common::config(), |s| {
        let ports = s.allocate_ports(3)?;
        let nodur = s.data_dir("dur1testnodur")?;
        let dur = s.data_dir("dur1testdur")?;
        let timeout = s.servers().stop_timeout();

        // Reference files from a clean, non-durable run.
        let mut plain = s.servers().start(ServerConfig::new(ports[0], &nodur))?;
        s.client(ports[0])?.insert(NS, vec![json!({ "x": 1 })])?;
        let status = s.servers().stop(&mut plain, StopMode::Graceful, timeout)?;
        s.verifier()
            .assert_exit_code(&status, s.interrupt_exit_code(), "non-durable stop")?;

        let mut durable = s
            .servers()
            .start(ServerConfig::new(ports[1], &dur).durable())?;
        s.mark_running()?;
        s.client(ports[1])?.insert(NS, vec![json!({ "x": 1 })])?;
        // Let a group commit reach the journal before the kill.
        sleep(Duration::from_millis(400));

        let status = s.servers().stop(&mut durable, StopMode::Forceful, timeout)?;
        s.verifier().assert(
            matches!(status.outcome, ExitOutcome::Signaled(9)),
            "durable server died by SIGKILL",
        )?;
        let journal = dur.join("journal");
        let entries = list_directory(&journal)?.unwrap_or_default();
        s.logger()
            .info(format!("journal after kill: [{}]", entries.join(", ")));
        s.verifier()
            .assert(!entries.is_empty(), "journal survives a hard kill")?;

        s.mark_teardown()?;
        let mut recovered = s
            .servers()
            .restart(durable, ServerConfig::new(ports[2], &dur).durable())?;
        let count = s.client(ports[2])?.count(NS, Value::Null)?;
        s.verifier()
            .assert_eq(&count, &1, "recovered document count")?;
        let status = s
            .servers()
            .stop(&mut recovered, StopMode::Graceful, timeout)?;
        s.verifier()
            .assert_exit_code(&status, s.interrupt_exit_code(), "recovered stop")?;

        s.verifier()
            .assert_absent(&journal, "journal removed after clean shutdown")?;
        for file in ["test.ns", "test.0"] {
            s.verifier().assert_files_identical(
                &nodur.join(file),
                &dur.join(file),
                &format!("{file} matches the non-durable run"),
            )?;
        }
        Ok(())
    });
    common::assert_verified(&report);
}

#[test]
fn test_durable_clean_restart_keeps_every_insert() {
    let report = Scenario::run("durability_clean_restart", common::config(), |s| {
        let port = s.allocate_ports(1)?[0];
        let dbpath = s.data_dir("durclean")?;
        let timeout = s.servers().stop_timeout();

        let mut server = s
            .servers()
            .start(ServerConfig::new(port, &dbpath).durable())?;
        s.mark_running()?;
        let mut client = s.client(port)?;
        let inserted = common::insert_sequential(client.as_mut(), NS, 1200)?;
        client.remove(NS, json!({ "_id": 7 }), false)?;
        drop(client);

        s.mark_teardown()?;
        let status = s.servers().stop(&mut server, StopMode::Graceful, timeout)?;
        s.verifier()
            .assert_exit_code(&status, s.interrupt_exit_code(), "durable stop")?;
        s.verifier()
            .assert_absent(&dbpath.join("journal"), "journal removed on clean shutdown")?;

        let mut server = s
            .servers()
            .restart(server, ServerConfig::new(port, &dbpath).durable())?;
        let count = s.client(port)?.count(NS, Value::Null)?;
        s.verifier()
            .assert_eq(&count, &(inserted - 1), "documents after restart")?;
        s.servers().stop(&mut server, StopMode::Graceful, timeout)?;
        Ok(())
    });
    common::assert_verified(&report);
}
