//! Client seam to the server collaborator.
//!
//! The harness never interprets operations: it opens a connection on a port,
//! issues an [`Operation`], and reads back an [`OpResult`] or an error.

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::errors::{HarnessError, HarnessResult};
use crate::protocol::{self, MAX_LINE_BYTES, Request, Response};
use crate::workload::{CollectionStats, ExplainStats, OpResult, Operation, SortSpec, Spin};

/// Closes a live connection from another thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<dyn Fn() + Send + Sync>);

impl ShutdownHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn shutdown(&self) {
        (self.0)()
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShutdownHandle")
    }
}

/// A connected client.
pub trait ServerClient: Send {
    /// Port of the server this client talks to.
    fn port(&self) -> u16;

    /// Issue one operation and wait for its result.
    fn execute(&mut self, op: &Operation) -> HarnessResult<OpResult>;

    /// Handle that aborts in-flight and future calls on this connection.
    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        None
    }

    fn ping(&mut self) -> HarnessResult<()> {
        match self.execute(&Operation::Ping)? {
            OpResult::Pong => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    fn insert(&mut self, ns: &str, documents: Vec<Value>) -> HarnessResult<u64> {
        let op = Operation::Insert {
            ns: ns.to_string(),
            documents,
        };
        expect_n(self.execute(&op)?, "insert")
    }

    fn remove(&mut self, ns: &str, filter: Value, atomic: bool) -> HarnessResult<u64> {
        let op = Operation::Remove {
            ns: ns.to_string(),
            filter,
            atomic,
        };
        expect_n(self.execute(&op)?, "remove")
    }

    fn update(
        &mut self,
        ns: &str,
        filter: Value,
        update: Value,
        upsert: bool,
        multi: bool,
    ) -> HarnessResult<u64> {
        let op = Operation::Update {
            ns: ns.to_string(),
            filter,
            update,
            upsert,
            multi,
        };
        expect_n(self.execute(&op)?, "update")
    }

    fn find(
        &mut self,
        ns: &str,
        filter: Value,
        sort: Option<SortSpec>,
    ) -> HarnessResult<Vec<Value>> {
        let op = Operation::Find {
            ns: ns.to_string(),
            filter,
            sort,
            spin: None,
            explain: false,
        };
        let result = self.execute(&op)?;
        match result {
            OpResult::Documents { docs } => Ok(docs),
            other => Err(unexpected("find", &other)),
        }
    }

    fn explain(
        &mut self,
        ns: &str,
        filter: Value,
        sort: Option<SortSpec>,
        spin: Option<Spin>,
    ) -> HarnessResult<ExplainStats> {
        let op = Operation::Find {
            ns: ns.to_string(),
            filter,
            sort,
            spin,
            explain: true,
        };
        match self.execute(&op)? {
            OpResult::Explain(stats) => Ok(stats),
            other => Err(unexpected("explain", &other)),
        }
    }

    fn count(&mut self, ns: &str, filter: Value) -> HarnessResult<u64> {
        let op = Operation::Count {
            ns: ns.to_string(),
            filter,
            spin: None,
        };
        expect_n(self.execute(&op)?, "count")
    }

    fn drop_collection(&mut self, ns: &str) -> HarnessResult<()> {
        self.execute(&Operation::Drop { ns: ns.to_string() })
            .map(|_| ())
    }

    fn stats(&mut self, ns: &str) -> HarnessResult<CollectionStats> {
        match self.execute(&Operation::Stats { ns: ns.to_string() })? {
            OpResult::Stats(stats) => Ok(stats),
            other => Err(unexpected("stats", &other)),
        }
    }
}

fn expect_n(result: OpResult, op: &str) -> HarnessResult<u64> {
    match result {
        OpResult::Ack { n } | OpResult::Count { n } => Ok(n),
        other => Err(unexpected(op, &other)),
    }
}

fn unexpected(op: &str, result: &OpResult) -> HarnessError {
    HarnessError::Protocol(format!("unexpected result for {op}: {result:?}"))
}

/// Opens clients to servers by port.
pub trait Connector: Send + Sync {
    fn connect(&self, port: u16) -> HarnessResult<Box<dyn ServerClient>>;
}

/// Default connector speaking the newline-delimited JSON protocol.
#[derive(Debug, Clone)]
pub struct JsonLineConnector {
    host: String,
    connect_timeout: Duration,
}

impl JsonLineConnector {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            connect_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn open(&self, port: u16) -> HarnessResult<JsonLineClient> {
        let addr = (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| HarnessError::ConnectFailed {
                port,
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| HarnessError::ConnectFailed {
                port,
                reason: format!("{} did not resolve", self.host),
            })?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|e| {
            HarnessError::ConnectFailed {
                port,
                reason: e.to_string(),
            }
        })?;
        stream.set_nodelay(true)?;
        JsonLineClient::new(port, stream)
    }
}

impl Connector for JsonLineConnector {
    fn connect(&self, port: u16) -> HarnessResult<Box<dyn ServerClient>> {
        Ok(Box::new(self.open(port)?))
    }
}

/// A blocking JSON-line client over one TCP connection.
pub struct JsonLineClient {
    port: u16,
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    next_id: u64,
}

impl JsonLineClient {
    pub fn new(port: u16, stream: TcpStream) -> HarnessResult<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            port,
            writer: stream,
            reader,
            next_id: 1,
        })
    }

    fn read_response(&mut self) -> HarnessResult<Response> {
        let mut line = String::new();
        let read = self
            .reader
            .by_ref()
            .take(MAX_LINE_BYTES as u64)
            .read_line(&mut line);
        let n = read.map_err(|e| self.disconnect_or(e))?;
        if n == 0 {
            return Err(HarnessError::ConnectionClosed { port: self.port });
        }
        if !line.ends_with('\n') {
            return Err(HarnessError::Protocol(format!(
                "response from port {} exceeded {} bytes or was truncated",
                self.port, MAX_LINE_BYTES
            )));
        }
        protocol::decode_line(&line)
    }

    fn disconnect_or(&self, err: std::io::Error) -> HarnessError {
        let error = HarnessError::Io(err);
        if error.is_disconnect() {
            HarnessError::ConnectionClosed { port: self.port }
        } else {
            error
        }
    }
}

impl ServerClient for JsonLineClient {
    fn port(&self) -> u16 {
        self.port
    }

    fn execute(&mut self, op: &Operation) -> HarnessResult<OpResult> {
        if op.is_local() {
            return Err(HarnessError::Protocol(format!(
                "{} runs inside the session and is never sent",
                op.name()
            )));
        }
        let id = self.next_id;
        self.next_id += 1;

        let line = protocol::encode_line(&Request { id, op: op.clone() })?;
        let written = self.writer.write_all(line.as_bytes());
        let written = written.and_then(|()| self.writer.flush());
        written.map_err(|e| self.disconnect_or(e))?;

        let response = self.read_response()?;
        if response.id != id {
            return Err(HarnessError::Protocol(format!(
                "response id {} does not match request {id}",
                response.id
            )));
        }
        response.into_result(self.port)
    }

    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        let stream = self.writer.try_clone().ok()?;
        Some(ShutdownHandle::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }
}
