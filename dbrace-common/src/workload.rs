//! Workload descriptors.
//!
//! A workload is an ordered list of abstract client operations. The harness
//! sequences and times them; the server decides what they mean. `Sleep` and
//! `Spin` never leave the session: they shape timing on the client side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::ServerClient;
use crate::errors::{HarnessError, HarnessResult};

/// Iterations of the inner busy loop per spin step.
pub const SPIN_STEP_ITERATIONS: u64 = 1_000;

/// Sort order on a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    /// 1 for ascending, -1 for descending.
    pub direction: i8,
}

impl SortSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: 1,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: -1,
        }
    }
}

/// CPU-bound busy work used to widen race windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Spin {
    /// Run this many spin steps.
    Iterations { count: u64 },
    /// Keep spinning until the wall-clock budget is spent.
    Duration { millis: u64 },
    /// Never finish on its own.
    Forever,
}

impl Spin {
    /// True when this spin can only end by interruption.
    pub fn is_unbounded(&self) -> bool {
        matches!(self, Self::Forever)
    }

    /// Spin until done or until `stop` is raised.
    ///
    /// Returns the number of completed steps, or `None` when interrupted.
    pub fn run(&self, stop: &AtomicBool) -> Option<u64> {
        let started = Instant::now();
        let mut steps = 0u64;
        loop {
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            let done = match *self {
                Self::Iterations { count } => steps >= count,
                Self::Duration { millis } => started.elapsed() >= Duration::from_millis(millis),
                Self::Forever => false,
            };
            if done {
                return Some(steps);
            }
            spin_step();
            steps += 1;
        }
    }
}

/// One unit of busy work that the optimizer cannot remove.
pub fn spin_step() {
    let mut acc = 0u64;
    for i in 0..SPIN_STEP_ITERATIONS {
        acc = std::hint::black_box(acc.wrapping_add(i));
    }
    std::hint::black_box(acc);
}

/// One client operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Insert {
        ns: String,
        documents: Vec<Value>,
    },
    Remove {
        ns: String,
        #[serde(default)]
        filter: Value,
        #[serde(default)]
        atomic: bool,
    },
    Update {
        ns: String,
        #[serde(default)]
        filter: Value,
        update: Value,
        #[serde(default)]
        upsert: bool,
        #[serde(default)]
        multi: bool,
    },
    Find {
        ns: String,
        #[serde(default)]
        filter: Value,
        #[serde(default)]
        sort: Option<SortSpec>,
        #[serde(default)]
        spin: Option<Spin>,
        #[serde(default)]
        explain: bool,
    },
    Count {
        ns: String,
        #[serde(default)]
        filter: Value,
        #[serde(default)]
        spin: Option<Spin>,
    },
    Drop {
        ns: String,
    },
    Stats {
        ns: String,
    },
    Ping,
    /// Pause the session.
    Sleep {
        millis: u64,
    },
    /// Busy-loop inside the session.
    Spin {
        spin: Spin,
    },
}

impl Operation {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Remove { .. } => "remove",
            Self::Update { .. } => "update",
            Self::Find { explain: true, .. } => "explain",
            Self::Find { .. } => "find",
            Self::Count { .. } => "count",
            Self::Drop { .. } => "drop",
            Self::Stats { .. } => "stats",
            Self::Ping => "ping",
            Self::Sleep { .. } => "sleep",
            Self::Spin { .. } => "spin",
        }
    }

    /// True for operations executed by the session itself.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Sleep { .. } | Self::Spin { .. })
    }
}

/// Statistics returned by an explained find.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainStats {
    /// Documents returned.
    pub n: u64,
    /// Documents examined.
    pub n_scanned: u64,
    /// Times the scan released the store lock.
    pub n_yields: u64,
    pub millis: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub ns: String,
    pub count: u64,
    pub size: u64,
}

/// Result of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpResult {
    Ack { n: u64 },
    Documents { docs: Vec<Value> },
    Count { n: u64 },
    Explain(ExplainStats),
    Stats(CollectionStats),
    Pong,
    Slept { millis: u64 },
    Spun { iterations: u64 },
}

impl OpResult {
    /// Affected or counted documents, when the result carries one.
    pub fn n(&self) -> Option<u64> {
        match self {
            Self::Ack { n } | Self::Count { n } => Some(*n),
            Self::Documents { docs } => Some(docs.len() as u64),
            Self::Explain(stats) => Some(stats.n),
            Self::Stats(stats) => Some(stats.count),
            _ => None,
        }
    }

    pub fn explain(&self) -> Option<&ExplainStats> {
        match self {
            Self::Explain(stats) => Some(stats),
            _ => None,
        }
    }

    pub fn into_documents(self) -> Option<Vec<Value>> {
        match self {
            Self::Documents { docs } => Some(docs),
            _ => None,
        }
    }
}

/// Raised by a session's owner to end local sleeps and spins early.
pub type StopFlag = Arc<AtomicBool>;

/// What a joined session hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadOutcome {
    pub workload: String,
    pub results: Vec<OpResult>,
    pub elapsed: Duration,
}

impl WorkloadOutcome {
    pub fn last(&self) -> Option<&OpResult> {
        self.results.last()
    }
}

/// Anything a session can run against a connected client.
pub trait SessionWorkload: Send + 'static {
    fn name(&self) -> &str;

    fn run(
        self: Box<Self>,
        client: &mut dyn ServerClient,
        stop: &AtomicBool,
    ) -> HarnessResult<Vec<OpResult>>;
}

/// A named, repeatable operation sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    pub operations: Vec<Operation>,
    /// How many times the sequence runs.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

fn default_repeat() -> u32 {
    1
}

impl Workload {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
            repeat: 1,
        }
    }

    pub fn op(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn repeat(mut self, times: u32) -> Self {
        self.repeat = times.max(1);
        self
    }

    pub fn sleep(self, duration: Duration) -> Self {
        self.op(Operation::Sleep {
            millis: duration.as_millis() as u64,
        })
    }

    pub fn spin(self, spin: Spin) -> Self {
        self.op(Operation::Spin { spin })
    }

    pub fn insert(self, ns: impl Into<String>, documents: Vec<Value>) -> Self {
        self.op(Operation::Insert {
            ns: ns.into(),
            documents,
        })
    }

    pub fn remove(self, ns: impl Into<String>, filter: Value, atomic: bool) -> Self {
        self.op(Operation::Remove {
            ns: ns.into(),
            filter,
            atomic,
        })
    }

    pub fn count(self, ns: impl Into<String>, filter: Value, spin: Option<Spin>) -> Self {
        self.op(Operation::Count {
            ns: ns.into(),
            filter,
            spin,
        })
    }

    pub fn drop_collection(self, ns: impl Into<String>) -> Self {
        self.op(Operation::Drop { ns: ns.into() })
    }

    /// True when some operation can only end by interruption.
    pub fn is_unbounded(&self) -> bool {
        self.operations.iter().any(|op| match op {
            Operation::Spin { spin }
            | Operation::Count {
                spin: Some(spin), ..
            }
            | Operation::Find {
                spin: Some(spin), ..
            } => spin.is_unbounded(),
            _ => false,
        })
    }
}

impl SessionWorkload for Workload {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        self: Box<Self>,
        client: &mut dyn ServerClient,
        stop: &AtomicBool,
    ) -> HarnessResult<Vec<OpResult>> {
        let mut results = Vec::with_capacity(self.operations.len() * self.repeat as usize);
        for _ in 0..self.repeat {
            for op in &self.operations {
                results.push(run_operation(client, op, stop)?);
            }
        }
        Ok(results)
    }
}

/// A workload backed by a closure.
pub struct FnWorkload<F> {
    name: String,
    body: F,
}

/// Wrap a closure as a session workload.
pub fn workload_fn<F>(name: impl Into<String>, body: F) -> FnWorkload<F>
where
    F: FnOnce(&mut dyn ServerClient) -> HarnessResult<Vec<OpResult>> + Send + 'static,
{
    FnWorkload {
        name: name.into(),
        body,
    }
}

impl<F> SessionWorkload for FnWorkload<F>
where
    F: FnOnce(&mut dyn ServerClient) -> HarnessResult<Vec<OpResult>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        self: Box<Self>,
        client: &mut dyn ServerClient,
        _stop: &AtomicBool,
    ) -> HarnessResult<Vec<OpResult>> {
        (self.body)(client)
    }
}

/// Run a single operation, handling local primitives in-process.
pub fn run_operation(
    client: &mut dyn ServerClient,
    op: &Operation,
    stop: &AtomicBool,
) -> HarnessResult<OpResult> {
    match op {
        Operation::Sleep { millis } => {
            let deadline = Instant::now() + Duration::from_millis(*millis);
            while Instant::now() < deadline {
                if stop.load(Ordering::Relaxed) {
                    return Err(HarnessError::Protocol("session terminated".to_string()));
                }
                let left = deadline.saturating_duration_since(Instant::now());
                std::thread::sleep(left.min(Duration::from_millis(10)));
            }
            Ok(OpResult::Slept { millis: *millis })
        }
        Operation::Spin { spin } => match spin.run(stop) {
            Some(iterations) => Ok(OpResult::Spun { iterations }),
            None => Err(HarnessError::Protocol("session terminated".to_string())),
        },
        _ => client.execute(op),
    }
}
