//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Engines wired to a fresh tracker and diagnostics sink
//! - Leaves that finish after a fixed delay
//! - Leaves that follow a script across retries

use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use callflow::config::Config;
use callflow::core::{Task, Tracker, TreeSnapshot};
use callflow::diagnostics::Diagnostics;
use callflow::orchestration::{Engine, Flow};
use callflow::transport::{SimulatedTransport, Transport};
use callflow::{Session, TaskResult};

/// An engine with its own tracker and diagnostics.
pub fn engine() -> Engine {
    Engine::new(Tracker::new(), Diagnostics::new())
}

pub fn snapshot(engine: &Engine) -> TreeSnapshot {
    engine.tracker().snapshot()
}

/// A leaf that settles with `result` after `ms` milliseconds.
pub fn delayed(label: &str, ms: u64, result: TaskResult<Value>) -> Flow {
    Task::new(move || {
        let result = result.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            result
        }
    })
    .with_label(label)
    .into()
}

/// A leaf returning the next scripted result on each invocation; the last
/// result repeats. The counter tracks invocations.
pub fn scripted(label: &str, results: Vec<TaskResult<Value>>) -> (Flow, Arc<AtomicU32>) {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let flow = Task::new(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
        let result = results
            .get(n)
            .or_else(|| results.last())
            .cloned()
            .unwrap_or(Ok(Value::Null));
        async move { result }
    })
    .with_label(label)
    .into();
    (flow, invocations)
}

/// A request leaf against `transport` with no call delay.
pub fn request(transport: &SimulatedTransport, label: &str, endpoint: &str) -> Flow {
    let transport: Arc<dyn Transport> = Arc::new(transport.clone());
    Task::request(transport, endpoint, Duration::ZERO)
        .with_label(label)
        .into()
}

/// A session over the placeholder transport with the given timings.
pub fn placeholder_session(config: Config) -> Session {
    let transport = SimulatedTransport::placeholder(config.transport_latency());
    Session::new(Arc::new(transport), config)
}
