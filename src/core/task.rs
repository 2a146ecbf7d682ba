//! Units of work and their lifecycle status.
//!
//! A [`Task`] is a deferred asynchronous operation: nothing happens until it
//! is invoked, and it can be invoked again for a retry. Its observable
//! lifecycle is tracked separately, as a [`Status`] on a tracker node.

use crate::error::Failure;
use crate::transport::Transport;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Future returned by a single task invocation.
pub type TaskFuture = BoxFuture<'static, Result<Value, Failure>>;

/// Invocation thunk shared by every attempt of a task.
pub type Thunk = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Task status in its lifecycle.
///
/// `Pending` until the first invocation, `Running` while in flight, then
/// `Done` or `Error`. An `Error` carrying [`Failure::Cancelled`] marks a task
/// that was aborted rather than one that failed on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Done,
    Error {
        failure: Failure,
    },
}

impl Status {
    /// Icon name handed to presentation layers.
    pub fn icon(&self) -> &'static str {
        match self {
            Status::Pending => "flat-arrow",
            Status::Running => "sync",
            Status::Done => "check",
            Status::Error { .. } => "close",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Error { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Status::Error { failure } if failure.is_cancellation())
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Status::Error { failure } => Some(failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Running => write!(f, "running"),
            Status::Done => write!(f, "done"),
            Status::Error { failure } => write!(f, "error: {}", failure),
        }
    }
}

/// A single deferred asynchronous unit of work.
#[derive(Clone)]
pub struct Task {
    label: Option<String>,
    detail: Option<String>,
    thunk: Thunk,
}

impl Task {
    /// Create a task from an invocation closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Failure>> + Send + 'static,
    {
        Self {
            label: None,
            detail: None,
            thunk: Arc::new(move || f().boxed()),
        }
    }

    /// A task that succeeds immediately with `value`.
    pub fn value(value: Value) -> Self {
        Self::new(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// A task that fails immediately with `failure`.
    pub fn failing(failure: Failure) -> Self {
        Self::new(move || {
            let failure = failure.clone();
            async move { Err(failure) }
        })
    }

    /// A task that asks `transport` for `endpoint`.
    ///
    /// Successful values are held for `call_delay` before the task completes;
    /// failures surface immediately.
    pub fn request(
        transport: Arc<dyn Transport>,
        endpoint: impl Into<String>,
        call_delay: Duration,
    ) -> Self {
        let endpoint = endpoint.into();
        let detail = endpoint.clone();
        Self::new(move || {
            let response = transport.request(&endpoint);
            async move {
                let value = response.await?;
                if !call_delay.is_zero() {
                    tokio::time::sleep(call_delay).await;
                }
                Ok(value)
            }
        })
        .with_detail(detail)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Start one attempt.
    pub fn invoke(&self) -> TaskFuture {
        (self.thunk)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("detail", &self.detail)
            .finish_non_exhaustive()
    }
}
