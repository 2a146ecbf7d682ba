//! Combinator expressions.
//!
//! A [`Flow`] is a declarative description of how tasks compose. It does
//! nothing by itself: the engine binds it once into a plan (creating one
//! tracker node per task, in declaration order) and then drives the plan.

use crate::core::task::Task;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Maps an input value to the flow that should handle it.
pub type Project = Arc<dyn Fn(&Value) -> Flow + Send + Sync>;

/// Rewrites every value a flow emits.
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Observes every value a flow emits.
pub type Effect = Arc<dyn Fn(&Value) + Send + Sync>;

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    /// Wait between a failed attempt and the next one.
    #[serde(with = "millis")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Whether another attempt follows `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A composition of tasks.
#[derive(Clone)]
pub enum Flow {
    /// A single unit of work.
    Task(Task),
    /// Run members one after another; stop at the first failure.
    Concat(Vec<Flow>),
    /// Run members all at once; the first failure cancels the rest.
    Merge(Vec<Flow>),
    /// Run members all at once and emit one array of their last values.
    ForkJoin(Vec<Flow>),
    /// Concat over `project(input)` for each input.
    ConcatMap { inputs: Vec<Value>, project: Project },
    /// Merge over `project(input)` for each input.
    MergeMap { inputs: Vec<Value>, project: Project },
    /// Start `project(value)` for every value `source` emits, cancelling the
    /// previous inner flow if it has not finished.
    SwitchMap { source: Box<Flow>, project: Project },
    Retry { inner: Box<Flow>, policy: RetryPolicy },
    /// Swap a failure of `inner` for `fallback`.
    Recover { inner: Box<Flow>, fallback: Value },
    Map { inner: Box<Flow>, transform: Transform },
    Tap { inner: Box<Flow>, effect: Effect },
    /// Hold the values of `inner` until `by` after it completes.
    Delay { inner: Box<Flow>, by: Duration },
}

impl Flow {
    pub fn task(task: Task) -> Self {
        Flow::Task(task)
    }

    pub fn concat(members: impl IntoIterator<Item = Flow>) -> Self {
        Flow::Concat(members.into_iter().collect())
    }

    pub fn merge(members: impl IntoIterator<Item = Flow>) -> Self {
        Flow::Merge(members.into_iter().collect())
    }

    pub fn fork_join(members: impl IntoIterator<Item = Flow>) -> Self {
        Flow::ForkJoin(members.into_iter().collect())
    }

    pub fn concat_map<F>(inputs: impl IntoIterator<Item = Value>, project: F) -> Self
    where
        F: Fn(&Value) -> Flow + Send + Sync + 'static,
    {
        Flow::ConcatMap {
            inputs: inputs.into_iter().collect(),
            project: Arc::new(project),
        }
    }

    pub fn merge_map<F>(inputs: impl IntoIterator<Item = Value>, project: F) -> Self
    where
        F: Fn(&Value) -> Flow + Send + Sync + 'static,
    {
        Flow::MergeMap {
            inputs: inputs.into_iter().collect(),
            project: Arc::new(project),
        }
    }

    pub fn switch_map<F>(self, project: F) -> Self
    where
        F: Fn(&Value) -> Flow + Send + Sync + 'static,
    {
        Flow::SwitchMap {
            source: Box::new(self),
            project: Arc::new(project),
        }
    }

    pub fn retry(self, policy: RetryPolicy) -> Self {
        Flow::Retry {
            inner: Box::new(self),
            policy,
        }
    }

    pub fn recover(self, fallback: Value) -> Self {
        Flow::Recover {
            inner: Box::new(self),
            fallback,
        }
    }

    pub fn map<F>(self, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Flow::Map {
            inner: Box::new(self),
            transform: Arc::new(transform),
        }
    }

    pub fn tap<F>(self, effect: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Flow::Tap {
            inner: Box::new(self),
            effect: Arc::new(effect),
        }
    }

    pub fn delay(self, by: Duration) -> Self {
        Flow::Delay {
            inner: Box::new(self),
            by,
        }
    }

    /// Label of the tracker node for this combinator, if it is not a task.
    pub fn combinator_name(&self) -> Option<&'static str> {
        Some(match self {
            Flow::Task(_) => return None,
            Flow::Concat(_) => "concat",
            Flow::Merge(_) => "merge",
            Flow::ForkJoin(_) => "forkJoin",
            Flow::ConcatMap { .. } => "concatMap",
            Flow::MergeMap { .. } => "mergeMap",
            Flow::SwitchMap { .. } => "switchMap",
            Flow::Retry { .. } => "retry",
            Flow::Recover { .. } => "catchError",
            Flow::Map { .. } => "map",
            Flow::Tap { .. } => "tap",
            Flow::Delay { .. } => "delay",
        })
    }
}

impl From<Task> for Flow {
    fn from(task: Task) -> Self {
        Flow::Task(task)
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flow::Task(task) => std::fmt::Debug::fmt(task, f),
            Flow::Concat(members) | Flow::Merge(members) | Flow::ForkJoin(members) => f
                .debug_tuple(self.combinator_name().unwrap_or_default())
                .field(members)
                .finish(),
            Flow::ConcatMap { inputs, .. } | Flow::MergeMap { inputs, .. } => f
                .debug_struct(self.combinator_name().unwrap_or_default())
                .field("inputs", inputs)
                .finish_non_exhaustive(),
            Flow::SwitchMap { source, .. } => f
                .debug_struct("switchMap")
                .field("source", source)
                .finish_non_exhaustive(),
            Flow::Retry { inner, policy } => f
                .debug_struct("retry")
                .field("inner", inner)
                .field("policy", policy)
                .finish(),
            Flow::Recover { inner, fallback } => f
                .debug_struct("catchError")
                .field("inner", inner)
                .field("fallback", fallback)
                .finish(),
            Flow::Delay { inner, by } => f
                .debug_struct("delay")
                .field("inner", inner)
                .field("by", by)
                .finish(),
            Flow::Map { inner, .. } | Flow::Tap { inner, .. } => f
                .debug_struct(self.combinator_name().unwrap_or_default())
                .field("inner", inner)
                .finish_non_exhaustive(),
        }
    }
}
