//! Combinator engine.
//!
//! The engine turns a [`Flow`] into a [`Plan`] by creating one tracker node
//! per task and combinator, in pre-order and declaration order, before
//! anything runs. Driving the plan then walks the same structure, moving each
//! node through its lifecycle as the underlying futures make progress.
//!
//! Everything runs inside the single future returned by [`Engine::run`];
//! concurrent members are interleaved, never spawned. Cancelling a member
//! means dropping its future and marking its subtree cancelled.

use crate::core::task::{Status, Task};
use crate::core::tracker::{NodeId, Tracker};
use crate::diagnostics::Diagnostics;
use crate::error::{CancelReason, Failure, Result, TaskResult};
use crate::orchestration::flow::{Effect, Flow, Project, RetryPolicy, Transform};
use crate::{cflog_debug, cflog_trace, cflog_warn};
use futures::future::{try_join_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Receives the values a plan emits, in emission order.
pub type Sink<'a> = dyn Fn(Value) + Send + Sync + 'a;

/// A flow bound to tracker nodes, ready to be driven.
pub struct Plan {
    node: NodeId,
    step: Step,
}

enum Step {
    Task(Task),
    Sequence(Vec<Plan>),
    Concurrent(Vec<Plan>),
    ForkJoin(Vec<Plan>),
    Switch {
        source: Box<Plan>,
        project: Project,
        inners: InnerSlots,
    },
    Retry { inner: Box<Plan>, policy: RetryPolicy },
    Recover { inner: Box<Plan>, fallback: Value },
    Map { inner: Box<Plan>, transform: Transform },
    Tap { inner: Box<Plan>, effect: Effect },
    Delay { inner: Box<Plan>, by: Duration },
}

/// Inner plans a switchMap has bound, by trigger position, with the value
/// that produced each.
type InnerSlots = Mutex<Vec<(Value, Arc<Plan>)>>;

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::Task(_) => "task",
            Step::Sequence(_) => "sequence",
            Step::Concurrent(_) => "concurrent",
            Step::ForkJoin(_) => "forkJoin",
            Step::Switch { .. } => "switchMap",
            Step::Retry { .. } => "retry",
            Step::Recover { .. } => "catchError",
            Step::Map { .. } => "map",
            Step::Tap { .. } => "tap",
            Step::Delay { .. } => "delay",
        }
    }
}

impl Plan {
    /// Tracker node of the outermost task or combinator.
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("node", &self.node)
            .field("step", &self.step.name())
            .finish()
    }
}

enum SwitchEvent {
    Trigger(Value),
    SourceDone(TaskResult<()>),
    InnerDone(TaskResult<()>),
}

type Inner<'a> = Option<(NodeId, BoxFuture<'a, TaskResult<()>>)>;

/// Binds flows to a tracker and drives the resulting plans.
#[derive(Clone)]
pub struct Engine {
    tracker: Tracker,
    diagnostics: Diagnostics,
    /// Number of unlabelled leaves named so far (`call1`, `call2`, ...).
    calls: Arc<AtomicUsize>,
}

impl Engine {
    pub fn new(tracker: Tracker, diagnostics: Diagnostics) -> Self {
        Self {
            tracker,
            diagnostics,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Create the tracker tree for `flow`.
    ///
    /// Fails if the tracker already holds a tree; an engine binds one root.
    pub fn bind(&self, flow: Flow) -> Result<Plan> {
        let (label, detail) = self.node_label(&flow);
        let node = self.tracker.add_root(label, detail)?;
        let plan = self.bind_at(flow, node);
        cflog_debug!(
            "engine: bound {:?} into {} nodes",
            plan,
            self.tracker.snapshot().iter().count()
        );
        Ok(plan)
    }

    /// Bind and run `flow`, returning every value it emitted.
    pub async fn execute(&self, flow: Flow) -> Result<Vec<Value>> {
        let plan = self.bind(flow)?;
        Ok(self.run(&plan).await?)
    }

    /// Drive `plan` to completion, collecting its emitted values.
    pub async fn run(&self, plan: &Plan) -> TaskResult<Vec<Value>> {
        let values = Mutex::new(Vec::new());
        let collect = |value: Value| {
            values
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value)
        };
        self.drive(plan, &collect).await?;
        Ok(values.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    /// Drive `plan`, passing each emitted value to `sink`.
    ///
    /// The plan's node enters `Running` first and ends `Done` or `Error` with
    /// the returned result. Nodes already cancelled stay cancelled.
    pub fn drive<'a>(&'a self, plan: &'a Plan, sink: &'a Sink<'a>) -> BoxFuture<'a, TaskResult<()>> {
        async move {
            self.tracker.start(plan.node);
            let result = match &plan.step {
                Step::Task(task) => task.invoke().await.map(|value| sink(value)),
                Step::Sequence(members) => self.run_sequence(members, sink).await,
                Step::Concurrent(members) => self.run_concurrent(members, sink).await,
                Step::ForkJoin(members) => self.run_fork_join(members, sink).await,
                Step::Switch {
                    source,
                    project,
                    inners,
                } => self.run_switch(plan.node, source, project, inners, sink).await,
                Step::Retry { inner, policy } => self.run_retry(inner, policy, sink).await,
                Step::Recover { inner, fallback } => {
                    self.run_recover(inner, fallback, sink).await
                }
                Step::Map { inner, transform } => {
                    let mapped = |value: Value| sink(transform(value));
                    self.drive(inner, &mapped).await
                }
                Step::Tap { inner, effect } => {
                    let observed = |value: Value| {
                        effect(&value);
                        sink(value)
                    };
                    self.drive(inner, &observed).await
                }
                Step::Delay { inner, by } => self.run_delay(inner, *by, sink).await,
            };
            self.settle(plan, &result);
            result
        }
        .boxed()
    }

    fn settle(&self, plan: &Plan, result: &TaskResult<()>) {
        match result {
            Ok(()) => {
                self.tracker.complete(plan.node);
            }
            Err(failure) => {
                if matches!(plan.step, Step::Task(_)) {
                    let label = self.tracker.node(plan.node).map(|n| n.label);
                    cflog_warn!(
                        "engine: {} failed: {}",
                        label.as_deref().unwrap_or("task"),
                        failure
                    );
                }
                self.tracker.fail(plan.node, failure.clone());
            }
        }
    }

    async fn run_sequence(&self, members: &[Plan], sink: &Sink<'_>) -> TaskResult<()> {
        for member in members {
            self.drive(member, sink).await?;
        }
        Ok(())
    }

    async fn run_concurrent(&self, members: &[Plan], sink: &Sink<'_>) -> TaskResult<()> {
        let mut in_flight: FuturesUnordered<_> =
            members.iter().map(|member| self.drive(member, sink)).collect();

        while let Some(result) = in_flight.next().await {
            if let Err(failure) = result {
                drop(in_flight);
                self.cancel_members(members, CancelReason::SiblingFailed);
                return Err(failure);
            }
        }
        Ok(())
    }

    async fn run_fork_join(&self, members: &[Plan], sink: &Sink<'_>) -> TaskResult<()> {
        let slots: Vec<Mutex<Option<Value>>> = members.iter().map(|_| Mutex::new(None)).collect();

        let joined = try_join_all(members.iter().zip(&slots).map(|(member, slot)| async move {
            let keep_last = |value: Value| {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
            };
            self.drive(member, &keep_last).await
        }))
        .await;

        if let Err(failure) = joined {
            self.cancel_members(members, CancelReason::SiblingFailed);
            return Err(failure);
        }

        let values = slots
            .into_iter()
            .map(|slot| {
                slot.into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .unwrap_or(Value::Null)
            })
            .collect();
        sink(Value::Array(values));
        Ok(())
    }

    async fn run_switch(
        &self,
        node: NodeId,
        source: &Plan,
        project: &Project,
        inners: &InnerSlots,
        sink: &Sink<'_>,
    ) -> TaskResult<()> {
        let (tx, mut triggers) = mpsc::unbounded_channel();
        let forward = move |value: Value| {
            let _ = tx.send(value);
        };
        let mut source_run = self.drive(source, &forward);
        let mut source_done = false;
        let mut inner: Inner<'_> = None;
        let mut position = 0;

        loop {
            let event = {
                let inner_run = async {
                    match inner.as_mut() {
                        Some((_, run)) => run.await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    Some(value) = triggers.recv() => SwitchEvent::Trigger(value),
                    result = &mut source_run, if !source_done => SwitchEvent::SourceDone(result),
                    result = inner_run => SwitchEvent::InnerDone(result),
                }
            };

            match event {
                SwitchEvent::Trigger(value) => {
                    let plan = self.inner_plan(node, project, inners, position, &value);
                    position += 1;
                    self.switch_inner(plan, sink, &mut inner);
                }
                SwitchEvent::SourceDone(Ok(())) => {
                    source_done = true;
                    // Values emitted in the source's final poll are still queued.
                    while let Ok(value) = triggers.try_recv() {
                        let plan = self.inner_plan(node, project, inners, position, &value);
                        position += 1;
                        self.switch_inner(plan, sink, &mut inner);
                    }
                    if inner.is_none() {
                        return Ok(());
                    }
                }
                SwitchEvent::SourceDone(Err(failure)) => {
                    if let Some((active, run)) = inner.take() {
                        drop(run);
                        self.tracker.cancel(active, CancelReason::SiblingFailed);
                    }
                    return Err(failure);
                }
                SwitchEvent::InnerDone(Ok(())) => {
                    inner = None;
                    if source_done {
                        return Ok(());
                    }
                }
                SwitchEvent::InnerDone(Err(failure)) => {
                    if !source_done {
                        drop(source_run);
                        self.tracker.cancel(source.node, CancelReason::SiblingFailed);
                    }
                    return Err(failure);
                }
            }
        }
    }

    /// Plan for the trigger at `position`.
    ///
    /// A retried switchMap sees its triggers again; while the value at a
    /// position repeats, the inner plan bound for it last time runs again on
    /// the same tracker nodes.
    fn inner_plan(
        &self,
        node: NodeId,
        project: &Project,
        inners: &InnerSlots,
        position: usize,
        value: &Value,
    ) -> Arc<Plan> {
        let lock = || inners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((seen, plan)) = lock().get(position) {
            if seen == value {
                return Arc::clone(plan);
            }
        }

        let plan = Arc::new(self.bind_under(project(value), node));
        let mut slots = lock();
        let slot = (value.clone(), Arc::clone(&plan));
        if position < slots.len() {
            slots[position] = slot;
        } else {
            slots.push(slot);
        }
        plan
    }

    /// Cancel the active inner flow, if any, and start `plan`.
    fn switch_inner<'a>(&'a self, plan: Arc<Plan>, sink: &'a Sink<'a>, inner: &mut Inner<'a>) {
        if let Some((previous, run)) = inner.take() {
            drop(run);
            let cancelled = self.tracker.cancel(previous, CancelReason::Superseded);
            cflog_debug!(
                "engine: switchMap superseded node {} ({} cancelled)",
                previous.index(),
                cancelled
            );
        }
        let started = plan.node;
        let run = async move { self.drive(&plan, sink).await }.boxed();
        *inner = Some((started, run));
    }

    async fn run_retry(&self, inner: &Plan, policy: &RetryPolicy, sink: &Sink<'_>) -> TaskResult<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.drive(inner, sink).await {
                Ok(()) => return Ok(()),
                Err(failure) if policy.should_retry(attempts) => {
                    cflog_debug!(
                        "engine: attempt {}/{} failed ({}), retrying in {:?}",
                        attempts,
                        policy.max_attempts(),
                        failure,
                        policy.delay
                    );
                    if !policy.delay.is_zero() {
                        tokio::time::sleep(policy.delay).await;
                    }
                    self.tracker.rearm(inner.node);
                }
                Err(failure) => {
                    return Err(Failure::RetriesExhausted {
                        last: Box::new(failure),
                        attempts,
                    })
                }
            }
        }
    }

    async fn run_recover(&self, inner: &Plan, fallback: &Value, sink: &Sink<'_>) -> TaskResult<()> {
        if let Err(failure) = self.drive(inner, sink).await {
            cflog_debug!("engine: recovered from {}", failure);
            self.diagnostics.record("Error caught: ", &failure);
            sink(fallback.clone());
        }
        Ok(())
    }

    async fn run_delay(&self, inner: &Plan, by: Duration, sink: &Sink<'_>) -> TaskResult<()> {
        let held = Mutex::new(Vec::new());
        let hold = |value: Value| held.lock().unwrap_or_else(PoisonError::into_inner).push(value);
        self.drive(inner, &hold).await?;

        if !by.is_zero() {
            tokio::time::sleep(by).await;
        }
        for value in held.into_inner().unwrap_or_else(PoisonError::into_inner) {
            sink(value);
        }
        Ok(())
    }

    /// Cancel the members that were started. A member that never got polled
    /// was never invoked and stays `Pending`.
    fn cancel_members(&self, members: &[Plan], reason: CancelReason) {
        let cancelled: usize = members
            .iter()
            .filter(|member| !matches!(self.tracker.status(member.node), Some(Status::Pending)))
            .map(|member| self.tracker.cancel(member.node, reason))
            .sum();
        if cancelled > 0 {
            cflog_debug!("engine: cancelled {} nodes ({})", cancelled, reason);
        }
    }

    fn bind_under(&self, flow: Flow, parent: NodeId) -> Plan {
        let (label, detail) = self.node_label(&flow);
        let node = self.tracker.attach(parent, label, detail);
        self.bind_at(flow, node)
    }

    fn bind_all(&self, flows: impl IntoIterator<Item = Flow>, parent: NodeId) -> Vec<Plan> {
        flows
            .into_iter()
            .map(|flow| self.bind_under(flow, parent))
            .collect()
    }

    fn bind_at(&self, flow: Flow, node: NodeId) -> Plan {
        let step = match flow {
            Flow::Task(task) => Step::Task(task),
            Flow::Concat(members) => Step::Sequence(self.bind_all(members, node)),
            Flow::Merge(members) => Step::Concurrent(self.bind_all(members, node)),
            Flow::ForkJoin(members) => Step::ForkJoin(self.bind_all(members, node)),
            Flow::ConcatMap { inputs, project } => {
                Step::Sequence(self.bind_all(inputs.iter().map(|v| project(v)), node))
            }
            Flow::MergeMap { inputs, project } => {
                Step::Concurrent(self.bind_all(inputs.iter().map(|v| project(v)), node))
            }
            Flow::SwitchMap { source, project } => Step::Switch {
                source: Box::new(self.bind_under(*source, node)),
                project,
                inners: Mutex::new(Vec::new()),
            },
            Flow::Retry { inner, policy } => Step::Retry {
                inner: Box::new(self.bind_under(*inner, node)),
                policy,
            },
            Flow::Recover { inner, fallback } => Step::Recover {
                inner: Box::new(self.bind_under(*inner, node)),
                fallback,
            },
            Flow::Map { inner, transform } => Step::Map {
                inner: Box::new(self.bind_under(*inner, node)),
                transform,
            },
            Flow::Tap { inner, effect } => Step::Tap {
                inner: Box::new(self.bind_under(*inner, node)),
                effect,
            },
            Flow::Delay { inner, by } => Step::Delay {
                inner: Box::new(self.bind_under(*inner, node)),
                by,
            },
        };
        cflog_trace!("engine: node {} is a {}", node.index(), step.name());
        Plan { node, step }
    }

    fn node_label(&self, flow: &Flow) -> (String, Option<String>) {
        match flow {
            Flow::Task(task) => {
                let label = match task.label() {
                    Some(label) => label.to_string(),
                    None => format!("call{}", self.calls.fetch_add(1, Ordering::SeqCst) + 1),
                };
                (label, task.detail().map(str::to_string))
            }
            other => (other.combinator_name().unwrap_or("flow").to_string(), None),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tracker", &self.tracker)
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}
