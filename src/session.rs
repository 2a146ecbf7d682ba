//! Orchestration session.
//!
//! A session owns at most one running recipe. Each request gets a fresh
//! tracker tree and supersedes the previous run: the old run is cancelled,
//! its tree stops changing, and it never settles the session.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::core::tracker::{Tracker, TreeSnapshot};
use crate::diagnostics::Diagnostics;
use crate::error::{Failure, TaskResult};
use crate::orchestration::{Engine, Recipe, RecipeKind};
use crate::transport::Transport;
use crate::{cflog, cflog_debug, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum Outcome {
    Success { values: Vec<Value> },
    Failure { failure: Failure },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn values(&self) -> &[Value] {
        match self {
            Outcome::Success { values } => values,
            Outcome::Failure { .. } => &[],
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { failure } => Some(failure),
        }
    }
}

impl From<TaskResult<Vec<Value>>> for Outcome {
    fn from(result: TaskResult<Vec<Value>>) -> Self {
        match result {
            Ok(values) => Outcome::Success { values },
            Err(failure) => Outcome::Failure { failure },
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success { values } => write!(f, "success ({} values)", values.len()),
            Outcome::Failure { failure } => write!(f, "failure: {}", failure),
        }
    }
}

/// Session lifecycle: `Idle → Building → Running → Settled`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum Phase {
    #[default]
    Idle,
    Building,
    Running,
    Settled(Outcome),
}

impl Phase {
    pub fn is_settled(&self) -> bool {
        matches!(self, Phase::Settled(_))
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Building => write!(f, "building"),
            Phase::Running => write!(f, "running"),
            Phase::Settled(outcome) => write!(f, "settled ({})", outcome),
        }
    }
}

/// Published session state.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SessionState {
    /// Run the phase belongs to; `None` while idle.
    pub run: Option<RunId>,
    pub phase: Phase,
}

struct ActiveRun {
    id: RunId,
    cancel: CancellationToken,
    tracker: Tracker,
}

/// Handle to one requested run.
pub struct RunHandle {
    id: RunId,
    tree: watch::Receiver<TreeSnapshot>,
    task: JoinHandle<Option<Outcome>>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Live snapshots of this run's tree.
    pub fn tree(&self) -> watch::Receiver<TreeSnapshot> {
        self.tree.clone()
    }

    /// Wait for the run to settle.
    ///
    /// Returns [`Error::Superseded`] if a newer request replaced the run.
    pub async fn outcome(self) -> Result<Outcome> {
        match self.task.await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Err(Error::Superseded(self.id)),
            Err(e) => Err(Error::TaskJoin(e.to_string())),
        }
    }
}

/// Owns the current run and publishes its lifecycle.
pub struct Session {
    transport: Arc<dyn Transport>,
    config: Config,
    diagnostics: Diagnostics,
    state: Arc<watch::Sender<SessionState>>,
    current: Option<ActiveRun>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            transport,
            config,
            diagnostics: Diagnostics::new(),
            state: Arc::new(state),
            current: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Receive the session state after every phase change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Current snapshot of the active run's tree (empty before any request).
    pub fn tree(&self) -> TreeSnapshot {
        self.current
            .as_ref()
            .map(|run| run.tracker.snapshot())
            .unwrap_or_default()
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.current.as_ref().map(|run| run.id)
    }

    /// Start the standard recipe for `kind`.
    pub fn request_kind(&mut self, kind: RecipeKind) -> Result<RunHandle> {
        let recipe = Recipe::standard(kind, &self.config);
        self.request(recipe)
    }

    /// Supersede any current run and start `recipe`.
    ///
    /// The new tree is fully built (every node `Pending`) before the phase
    /// moves to `Running`. Must be called from within a Tokio runtime.
    pub fn request(&mut self, recipe: Recipe) -> Result<RunHandle> {
        self.cancel_current();
        self.diagnostics.clear();

        let id = RunId::new();
        cflog!("session: run {} requested ({})", id.short(), recipe.kind());
        self.publish(Some(id), Phase::Building);

        let tracker = Tracker::new();
        let engine = Engine::new(tracker.clone(), self.diagnostics.clone());
        let flow = recipe.build(self.transport.clone(), &self.config, &self.diagnostics);
        let plan = match engine.bind(flow) {
            Ok(plan) => plan,
            Err(e) => {
                self.publish(None, Phase::Idle);
                return Err(e);
            }
        };
        let tree = tracker.subscribe();
        self.publish(Some(id), Phase::Running);

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            let state = self.state.clone();
            async move {
                let outcome: Outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cflog_debug!("session: run {} dropped", id.short());
                        return None;
                    }
                    result = engine.run(&plan) => result.into(),
                };

                let settled = state.send_if_modified(|current| {
                    if current.run != Some(id) || current.phase != Phase::Running {
                        return false;
                    }
                    current.phase = Phase::Settled(outcome.clone());
                    true
                });
                if settled {
                    cflog!("session: run {} settled: {}", id.short(), outcome);
                }
                Some(outcome)
            }
        });

        self.current = Some(ActiveRun {
            id,
            cancel,
            tracker,
        });
        Ok(RunHandle { id, tree, task })
    }

    /// Cancel the current run, clear diagnostics and return to `Idle`.
    pub fn reset(&mut self) {
        self.cancel_current();
        self.diagnostics.clear();
        self.publish(None, Phase::Idle);
    }

    fn cancel_current(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.cancel.cancel();
            cflog!("session: run {} superseded", previous.id.short());
        }
    }

    fn publish(&self, run: Option<RunId>, phase: Phase) {
        cflog_debug!(
            "session: {} -> {}",
            run.map(|r| r.short()).unwrap_or_else(|| "-".into()),
            phase
        );
        self.state.send_replace(SessionState { run, phase });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(run) = self.current.take() {
            run.cancel.cancel();
        }
    }
}
