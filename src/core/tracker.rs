//! Status tree mirroring the shape of a task composition.
//!
//! Nodes live in a petgraph arena with stable indices: composite and leaf
//! tasks each hold the [`NodeId`] of their own node and update it in place.
//! Edges run parent → child and are never removed, so the tree only grows
//! (and only during construction, apart from latest-only inner tasks).
//!
//! [`Tracker`] wraps the arena for shared use and publishes an immutable
//! [`TreeSnapshot`] after every mutation, so observers never touch live state.

use crate::cflog_trace;
use crate::core::task::Status;
use crate::error::{CancelReason, Error, Failure, Result};
use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Stable handle to a node in a [`TrackerTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(NodeIndex);

impl NodeId {
    /// Creation index of the node (0 for the root).
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// Observable execution state of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerNode {
    pub label: String,
    pub detail: Option<String>,
    pub status: Status,
    /// Number of times the node entered `Running`.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrackerNode {
    fn new(label: String, detail: Option<String>) -> Self {
        Self {
            label,
            detail,
            status: Status::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Arena of tracker nodes forming a single tree.
#[derive(Debug, Default)]
pub struct TrackerTree {
    graph: DiGraph<TrackerNode, ()>,
    root: Option<NodeIndex>,
    version: u64,
}

impl TrackerTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root.map(NodeId)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of mutations applied so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn add_root(&mut self, label: impl Into<String>, detail: Option<String>) -> Result<NodeId> {
        if self.root.is_some() {
            return Err(Error::Validation("tracker tree already has a root".into()));
        }
        let index = self.graph.add_node(TrackerNode::new(label.into(), detail));
        self.root = Some(index);
        self.version += 1;
        Ok(NodeId(index))
    }

    pub fn add_child(
        &mut self,
        parent: NodeId,
        label: impl Into<String>,
        detail: Option<String>,
    ) -> Result<NodeId> {
        if self.graph.node_weight(parent.0).is_none() {
            return Err(Error::Validation(format!(
                "unknown parent node {}",
                parent.index()
            )));
        }
        let index = self.graph.add_node(TrackerNode::new(label.into(), detail));
        self.graph.add_edge(parent.0, index, ());
        self.version += 1;
        Ok(NodeId(index))
    }

    fn add_detached(&mut self, label: String, detail: Option<String>) -> NodeId {
        let index = self.graph.add_node(TrackerNode::new(label, detail));
        self.version += 1;
        NodeId(index)
    }

    pub fn get(&self, id: NodeId) -> Option<&TrackerNode> {
        self.graph.node_weight(id.0)
    }

    /// Children in creation (declaration) order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut children: Vec<NodeId> = self
            .graph
            .neighbors_directed(id.0, Direction::Outgoing)
            .map(NodeId)
            .collect();
        // petgraph yields the newest edge first; indices follow creation order.
        children.sort();
        children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.graph
            .neighbors_directed(id.0, Direction::Incoming)
            .next()
            .map(NodeId)
    }

    /// Enter `Running` for a new attempt.
    ///
    /// Allowed from `Pending` and from a non-cancelled terminal status (a
    /// retry re-invokes the same nodes). Returns whether the node changed.
    pub fn start(&mut self, id: NodeId) -> bool {
        let Some(node) = self.graph.node_weight_mut(id.0) else {
            return false;
        };
        if matches!(node.status, Status::Running) || node.status.is_cancelled() {
            return false;
        }
        node.status = Status::Running;
        node.attempts += 1;
        node.started_at = Some(Utc::now());
        node.finished_at = None;
        cflog_trace!("tracker: {} -> running (attempt {})", node.label, node.attempts);
        self.version += 1;
        true
    }

    /// `Running → Done`. Ignored in any other status.
    pub fn complete(&mut self, id: NodeId) -> bool {
        self.finish(id, Status::Done)
    }

    /// `Running → Error`. Ignored in any other status.
    pub fn fail(&mut self, id: NodeId, failure: Failure) -> bool {
        self.finish(id, Status::Error { failure })
    }

    fn finish(&mut self, id: NodeId, status: Status) -> bool {
        let Some(node) = self.graph.node_weight_mut(id.0) else {
            return false;
        };
        if !matches!(node.status, Status::Running) {
            return false;
        }
        cflog_trace!("tracker: {} -> {}", node.label, status);
        node.status = status;
        node.finished_at = Some(Utc::now());
        self.version += 1;
        true
    }

    /// Mark a subtree as cancelled.
    ///
    /// The node itself is cancelled unless it already finished; below it only
    /// `Running` nodes are touched, since unstarted descendants were never
    /// invoked. Returns the number of nodes changed.
    pub fn cancel(&mut self, id: NodeId, reason: CancelReason) -> usize {
        let mut changed = 0;
        let mut stack = vec![(id, true)];
        while let Some((current, is_top)) = stack.pop() {
            if let Some(node) = self.graph.node_weight_mut(current.0) {
                let cancel = if is_top {
                    !node.status.is_terminal()
                } else {
                    matches!(node.status, Status::Running)
                };
                if cancel {
                    node.status = Status::Error {
                        failure: Failure::cancelled(reason),
                    };
                    node.finished_at = Some(Utc::now());
                    cflog_trace!("tracker: {} cancelled ({})", node.label, reason);
                    changed += 1;
                }
            }
            stack.extend(self.children(current).into_iter().map(|c| (c, false)));
        }
        if changed > 0 {
            self.version += 1;
        }
        changed
    }

    /// Return cancelled nodes in a subtree to `Pending` ahead of a retry.
    ///
    /// Cancellation is otherwise final; only a fresh attempt of an enclosing
    /// retry may clear it. Returns the number of nodes changed.
    pub fn rearm(&mut self, id: NodeId) -> usize {
        let mut changed = 0;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.graph.node_weight_mut(current.0) {
                if node.status.is_cancelled() {
                    node.status = Status::Pending;
                    node.finished_at = None;
                    changed += 1;
                }
            }
            stack.extend(self.children(current));
        }
        if changed > 0 {
            self.version += 1;
        }
        changed
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            version: self.version,
            root: self.root.map(|r| self.view(NodeId(r))),
        }
    }

    fn view(&self, id: NodeId) -> NodeView {
        let node = &self.graph[id.0];
        NodeView {
            id: id.index(),
            label: node.label.clone(),
            detail: node.detail.clone(),
            status: node.status.clone(),
            attempts: node.attempts,
            children: self
                .children(id)
                .into_iter()
                .map(|c| self.view(c))
                .collect(),
        }
    }
}

/// Read-only copy of one node and its subtree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub id: usize,
    pub label: String,
    pub detail: Option<String>,
    pub status: Status,
    pub attempts: u32,
    pub children: Vec<NodeView>,
}

impl NodeView {
    /// Depth-first, pre-order walk of this subtree.
    pub fn iter(&self) -> impl Iterator<Item = &NodeView> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }

    pub fn child_labels(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.label.as_str()).collect()
    }
}

/// Immutable picture of a whole tree at one version.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TreeSnapshot {
    pub version: u64,
    pub root: Option<NodeView>,
}

impl TreeSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &NodeView> {
        self.root.iter().flat_map(|r| r.iter())
    }

    /// First node (pre-order) with the given label.
    pub fn find(&self, label: &str) -> Option<&NodeView> {
        self.iter().find(|n| n.label == label)
    }

    pub fn status_of(&self, label: &str) -> Option<&Status> {
        self.find(label).map(|n| &n.status)
    }

    /// True when no node is left `Running`.
    pub fn is_quiescent(&self) -> bool {
        self.iter().all(|n| !matches!(n.status, Status::Running))
    }
}

/// Shared, observable handle to a [`TrackerTree`].
///
/// The lock is only held for the duration of a single mutation, never across
/// an await point.
#[derive(Clone)]
pub struct Tracker {
    tree: Arc<Mutex<TrackerTree>>,
    updates: Arc<watch::Sender<TreeSnapshot>>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(TreeSnapshot::default());
        Self {
            tree: Arc::new(Mutex::new(TrackerTree::new())),
            updates: Arc::new(updates),
        }
    }

    /// Receive a fresh snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<TreeSnapshot> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.lock().snapshot()
    }

    pub fn add_root(&self, label: impl Into<String>, detail: Option<String>) -> Result<NodeId> {
        self.mutate(|tree| tree.add_root(label, detail))
    }

    pub fn add_child(
        &self,
        parent: NodeId,
        label: impl Into<String>,
        detail: Option<String>,
    ) -> Result<NodeId> {
        self.mutate(|tree| tree.add_child(parent, label, detail))
    }

    /// Add a child under a node this tracker handed out.
    ///
    /// Unlike [`Tracker::add_child`] this cannot fail: a parent from another
    /// tree leaves the new node detached instead of erroring.
    pub(crate) fn attach(&self, parent: NodeId, label: String, detail: Option<String>) -> NodeId {
        self.mutate(|tree| {
            tree.add_child(parent, label.clone(), detail.clone())
                .unwrap_or_else(|_| tree.add_detached(label, detail))
        })
    }

    pub fn start(&self, id: NodeId) -> bool {
        self.mutate(|tree| tree.start(id))
    }

    pub fn complete(&self, id: NodeId) -> bool {
        self.mutate(|tree| tree.complete(id))
    }

    pub fn fail(&self, id: NodeId, failure: Failure) -> bool {
        self.mutate(|tree| tree.fail(id, failure))
    }

    pub fn cancel(&self, id: NodeId, reason: CancelReason) -> usize {
        self.mutate(|tree| tree.cancel(id, reason))
    }

    pub fn rearm(&self, id: NodeId) -> usize {
        self.mutate(|tree| tree.rearm(id))
    }

    pub fn status(&self, id: NodeId) -> Option<Status> {
        self.lock().get(id).map(|n| n.status.clone())
    }

    pub fn node(&self, id: NodeId) -> Option<TrackerNode> {
        self.lock().get(id).cloned()
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut TrackerTree) -> T) -> T {
        let mut tree = self.lock();
        let before = tree.version();
        let out = f(&mut tree);
        if tree.version() != before {
            self.updates.send_replace(tree.snapshot());
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, TrackerTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("nodes", &self.lock().len())
            .finish()
    }
}
