//! Core domain models: units of work and the status tree that tracks them.

pub mod task;
pub mod tracker;

pub use task::{Status, Task, TaskFuture, Thunk};
pub use tracker::{NodeId, NodeView, Tracker, TrackerNode, TrackerTree, TreeSnapshot};
