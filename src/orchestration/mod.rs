//! Combinator layer.
//!
//! [`Flow`] describes a composition, [`Engine`] binds it to tracker nodes and
//! drives it, and [`Recipe`] produces the named demonstration flows.

mod engine;
mod flow;
mod recipe;

pub use engine::{Engine, Plan, Sink};
pub use flow::{Effect, Flow, Project, RetryPolicy, Transform};
pub use recipe::{Recipe, RecipeKind};
