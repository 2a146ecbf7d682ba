//! Named demonstration recipes.
//!
//! A [`Recipe`] is resolved once into a [`Flow`]; the session binds that flow
//! into a plan and drives it. Standard recipes target the JSONPlaceholder
//! endpoint space answered by the simulated transport.

use crate::config::Config;
use crate::core::task::Task;
use crate::diagnostics::Diagnostics;
use crate::orchestration::flow::{Flow, RetryPolicy};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Which recipe to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RecipeKind {
    Normal,
    Tap,
    Map,
    Concat,
    ConcatMap,
    Merge,
    MergeMap,
    SwitchMap,
    ForkJoin,
    Retry,
    CatchError,
}

impl RecipeKind {
    pub const ALL: [RecipeKind; 11] = [
        RecipeKind::Normal,
        RecipeKind::Tap,
        RecipeKind::Map,
        RecipeKind::Concat,
        RecipeKind::ConcatMap,
        RecipeKind::Merge,
        RecipeKind::MergeMap,
        RecipeKind::SwitchMap,
        RecipeKind::ForkJoin,
        RecipeKind::Retry,
        RecipeKind::CatchError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RecipeKind::Normal => "normal",
            RecipeKind::Tap => "tap",
            RecipeKind::Map => "map",
            RecipeKind::Concat => "concat",
            RecipeKind::ConcatMap => "concat-map",
            RecipeKind::Merge => "merge",
            RecipeKind::MergeMap => "merge-map",
            RecipeKind::SwitchMap => "switch-map",
            RecipeKind::ForkJoin => "fork-join",
            RecipeKind::Retry => "retry",
            RecipeKind::CatchError => "catch-error",
        }
    }

    /// One-line description for listings.
    pub fn summary(&self) -> &'static str {
        match self {
            RecipeKind::Normal => "A single request for the posts of user 1",
            RecipeKind::Tap => "Observe each value without changing it (counts the posts)",
            RecipeKind::Map => "Rewrite each value before emitting (keeps the first 3 posts)",
            RecipeKind::Concat => "Run requests one after the other, emitting each result",
            RecipeKind::ConcatMap => "Request each comment id in turn, one at a time",
            RecipeKind::Merge => "Run requests all at once, emitting in completion order",
            RecipeKind::MergeMap => "Request every comment id at once",
            RecipeKind::SwitchMap => "Fetch a post, then switch to its author",
            RecipeKind::ForkJoin => "Run requests at once and emit all results together",
            RecipeKind::Retry => "Re-issue a failing request with a fixed delay",
            RecipeKind::CatchError => "Replace a failed request with a fallback value",
        }
    }
}

impl std::fmt::Display for RecipeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A recipe with its parameters.
///
/// Templates substitute `{id}` with the input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Recipe {
    Normal {
        endpoint: String,
    },
    Tap {
        endpoint: String,
    },
    Map {
        endpoint: String,
        take: usize,
    },
    Concat {
        endpoints: Vec<String>,
    },
    ConcatMap {
        ids: Vec<u64>,
        template: String,
    },
    Merge {
        endpoints: Vec<String>,
    },
    MergeMap {
        ids: Vec<u64>,
        template: String,
    },
    SwitchMap {
        source: String,
        /// Field of the source value that fills the template.
        key: String,
        template: String,
    },
    ForkJoin {
        endpoint: String,
        straggler: String,
    },
    Retry {
        endpoint: String,
        policy: RetryPolicy,
    },
    CatchError {
        endpoint: String,
        failing: String,
        fallback: Value,
    },
}

fn endpoints(list: &[&str]) -> Vec<String> {
    list.iter().map(|e| e.to_string()).collect()
}

impl Recipe {
    /// The demonstration parameters for `kind`.
    pub fn standard(kind: RecipeKind, config: &Config) -> Self {
        match kind {
            RecipeKind::Normal => Recipe::Normal {
                endpoint: "users/1/posts".into(),
            },
            RecipeKind::Tap => Recipe::Tap {
                endpoint: "users/1/posts".into(),
            },
            RecipeKind::Map => Recipe::Map {
                endpoint: "users/1/posts".into(),
                take: 3,
            },
            RecipeKind::Concat => Recipe::Concat {
                endpoints: endpoints(&["users/2", "users/2/posts", "users/2/albums"]),
            },
            RecipeKind::ConcatMap => Recipe::ConcatMap {
                ids: vec![1, 2, 3],
                template: "comments/{id}".into(),
            },
            RecipeKind::Merge => Recipe::Merge {
                endpoints: endpoints(&["users/2", "users/2/posts", "users/2/albums"]),
            },
            RecipeKind::MergeMap => Recipe::MergeMap {
                ids: vec![1, 2, 3],
                template: "comments/{id}".into(),
            },
            RecipeKind::SwitchMap => Recipe::SwitchMap {
                source: "posts/3".into(),
                key: "userId".into(),
                template: "users/{id}".into(),
            },
            RecipeKind::ForkJoin => Recipe::ForkJoin {
                endpoint: "users/2/posts".into(),
                straggler: "users/2".into(),
            },
            RecipeKind::Retry => Recipe::Retry {
                endpoint: "users/5000".into(),
                policy: config.retry_policy(),
            },
            RecipeKind::CatchError => Recipe::CatchError {
                endpoint: "users/2".into(),
                failing: "users/5000".into(),
                fallback: json!([]),
            },
        }
    }

    pub fn kind(&self) -> RecipeKind {
        match self {
            Recipe::Normal { .. } => RecipeKind::Normal,
            Recipe::Tap { .. } => RecipeKind::Tap,
            Recipe::Map { .. } => RecipeKind::Map,
            Recipe::Concat { .. } => RecipeKind::Concat,
            Recipe::ConcatMap { .. } => RecipeKind::ConcatMap,
            Recipe::Merge { .. } => RecipeKind::Merge,
            Recipe::MergeMap { .. } => RecipeKind::MergeMap,
            Recipe::SwitchMap { .. } => RecipeKind::SwitchMap,
            Recipe::ForkJoin { .. } => RecipeKind::ForkJoin,
            Recipe::Retry { .. } => RecipeKind::Retry,
            Recipe::CatchError { .. } => RecipeKind::CatchError,
        }
    }

    /// Resolve the recipe into a flow of requests against `transport`.
    pub fn build(
        &self,
        transport: Arc<dyn Transport>,
        config: &Config,
        diagnostics: &Diagnostics,
    ) -> Flow {
        let requests = Requests {
            transport,
            delay: config.call_delay(),
        };

        match self {
            Recipe::Normal { endpoint } => requests.get(endpoint),
            Recipe::Tap { endpoint } => {
                let diagnostics = diagnostics.clone();
                requests.get(endpoint).tap(move |posts| {
                    let count = posts.as_array().map(Vec::len).unwrap_or(0);
                    diagnostics.record("Number of posts: ", &count);
                })
            }
            Recipe::Map { endpoint, take } => {
                let take = *take;
                requests.get(endpoint).map(move |posts| match posts {
                    Value::Array(items) => Value::Array(items.into_iter().take(take).collect()),
                    other => other,
                })
            }
            Recipe::Concat { endpoints } => Flow::concat(endpoints.iter().map(|e| requests.get(e))),
            Recipe::Merge { endpoints } => Flow::merge(endpoints.iter().map(|e| requests.get(e))),
            Recipe::ConcatMap { ids, template } => {
                let template = template.clone();
                Flow::concat_map(ids.iter().map(|id| json!(id)), move |id| {
                    requests.get(&fill(&template, id))
                })
            }
            Recipe::MergeMap { ids, template } => {
                let template = template.clone();
                Flow::merge_map(ids.iter().map(|id| json!(id)), move |id| {
                    requests.get(&fill(&template, id))
                })
            }
            Recipe::SwitchMap {
                source,
                key,
                template,
            } => {
                let key = key.clone();
                let template = template.clone();
                let inner = requests.clone();
                requests.get(source).switch_map(move |value| {
                    let id = value.get(&key).cloned().unwrap_or(Value::Null);
                    inner.get(&fill(&template, &id))
                })
            }
            Recipe::ForkJoin {
                endpoint,
                straggler,
            } => Flow::fork_join(vec![
                requests.get(endpoint),
                requests.get(straggler).delay(config.straggler_delay()),
            ]),
            Recipe::Retry { endpoint, policy } => requests.get(endpoint).retry(*policy),
            Recipe::CatchError {
                endpoint,
                failing,
                fallback,
            } => Flow::fork_join(vec![
                requests.get(endpoint),
                requests.get(failing).recover(fallback.clone()),
            ]),
        }
    }
}

/// Builds request leaves sharing one transport and call delay.
#[derive(Clone)]
struct Requests {
    transport: Arc<dyn Transport>,
    delay: Duration,
}

impl Requests {
    fn get(&self, endpoint: &str) -> Flow {
        Task::request(self.transport.clone(), endpoint, self.delay).into()
    }
}

fn fill(template: &str, id: &Value) -> String {
    let id = match id {
        Value::String(s) => s.clone(),
        Value::Null => "unknown".to_string(),
        other => other.to_string(),
    };
    template.replace("{id}", &id)
}
