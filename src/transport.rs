//! Request transport used by leaf tasks.
//!
//! The engine treats the transport as an opaque producer of futures. This
//! crate ships [`SimulatedTransport`], an in-process transport with scripted
//! replies and a JSONPlaceholder-shaped router, used by the CLI and tests.

use crate::core::task::TaskFuture;
use crate::error::Failure;
use crate::{cflog_debug, cflog_trace};
use futures::FutureExt;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

/// Asynchronous request producer.
///
/// Implementations must not block in `request`; the returned future does the
/// waiting. A transport that completes on other threads is fine: the engine
/// only observes the completion when it polls the future on its own context.
pub trait Transport: Send + Sync {
    fn request(&self, endpoint: &str) -> TaskFuture;
}

/// One scripted response.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub delay: Duration,
    pub result: Result<Value, Failure>,
}

impl Reply {
    pub fn ok(value: Value) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(value),
        }
    }

    pub fn err(code: u16, message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(Failure::transport(code, message)),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct Routes {
    /// Remaining replies per endpoint; the last one repeats forever.
    scripts: HashMap<String, VecDeque<Reply>>,
    calls: HashMap<String, u32>,
}

/// In-process transport with scripted replies.
///
/// Lookup order: a script registered for the exact endpoint, then the
/// placeholder router (when enabled), then `404 Not Found`.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    routes: Arc<Mutex<Routes>>,
    latency: Duration,
    placeholder: bool,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// A transport that knows no endpoints.
    pub fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(Routes::default())),
            latency: Duration::ZERO,
            placeholder: false,
        }
    }

    /// A transport answering the JSONPlaceholder endpoint space.
    pub fn placeholder(latency: Duration) -> Self {
        Self {
            latency,
            placeholder: true,
            ..Self::new()
        }
    }

    /// Always answer `endpoint` with `reply`.
    pub fn respond(self, endpoint: impl Into<String>, reply: Reply) -> Self {
        self.script(endpoint, vec![reply])
    }

    /// Answer successive requests with successive replies; the last repeats.
    pub fn script(self, endpoint: impl Into<String>, replies: Vec<Reply>) -> Self {
        if !replies.is_empty() {
            self.lock()
                .scripts
                .insert(endpoint.into(), replies.into_iter().collect());
        }
        self
    }

    /// How many times `endpoint` was requested.
    pub fn calls(&self, endpoint: &str) -> u32 {
        self.lock().calls.get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.lock().calls.values().sum()
    }

    fn next_reply(&self, endpoint: &str) -> Reply {
        let mut routes = self.lock();
        *routes.calls.entry(endpoint.to_string()).or_default() += 1;

        if let Some(queue) = routes.scripts.get_mut(endpoint) {
            let reply = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(reply) = reply {
                return reply;
            }
        }
        drop(routes);

        let result = if self.placeholder {
            placeholder_response(endpoint)
        } else {
            Err(Failure::transport(404, "Not Found"))
        };
        Reply {
            delay: self.latency,
            result,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for SimulatedTransport {
    fn request(&self, endpoint: &str) -> TaskFuture {
        let reply = self.next_reply(endpoint);
        cflog_debug!(
            "transport: GET {} -> {} after {:?}",
            endpoint,
            match &reply.result {
                Ok(_) => "ok".to_string(),
                Err(f) => f.to_string(),
            },
            reply.delay
        );
        let endpoint = endpoint.to_string();
        async move {
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            cflog_trace!("transport: {} answered", endpoint);
            reply.result
        }
        .boxed()
    }
}

const USER_COUNT: u64 = 10;
const POST_COUNT: u64 = 100;
const COMMENT_COUNT: u64 = 500;

fn route_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^/?(users|posts|comments)/(\d+)(?:/(posts|albums))?/?$").ok())
        .as_ref()
}

fn not_found() -> Result<Value, Failure> {
    Err(Failure::transport(404, "Not Found"))
}

/// Deterministic stand-ins for the JSONPlaceholder resources.
fn placeholder_response(endpoint: &str) -> Result<Value, Failure> {
    let Some(caps) = route_pattern().and_then(|p| p.captures(endpoint)) else {
        return not_found();
    };
    let Ok(id) = caps[2].parse::<u64>() else {
        return not_found();
    };
    let nested = caps.get(3).map(|m| m.as_str());

    match (&caps[1], nested) {
        ("users", _) if id == 0 || id > USER_COUNT => not_found(),
        ("users", None) => Ok(json!({
            "id": id,
            "name": format!("User {}", id),
            "username": format!("user{}", id),
            "email": format!("user{}@example.com", id),
        })),
        ("users", Some("posts")) => Ok(Value::Array(
            (1..=10)
                .map(|n| post((id - 1) * 10 + n))
                .collect(),
        )),
        ("users", Some(_)) => Ok(Value::Array(
            (1..=10)
                .map(|n| {
                    let album = (id - 1) * 10 + n;
                    json!({ "userId": id, "id": album, "title": format!("album {}", album) })
                })
                .collect(),
        )),
        ("posts", None) if (1..=POST_COUNT).contains(&id) => Ok(post(id)),
        ("comments", None) if (1..=COMMENT_COUNT).contains(&id) => Ok(json!({
            "postId": (id - 1) / 5 + 1,
            "id": id,
            "name": format!("comment {}", id),
            "email": format!("commenter{}@example.com", id),
            "body": format!("body of comment {}", id),
        })),
        _ => not_found(),
    }
}

fn post(id: u64) -> Value {
    json!({
        "userId": (id - 1) / 10 + 1,
        "id": id,
        "title": format!("post {}", id),
        "body": format!("body of post {}", id),
    })
}
