//! Declared requests: ordered expectations and reusable unscheduled handlers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;

use crate::schedule::TaskPosition;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Response>>;

type OnceHandler = Box<dyn FnOnce(Request) -> HandlerFuture + Send>;
type SharedHandler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// Path an expectation matches against.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Exact(String),
    /// Anchored to the whole path
    Regex(Regex),
}

impl PathPattern {
    /// Compile `pattern` as a regex that must match the entire path.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!("^(?:{})$", pattern)).map(PathPattern::Regex)
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(expected) => expected == path,
            PathPattern::Regex(regex) => regex.is_match(path),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(path) => f.write_str(path),
            PathPattern::Regex(regex) => {
                let anchored = regex.as_str();
                let inner = anchored
                    .strip_prefix("^(?:")
                    .and_then(|rest| rest.strip_suffix(")$"))
                    .unwrap_or(anchored);
                f.write_str(inner)
            }
        }
    }
}

impl From<&str> for PathPattern {
    fn from(path: &str) -> Self {
        PathPattern::Exact(path.to_string())
    }
}

impl From<String> for PathPattern {
    fn from(path: String) -> Self {
        PathPattern::Exact(path)
    }
}

impl From<Regex> for PathPattern {
    fn from(regex: Regex) -> Self {
        PathPattern::Regex(regex)
    }
}

/// Box a user handler into the common response-producing shape.
fn into_handler_future<Fut, R>(future: Fut) -> HandlerFuture
where
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: IntoResponse,
{
    async move { future.await.map(IntoResponse::into_response) }.boxed()
}

/// An ordered, once-consumable request expectation.
pub struct Expectation {
    method: Method,
    path: PathPattern,
    handler: OnceHandler,
    /// Task that was current (or next) when the expectation was declared
    position: TaskPosition,
}

impl Expectation {
    pub(crate) fn new<F, Fut, R>(
        method: Method,
        path: PathPattern,
        position: TaskPosition,
        handler: F,
    ) -> Self
    where
        F: FnOnce(Request) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        Self {
            method,
            path,
            handler: Box::new(move |request| into_handler_future(handler(request))),
            position,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &PathPattern {
        &self.path
    }

    pub fn position(&self) -> TaskPosition {
        self.position
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method == *method && self.path.matches(path)
    }

    pub(crate) fn invoke(self, request: Request) -> HandlerFuture {
        (self.handler)(request)
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("method", &self.method)
            .field("path", &self.path.to_string())
            .field("position", &self.position)
            .finish()
    }
}

/// A reusable handler that bypasses ordering checks.
#[derive(Clone)]
pub struct UnscheduledHandler {
    method: Method,
    path: PathPattern,
    handler: SharedHandler,
}

impl UnscheduledHandler {
    pub(crate) fn new<F, Fut, R>(method: Method, path: PathPattern, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        Self {
            method,
            path,
            handler: Arc::new(move |request| into_handler_future(handler(request))),
        }
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method == *method && self.path.matches(path)
    }

    pub(crate) fn invoke(&self, request: Request) -> HandlerFuture {
        (self.handler)(request)
    }
}

impl fmt::Debug for UnscheduledHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnscheduledHandler")
            .field("method", &self.method)
            .field("path", &self.path.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::QueueRole;

    #[test]
    fn test_exact_pattern() {
        let pattern = PathPattern::from("/hello");
        assert!(pattern.matches("/hello"));
        assert!(!pattern.matches("/hello/world"));
        assert_eq!(pattern.to_string(), "/hello");
    }

    #[test]
    fn test_regex_pattern_is_anchored() {
        let pattern = PathPattern::regex(r"/items/\d+").unwrap();
        assert!(pattern.matches("/items/42"));
        assert!(!pattern.matches("/items/42/edit"));
        assert!(!pattern.matches("/v1/items/42"));
        assert_eq!(pattern.to_string(), r"/items/\d+");
    }

    #[test]
    fn test_expectation_matches_method_and_path() {
        let expectation = Expectation::new(
            Method::GET,
            "/a".into(),
            TaskPosition {
                queue: QueueRole::Tasks,
                index: 0,
            },
            |_| async { Ok("a") },
        );
        assert!(expectation.matches(&Method::GET, "/a"));
        assert!(!expectation.matches(&Method::HEAD, "/a"));
        assert!(!expectation.matches(&Method::GET, "/b"));
    }
}
