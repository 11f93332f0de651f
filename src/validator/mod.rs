//! Out-of-band request validation.
//!
//! A [`RequestValidator`] checks externally triggered requests against the
//! order in which a schedule declared them. Failures are never returned to the
//! caller that sent the request. They are recorded on the schedule, like task
//! failures.
//!
//! ## Request Flow
//! 1. An unscheduled handler that matches serves the request with no ordering check
//! 2. Otherwise the front expectation is consumed, even when it does not match
//! 3. A request that lags its declaration by more than the tolerance window is rejected
//! 4. The expectation's handler runs as tracked out-of-band work

mod expectation;
mod server;

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::watch;

use crate::schedule::{Schedule, ScheduleError, TimingError};

pub use expectation::{Expectation, HandlerFuture, PathPattern, UnscheduledHandler};

struct ValidatorInner {
    schedule: Schedule,
    expectations: Mutex<VecDeque<Expectation>>,
    unscheduled: Mutex<Vec<UnscheduledHandler>>,
    address: watch::Sender<Option<SocketAddr>>,
}

/// Validates out-of-band requests against a schedule's declared order.
///
/// Cheap to clone; clones share the same expectations.
#[derive(Clone)]
pub struct RequestValidator {
    inner: Arc<ValidatorInner>,
}

impl RequestValidator {
    pub fn new(schedule: Schedule) -> Self {
        let (address, _) = watch::channel(None);
        Self {
            inner: Arc::new(ValidatorInner {
                schedule,
                expectations: Mutex::new(VecDeque::new()),
                unscheduled: Mutex::new(Vec::new()),
                address,
            }),
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.inner.schedule
    }

    fn expectations(&self) -> MutexGuard<'_, VecDeque<Expectation>> {
        self.inner
            .expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn unscheduled(&self) -> MutexGuard<'_, Vec<UnscheduledHandler>> {
        self.inner
            .unscheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Expect one `method path` request, to be served by `handler`.
    ///
    /// The expectation remembers which top-level task is current right now;
    /// see [`Schedule::declaration_position`].
    pub fn declare<F, Fut, R>(&self, method: Method, path: impl Into<PathPattern>, handler: F)
    where
        F: FnOnce(Request) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        let position = self.schedule().declaration_position();
        let expectation = Expectation::new(method, path.into(), position, handler);
        tracing::debug!(
            method = %expectation.method(),
            path = %expectation.path(),
            queue = %position.queue,
            task = position.index,
            "request expected"
        );
        self.expectations().push_back(expectation);
    }

    /// Serve every `method path` request with `handler`, in any order and any
    /// number of times.
    pub fn declare_unscheduled<F, Fut, R>(
        &self,
        method: Method,
        path: impl Into<PathPattern>,
        handler: F,
    ) where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoResponse,
    {
        self.unscheduled()
            .push(UnscheduledHandler::new(method, path.into(), handler));
    }

    /// Number of declared expectations not yet consumed.
    pub fn pending(&self) -> usize {
        self.expectations().len()
    }

    /// Validate one inbound request and produce its response.
    ///
    /// Rejected requests get a `500` carrying the error text; the error itself
    /// is recorded on the schedule.
    pub async fn handle(&self, request: Request) -> Response {
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let unscheduled = self
            .unscheduled()
            .iter()
            .find(|handler| handler.matches(&method, &path))
            .cloned();
        if let Some(handler) = unscheduled {
            tracing::debug!(%method, %path, "unscheduled request");
            return self.invoke(handler.invoke(request)).await;
        }

        let Some(expectation) = self.expectations().pop_front() else {
            return self.reject(TimingError::Unexpected { method, path });
        };

        if !expectation.matches(&method, &path) {
            return self.reject(TimingError::Mismatch {
                expected_method: expectation.method().clone(),
                expected_path: expectation.path().to_string(),
                method,
                path,
            });
        }

        if self.is_too_early(&expectation) {
            return self.reject(TimingError::TooEarly { method, path });
        }

        tracing::debug!(%method, %path, "expected request");
        self.invoke(expectation.invoke(request)).await
    }

    /// The request arrived more than the tolerance window of top-level tasks
    /// after its declaring task, within the same queue.
    fn is_too_early(&self, expectation: &Expectation) -> bool {
        let Some(current) = self.schedule().current_position() else {
            return false;
        };
        let declared = expectation.position();
        if current.queue != declared.queue {
            return false;
        }
        current.index.saturating_sub(declared.index) > self.schedule().config().request_tolerance
    }

    /// Run a handler as tracked out-of-band work. A failure is attributed to
    /// whatever is current when it surfaces.
    async fn invoke(&self, handler: HandlerFuture) -> Response {
        let _guard = self.schedule().begin_out_of_band();
        match handler.await {
            Ok(response) => response,
            Err(error) => {
                let error = self.schedule().record_error(error);
                error_response(&error)
            }
        }
    }

    fn reject(&self, timing: TimingError) -> Response {
        let error = self.schedule().record_error(timing);
        error_response(&error)
    }

    /// Publish the bound listener address.
    fn set_address(&self, address: SocketAddr) {
        self.inner.address.send_replace(Some(address));
    }

    /// Address of the listener, once it has been bound by [`serve`].
    ///
    /// [`serve`]: RequestValidator::serve
    pub async fn address(&self) -> anyhow::Result<SocketAddr> {
        let mut address = self.inner.address.subscribe();
        let bound = *address.wait_for(Option::is_some).await?;
        bound.ok_or_else(|| anyhow::anyhow!("request validator listener is not bound"))
    }

    /// Base URL of the listener, e.g. `http://127.0.0.1:40123`.
    pub async fn url(&self) -> anyhow::Result<String> {
        Ok(format!("http://{}", self.address().await?))
    }
}

fn error_response(error: &ScheduleError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
}
