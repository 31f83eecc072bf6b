//! Tower integration for tierq prioritization.
//!
//! `tierq-tower` exposes a layer that:
//! - reads priority labels (priority, group, in-flight marker) from requests
//! - admits labelled requests through an [`AsyncDispatcher`]
//! - calls the inner service once the dispatcher grants a slot, holding the slot
//!   until the response future resolves
//! - passes unlabelled requests straight through
//! - maps scheduling rejections to HTTP-friendly errors
//!
//! # Example (header-style labels)
//!
//! ```rust,no_run
//! use std::convert::Infallible;
//! use std::future::Ready;
//! use std::task::{Context, Poll};
//!
//! use tierq_tower::{AsyncDispatcher, DispatcherConfig, Prioritize, RequestLabels};
//! use tower::{Service, ServiceBuilder};
//!
//! #[derive(Clone)]
//! struct Request {
//!     x_priority_header: Option<String>,
//!     x_tenant_header: Option<String>,
//!     body: String,
//! }
//!
//! #[derive(Clone)]
//! struct EchoService;
//!
//! impl Service<Request> for EchoService {
//!     type Response = String;
//!     type Error = Infallible;
//!     type Future = Ready<Result<Self::Response, Self::Error>>;
//!     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
//!         Poll::Ready(Ok(()))
//!     }
//!     fn call(&mut self, req: Request) -> Self::Future {
//!         std::future::ready(Ok(req.body))
//!     }
//! }
//!
//! # async fn setup() {
//! let dispatcher =
//!     AsyncDispatcher::new(DispatcherConfig::default(), tokio::runtime::Handle::current())
//!         .unwrap();
//! let layer = Prioritize::new().build::<Request, _>(dispatcher, |req: &Request| {
//!     let priority = req.x_priority_header.as_deref()?;
//!     Some(RequestLabels::new("echo", priority).group(req.x_tenant_header.clone()))
//! });
//! let _svc = ServiceBuilder::new().layer(layer).service(EchoService);
//! # }
//! ```

mod builder;
pub use builder::Prioritize;
pub use tierq_async::{
    self, AsyncDispatcher, DispatcherConfig, GroupKey, Priority, ScheduleError, TOKIO_EXECUTOR,
    WorkError, WorkSpec,
};

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use tower_service::Service;
use tracing::debug;

/// Function used to map scheduling errors into HTTP-facing rejections.
pub type RejectionMapper = Arc<dyn Fn(&ScheduleError) -> HttpRejection + Send + Sync>;

/// Structured HTTP rejection payload produced by the layer.
#[derive(Clone, Debug)]
pub struct HttpRejection {
    /// HTTP status code.
    pub status: u16,
    /// Stable machine-readable error code.
    pub code: &'static str,
    pub message: String,
    /// Underlying scheduling error.
    pub reason: ScheduleError,
}

/// Default mapping from scheduling errors to HTTP responses.
pub fn default_rejection_mapper(reason: &ScheduleError) -> HttpRejection {
    let (status, code) = match reason {
        ScheduleError::AdmissionRejected { .. } => (429, "group_full"),
        ScheduleError::MalformedPriority(_) => (400, "malformed_priority"),
        ScheduleError::UnknownExecutor(_) => (500, "unknown_executor"),
        ScheduleError::Closed => (503, "closed"),
    };
    HttpRejection {
        status,
        code,
        message: reason.to_string(),
        reason: reason.clone(),
    }
}

/// Prioritization labels carried by a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestLabels {
    /// Raw priority label, parsed when the request is admitted.
    pub priority: String,
    pub group: Option<String>,
    /// Marks a continuation of already-admitted work.
    pub in_flight: bool,
    pub action: String,
}

impl RequestLabels {
    pub fn new(action: impl Into<String>, priority: impl Into<String>) -> Self {
        Self {
            priority: priority.into(),
            group: None,
            in_flight: false,
            action: action.into(),
        }
    }

    pub fn group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    pub fn in_flight(mut self, in_flight: bool) -> Self {
        self.in_flight = in_flight;
        self
    }
}

/// Layer/service error type.
#[derive(Debug)]
pub enum PrioritizeError<E> {
    /// Error returned by the wrapped inner service.
    Service(E),
    /// Request refused before reaching the inner service.
    Rejected(HttpRejection),
    /// The admitted call ended without a response (panic or runtime shutdown).
    Dropped,
}

impl<E: fmt::Display> fmt::Display for PrioritizeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrioritizeError::Service(e) => write!(f, "service error: {e}"),
            PrioritizeError::Rejected(rejection) => write!(
                f,
                "request rejected: status={} code={} reason={}",
                rejection.status, rejection.code, rejection.reason
            ),
            PrioritizeError::Dropped => write!(f, "prioritized call ended without a response"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PrioritizeError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PrioritizeError::Service(e) => Some(e),
            PrioritizeError::Rejected(rejection) => Some(&rejection.reason),
            PrioritizeError::Dropped => None,
        }
    }
}

pub trait LabelExtractor<Request>: Clone {
    /// Returns `None` for requests that should bypass prioritization.
    fn extract(&self, req: &Request) -> Option<RequestLabels>;
}

impl<F, Request> LabelExtractor<Request> for F
where
    F: Fn(&Request) -> Option<RequestLabels> + Clone,
{
    fn extract(&self, req: &Request) -> Option<RequestLabels> {
        (self)(req)
    }
}

/// Tower `Layer` that routes labelled requests through an [`AsyncDispatcher`].
pub struct PrioritizeLayer<Request, K> {
    dispatcher: AsyncDispatcher,
    extractor: K,
    executor: Arc<str>,
    enabled: Arc<AtomicBool>,
    rejection_mapper: RejectionMapper,
    _marker: PhantomData<fn(Request)>,
}

impl<Request, K: Clone> Clone for PrioritizeLayer<Request, K> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            extractor: self.extractor.clone(),
            executor: Arc::clone(&self.executor),
            enabled: Arc::clone(&self.enabled),
            rejection_mapper: Arc::clone(&self.rejection_mapper),
            _marker: PhantomData,
        }
    }
}

impl<Request, K> PrioritizeLayer<Request, K> {
    pub fn new(
        dispatcher: AsyncDispatcher,
        extractor: K,
        executor: impl Into<Arc<str>>,
        enabled: bool,
        rejection_mapper: RejectionMapper,
    ) -> Self {
        Self {
            dispatcher,
            extractor,
            executor: executor.into(),
            enabled: Arc::new(AtomicBool::new(enabled)),
            rejection_mapper,
            _marker: PhantomData,
        }
    }

    pub fn dispatcher(&self) -> &AsyncDispatcher {
        &self.dispatcher
    }

    /// Turns prioritization on or off for this layer and every service built
    /// from it. While off, all requests pass straight through.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl<S, Request, K: Clone> tower::Layer<S> for PrioritizeLayer<Request, K> {
    type Service = PrioritizeService<S, K, Request>;

    fn layer(&self, inner: S) -> Self::Service {
        PrioritizeService {
            inner,
            dispatcher: self.dispatcher.clone(),
            extractor: self.extractor.clone(),
            executor: Arc::clone(&self.executor),
            enabled: Arc::clone(&self.enabled),
            rejection_mapper: Arc::clone(&self.rejection_mapper),
            _marker: PhantomData,
        }
    }
}

/// Tower `Service` produced by [`PrioritizeLayer`].
pub struct PrioritizeService<S, K, Request> {
    inner: S,
    dispatcher: AsyncDispatcher,
    extractor: K,
    executor: Arc<str>,
    enabled: Arc<AtomicBool>,
    rejection_mapper: RejectionMapper,
    _marker: PhantomData<fn(Request)>,
}

impl<S, K, Request> Clone for PrioritizeService<S, K, Request>
where
    S: Clone,
    K: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            dispatcher: self.dispatcher.clone(),
            extractor: self.extractor.clone(),
            executor: Arc::clone(&self.executor),
            enabled: Arc::clone(&self.enabled),
            rejection_mapper: Arc::clone(&self.rejection_mapper),
            _marker: PhantomData,
        }
    }
}

type BoxResponse<T, E> = Pin<Box<dyn Future<Output = Result<T, PrioritizeError<E>>> + Send>>;

impl<S, K, Request> PrioritizeService<S, K, Request> {
    fn reject<T, E>(&self, reason: &ScheduleError) -> BoxResponse<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let rejection = (self.rejection_mapper)(reason);
        debug!(status = rejection.status, code = rejection.code, "request rejected");
        Box::pin(std::future::ready(Err(PrioritizeError::Rejected(rejection))))
    }
}

impl<S, K, Request> Service<Request> for PrioritizeService<S, K, Request>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    K: LabelExtractor<Request> + Send + 'static,
    Request: Send + 'static,
{
    type Response = S::Response;
    type Error = PrioritizeError<S::Error>;
    type Future = BoxResponse<S::Response, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(PrioritizeError::Service)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let labels = if self.enabled.load(Ordering::Acquire) {
            self.extractor.extract(&req)
        } else {
            None
        };
        let Some(labels) = labels else {
            let response = self.inner.call(req);
            return Box::pin(async move { response.await.map_err(PrioritizeError::Service) });
        };

        let priority = match labels.priority.parse::<Priority>() {
            Ok(priority) => priority,
            Err(err) => return self.reject(&err),
        };
        let spec = WorkSpec::new(labels.action, priority)
            .group(GroupKey::from(labels.group.as_deref()))
            .in_flight(labels.in_flight)
            .executor(self.executor.as_ref());

        // the readied service goes with this call
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        match self
            .dispatcher
            .submit(spec, async move { inner.call(req).await })
        {
            Ok(handle) => {
                let mapper = Arc::clone(&self.rejection_mapper);
                Box::pin(async move {
                    match handle.await {
                        Ok(response) => response.map_err(PrioritizeError::Service),
                        Err(WorkError::Schedule(err)) => {
                            Err(PrioritizeError::Rejected(mapper(&err)))
                        }
                        Err(WorkError::Dropped) => Err(PrioritizeError::Dropped),
                    }
                })
            }
            Err(err) => self.reject(&err),
        }
    }
}
