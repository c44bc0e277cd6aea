//! The dispatch service: routing stage plus processing groups.
//!
//! ```text
//!  submit ──► inbound pipe ──► routing stage ──► group queue ──► worker lane(s) ──► output pipe
//!                              (resolve, bind     (bounded,       (pre chain,
//!                               params)            backpressure)   handler,
//!                                                                  post chain)
//! ```
//!
//! [`HttpService`] owns the router, the groups and the routing stage. Routes
//! are registered before [`HttpService::start`]; starting freezes the router
//! and returns the receiving end of the output pipe, where every submitted
//! context eventually arrives with its response filled in.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use restline::{HttpContext, HttpService, Method, Request, Route, ServiceConfig};
//!
//! let mut service = HttpService::new(ServiceConfig::default()).unwrap();
//! service
//!     .register(Route::from_fn(Method::Get, "/hello/{name}", "default", |ctx| {
//!         let body = format!("hello {}", ctx.params().get("name").unwrap_or("world"));
//!         ctx.response_mut().set_body(body);
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! let output = service.start().unwrap();
//! service.submit(HttpContext::new(Request::new(Method::Get, "/hello/ada"))).unwrap();
//!
//! let done = output.recv_timeout(Duration::from_secs(5)).unwrap();
//! assert_eq!(done.response().body_ref(), b"hello ada");
//! service.stop();
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, GroupConfig, ServiceConfig};
use crate::context::HttpContext;
use crate::http::{Method, StatusCode};
use crate::manipulation::{ContentTypePostSetter, CorsHeaderSetter};
use crate::pipeline::{self, Backpressure, OfferError, PipelineError, Stage, StageHandle};
use crate::processor::{GroupRuntime, ProcessingGroup, RoutedContext};
use crate::router::{HandlerResult, Route, RouteError, RouteMatch, Router, RoutingEntry};

/// Path of the framework's not-found route, registered under `_INTERNAL`.
pub const NOT_FOUND_PATH: &str = "/not_found";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("unknown processing group {0:?}")]
    UnknownGroup(String),

    #[error("processing group {0:?} already exists")]
    DuplicateGroup(String),

    #[error("service is already started")]
    AlreadyStarted,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

fn not_found(ctx: &mut HttpContext) -> HandlerResult {
    let body = serde_json::json!({
        "error": "not found",
        "path": ctx.request().path(),
    });
    let response = ctx.response_mut();
    response.set_status(StatusCode::NotFound);
    response.set_body(body.to_string());
    Ok(())
}

/// Cloneable handle for feeding contexts into a running service.
#[derive(Debug, Clone)]
pub struct Submitter {
    inbound: Sender<HttpContext>,
    policy: Backpressure,
}

impl Submitter {
    /// Enqueues `ctx` using the service's backpressure policy.
    pub fn submit(&self, ctx: HttpContext) -> Result<(), OfferError<HttpContext>> {
        pipeline::offer(&self.inbound, ctx, self.policy)
    }

    /// Enqueues `ctx` without blocking.
    pub fn try_submit(&self, ctx: HttpContext) -> Result<(), OfferError<HttpContext>> {
        pipeline::offer(&self.inbound, ctx, Backpressure::Reject)
    }
}

pub struct HttpService {
    config: Arc<ServiceConfig>,
    router: Arc<Router>,
    groups: HashMap<String, ProcessingGroup>,
    not_found: Arc<RoutingEntry>,
    cors: Arc<CorsHeaderSetter>,
    inbound_tx: Sender<HttpContext>,
    inbound_rx: Receiver<HttpContext>,
    routing: Option<StageHandle>,
}

impl HttpService {
    /// Builds the configured groups (plus the default group if it is not
    /// listed) and registers the not-found route on the default group.
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate()?;

        let mut groups: HashMap<String, ProcessingGroup> = config
            .groups
            .iter()
            .map(|g| (g.name.clone(), ProcessingGroup::new(g.clone())))
            .collect();
        groups
            .entry(config.default_group.clone())
            .or_insert_with(|| ProcessingGroup::new(GroupConfig::new(config.default_group.clone())));

        let mut router = Router::new();
        let not_found = router.register(
            Route::from_fn(
                Method::Internal,
                NOT_FOUND_PATH,
                config.default_group.clone(),
                not_found,
            )
            .content_type("application/json"),
        )?;

        let cors = Arc::new(CorsHeaderSetter::new(Arc::new(config.cors.clone())));
        let (inbound_tx, inbound_rx) = pipeline::pipe(config.inbound_capacity);

        Ok(Self {
            config: Arc::new(config),
            router: Arc::new(router),
            groups,
            not_found,
            cors,
            inbound_tx,
            inbound_rx,
            routing: None,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The internal entry that handles unmatched requests.
    pub fn not_found_entry(&self) -> &Arc<RoutingEntry> {
        &self.not_found
    }

    pub fn is_running(&self) -> bool {
        self.routing.is_some()
    }

    /// Adds a processing group. Only allowed while stopped.
    pub fn add_group(&mut self, config: GroupConfig) -> Result<&mut ProcessingGroup, ServiceError> {
        if self.is_running() {
            return Err(ServiceError::AlreadyStarted);
        }
        config.validate()?;
        if self.groups.contains_key(&config.name) {
            return Err(ServiceError::DuplicateGroup(config.name));
        }
        let name = config.name.clone();
        Ok(self
            .groups
            .entry(name)
            .or_insert_with(|| ProcessingGroup::new(config)))
    }

    pub fn group(&self, name: &str) -> Option<&ProcessingGroup> {
        self.groups.get(name)
    }

    /// Mutable access for adding manipulators. Changes apply from the next start.
    pub fn group_mut(&mut self, name: &str) -> Option<&mut ProcessingGroup> {
        self.groups.get_mut(name)
    }

    /// Registers a route on the router.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::AlreadyStarted`] while the service runs.
    /// - [`ServiceError::UnknownGroup`] when the route names a group that does not exist.
    /// - [`ServiceError::Route`] for invalid or conflicting patterns.
    pub fn register(&mut self, route: Route) -> Result<Arc<RoutingEntry>, ServiceError> {
        if self.is_running() {
            return Err(ServiceError::AlreadyStarted);
        }
        if !self.groups.contains_key(route.group()) {
            return Err(ServiceError::UnknownGroup(route.group().to_owned()));
        }
        let router = Arc::get_mut(&mut self.router).ok_or(ServiceError::AlreadyStarted)?;
        Ok(router.register(route)?)
    }

    /// Starts every group, then the routing stage. Returns the output pipe.
    pub fn start(&mut self) -> Result<Receiver<HttpContext>, ServiceError> {
        if self.is_running() {
            return Err(ServiceError::AlreadyStarted);
        }

        let (output_tx, output_rx) = channel::unbounded();
        let runtime = GroupRuntime {
            config: Arc::clone(&self.config),
            cors: Arc::clone(&self.cors),
            output: output_tx.clone(),
        };
        if let Err(e) = self.groups.values_mut().try_for_each(|g| g.start(&runtime)) {
            self.groups.values_mut().for_each(ProcessingGroup::stop);
            return Err(e.into());
        }

        let stage = RoutingStage {
            router: Arc::clone(&self.router),
            lanes: self
                .groups
                .iter()
                .map(|(name, group)| (name.clone(), group.sender().clone()))
                .collect(),
            not_found: Arc::clone(&self.not_found),
            cors: Arc::clone(&self.cors),
            backpressure: self.config.backpressure,
            input: self.inbound_rx.clone(),
            output: output_tx,
        };
        match StageHandle::start("restline-routing", stage, self.config.poll_timeout()) {
            Ok(handle) => self.routing = Some(handle),
            Err(e) => {
                self.groups.values_mut().for_each(ProcessingGroup::stop);
                return Err(e.into());
            }
        }

        info!(
            routes = self.router.len(),
            groups = self.groups.len(),
            "service started"
        );
        Ok(output_rx)
    }

    /// Signals the routing stage and every group worker, then joins them in
    /// that order. In-flight requests finish and are forwarded.
    pub fn stop(&mut self) {
        let Some(mut routing) = self.routing.take() else {
            return;
        };
        routing.signal_stop();
        self.groups.values().for_each(ProcessingGroup::signal_stop);
        routing.stop();
        self.groups.values_mut().for_each(ProcessingGroup::stop);
        info!("service stopped");
    }

    pub fn submitter(&self) -> Submitter {
        Submitter {
            inbound: self.inbound_tx.clone(),
            policy: self.config.backpressure,
        }
    }

    /// See [`Submitter::submit`].
    pub fn submit(&self, ctx: HttpContext) -> Result<(), OfferError<HttpContext>> {
        pipeline::offer(&self.inbound_tx, ctx, self.config.backpressure)
    }

    /// See [`Submitter::try_submit`].
    pub fn try_submit(&self, ctx: HttpContext) -> Result<(), OfferError<HttpContext>> {
        pipeline::offer(&self.inbound_tx, ctx, Backpressure::Reject)
    }
}

impl Drop for HttpService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HttpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpService")
            .field("routes", &self.router.len())
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Resolves inbound contexts and hands them to their group.
struct RoutingStage {
    router: Arc<Router>,
    lanes: HashMap<String, Sender<RoutedContext>>,
    not_found: Arc<RoutingEntry>,
    cors: Arc<CorsHeaderSetter>,
    backpressure: Backpressure,
    input: Receiver<HttpContext>,
    output: Sender<HttpContext>,
}

impl RoutingStage {
    fn route(&self, mut ctx: HttpContext) {
        let method = ctx.request().method();
        // framework-only routes are not reachable from outside
        let resolved = if *method == Method::Internal {
            None
        } else {
            self.router.resolve(method, ctx.request().path())
        };

        let entry = match resolved {
            Some(RouteMatch { entry, params }) => {
                ctx.set_params(params);
                entry
            }
            None => {
                debug!(request_id = ctx.id(), path = ctx.request().path(), "no route matched");
                Arc::clone(&self.not_found)
            }
        };

        let Some(lane) = self.lanes.get(entry.processing_group()) else {
            warn!(group = entry.processing_group(), "route names a group that is not running");
            return self.unavailable(ctx);
        };

        debug!(
            request_id = ctx.id(),
            route = entry.identifier(),
            group = entry.processing_group(),
            "routed"
        );
        if let Err(e) = pipeline::offer(lane, RoutedContext { ctx, entry }, self.backpressure) {
            let full = e.is_full();
            let RoutedContext { ctx, entry } = e.into_inner();
            warn!(
                request_id = ctx.id(),
                group = entry.processing_group(),
                full,
                "group queue rejected request"
            );
            self.unavailable(ctx);
        }
    }

    fn unavailable(&self, mut ctx: HttpContext) {
        ctx.fail(StatusCode::ServiceUnavailable, "service unavailable");
        self.cors.apply(&mut ctx);
        ContentTypePostSetter::apply(&mut ctx);
        if self.output.send(ctx).is_err() {
            warn!("output pipe closed, dropping response");
        }
    }
}

impl Stage for RoutingStage {
    fn init(&mut self) {
        debug!(routes = self.router.len(), "routing stage starting");
    }

    fn execute(&mut self, poll: Duration) {
        match self.input.recv_timeout(poll) {
            Ok(ctx) => self.route(ctx),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(poll),
        }
    }
}
