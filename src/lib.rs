//! # restline
//!
//! Request-dispatch core for RESTful HTTP services: a prefix-tree router,
//! dedicated-thread processing stages joined by bounded queues, and
//! per-group manipulator chains wrapped around every handler call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use restline::{HttpService, Method, Route, ServiceConfig};
//! use restline::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut service = HttpService::new(ServiceConfig::default())?;
//!     service.register(Route::from_fn(Method::Get, "/hello/{name}", "default", |ctx| {
//!         let name = ctx.params().get("name").unwrap_or("world").to_owned();
//!         ctx.response_mut().set_body(format!("Hello, {name}!"));
//!         Ok(())
//!     }))?;
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(service, async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!     Ok(())
//! }
//! ```

// ── Wire types ────────────────────────────────────────────────────────────────
pub mod context;
pub mod http;

// ── Dispatch core ─────────────────────────────────────────────────────────────
pub mod config;
pub mod manipulation;
pub mod pipeline;
pub mod processor;
pub mod router;
pub mod security;
pub mod service;

// ── Transport ─────────────────────────────────────────────────────────────────
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, GroupConfig, LaneMode, ServiceConfig};
pub use context::{Extensions, HttpContext, Parameters};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use manipulation::{Manipulator, ManipulatorCollection, ManipulatorError, Phase};
pub use pipeline::{Backpressure, OfferError};
pub use router::{
    Controller, HandlerError, HandlerResult, Route, RouteError, Router, RoutingEntry,
};
pub use security::CorsPolicy;
pub use service::{HttpService, ServiceError, Submitter};
pub use server::{Server, ServerError};
