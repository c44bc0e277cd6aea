//! The per-request dispatch contract run by every group worker.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::RoutedContext;
use crate::context::HttpContext;
use crate::http::StatusCode;
use crate::manipulation::{ChainError, ManipulatorCollection};
use crate::pipeline::Stage;
use crate::router::HandlerError;

/// Why a dispatch ended in an error response.
#[derive(Debug, Error)]
pub enum DispatchFault {
    #[error(transparent)]
    Manipulator(#[from] ChainError),

    #[error("handler failed: {0}")]
    Handler(#[source] HandlerError),

    #[error("panicked: {message}")]
    Panicked { message: String },
}

impl DispatchFault {
    // Panic payloads stay in the logs.
    fn client_message(&self) -> String {
        match self {
            Self::Panicked { .. } => "internal server error".to_owned(),
            other => other.to_string(),
        }
    }
}

/// Pre and post collections as seen by the workers of one group start.
#[derive(Debug, Clone)]
pub(crate) struct Chains {
    pub(crate) pre: ManipulatorCollection,
    pub(crate) post: ManipulatorCollection,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

fn guarded<F>(f: F) -> Result<(), DispatchFault>
where
    F: FnOnce() -> Result<(), DispatchFault>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(DispatchFault::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

fn record(ctx: &mut HttpContext, fault: &DispatchFault, route: &str) {
    match fault {
        DispatchFault::Panicked { message } => {
            error!(request_id = ctx.id(), route, panic = %message, "dispatch panicked");
        }
        other => warn!(request_id = ctx.id(), route, error = %other, "dispatch failed"),
    }
    ctx.fail(StatusCode::InternalServerError, &fault.client_message());
}

/// Runs one routed request through the chains and its handler.
///
/// 1. Pre chain (internal, then user). A failure skips the handler and the
///    user post chain.
/// 2. The handler. An `Err` or a panic becomes a `500` response.
/// 3. User post chain. A failure becomes a `500` response and skips the rest
///    of the user chain.
/// 4. Internal post chain, always.
pub(crate) fn dispatch(chains: &Chains, routed: RoutedContext) -> HttpContext {
    let RoutedContext { mut ctx, entry } = routed;
    let route = entry.identifier();

    let pre = guarded(|| Ok(chains.pre.apply_all(&mut ctx, &entry)?));
    match pre {
        Ok(()) => {
            if let Err(fault) = guarded(|| entry.invoke(&mut ctx).map_err(DispatchFault::Handler)) {
                record(&mut ctx, &fault, route);
            }
            if let Err(fault) = guarded(|| Ok(chains.post.apply_user(&mut ctx, &entry)?)) {
                record(&mut ctx, &fault, route);
            }
        }
        Err(fault) => record(&mut ctx, &fault, route),
    }

    if let Err(fault) = guarded(|| Ok(chains.post.apply_internal(&mut ctx, &entry)?)) {
        record(&mut ctx, &fault, route);
    }

    debug!(
        request_id = ctx.id(),
        route,
        status = ctx.response().status().as_u16(),
        "dispatched"
    );
    ctx
}

/// One worker lane of a processing group.
pub(crate) struct GroupWorker {
    pub(crate) group: String,
    pub(crate) lane: usize,
    pub(crate) chains: Arc<Chains>,
    pub(crate) input: Receiver<RoutedContext>,
    pub(crate) output: Sender<HttpContext>,
}

impl Stage for GroupWorker {
    fn init(&mut self) {
        debug!(group = %self.group, lane = self.lane, "worker starting");
    }

    fn execute(&mut self, poll: Duration) {
        match self.input.recv_timeout(poll) {
            Ok(routed) => {
                let ctx = dispatch(&self.chains, routed);
                if let Err(unsent) = self.output.send(ctx) {
                    warn!(
                        group = %self.group,
                        lane = self.lane,
                        request_id = unsent.0.id(),
                        "output pipe closed, dropping response"
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(poll),
        }
    }

    fn finalize(&mut self) {
        debug!(group = %self.group, lane = self.lane, "worker stopped");
    }
}
