//! Manipulators: ordered request/response transformers around handler calls.
//!
//! Every processing group owns two [`ManipulatorCollection`]s: one for the
//! [`Phase::Pre`] phase, applied before the handler, and one for
//! [`Phase::Post`], applied after it. Each collection keeps two lists:
//!
//! - **internal**: content-type handling and CORS headers, installed by the
//!   framework when the group starts and not removable.
//! - **user**: appended with [`ManipulatorCollection::add`], run in
//!   registration order.
//!
//! Internal pre-manipulators run before user ones; internal post-manipulators
//! run after user ones. User code can therefore read and adjust what the
//! framework set up, but it cannot have the last word on the headers the
//! framework guarantees.
//!
//! ## Core types
//!
//! - [`Manipulator`]: trait implemented by all manipulators; closures of the
//!   right shape implement it too.
//! - [`ManipulatorCollection`]: the two-list chain for one phase.
//! - [`ContentTypePreSetter`], [`CorsHeaderSetter`], [`ContentTypePostSetter`]
//!   are the built-in internal manipulators.

mod builtin;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::context::HttpContext;
use crate::router::RoutingEntry;

pub use builtin::{ContentTypePostSetter, ContentTypePreSetter, CorsHeaderSetter};

/// Failure reported by a manipulator. Dispatch converts it into an error response.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ManipulatorError {
    message: String,
}

impl ManipulatorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A failed chain application: which manipulator failed, and why.
#[derive(Debug, Error)]
#[error("{phase} manipulator `{manipulator}` failed: {source}")]
pub struct ChainError {
    pub phase: Phase,
    pub manipulator: String,
    #[source]
    pub source: ManipulatorError,
}

/// When a collection runs relative to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Pre => "pre",
            Phase::Post => "post",
        })
    }
}

/// A request/response transformer.
///
/// Receives the context and the resolved [`RoutingEntry`] and mutates the
/// context in place. Implementations are shared across worker threads, so
/// they must be `Send + Sync`.
///
/// # Examples
///
/// ```rust
/// use restline::manipulation::{Manipulator, ManipulatorError};
/// use restline::{HttpContext, RoutingEntry};
///
/// struct PoweredBy;
///
/// impl Manipulator for PoweredBy {
///     fn manipulate(&self, ctx: &mut HttpContext, _entry: &RoutingEntry) -> Result<(), ManipulatorError> {
///         ctx.response_mut().set_header("X-Powered-By", "restline");
///         Ok(())
///     }
/// }
/// ```
pub trait Manipulator: Send + Sync {
    /// Name used in logs and [`ChainError`]s.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn manipulate(&self, ctx: &mut HttpContext, entry: &RoutingEntry)
    -> Result<(), ManipulatorError>;
}

impl<F> Manipulator for F
where
    F: Fn(&mut HttpContext, &RoutingEntry) -> Result<(), ManipulatorError> + Send + Sync,
{
    fn manipulate(
        &self,
        ctx: &mut HttpContext,
        entry: &RoutingEntry,
    ) -> Result<(), ManipulatorError> {
        self(ctx, entry)
    }
}

/// Ordered manipulators for one phase.
///
/// Cloning is cheap: manipulators are reference-counted, so a clone is a
/// snapshot that shares them.
#[derive(Clone)]
pub struct ManipulatorCollection {
    phase: Phase,
    internal: Vec<Arc<dyn Manipulator>>,
    user: Vec<Arc<dyn Manipulator>>,
}

impl ManipulatorCollection {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            internal: Vec::new(),
            user: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Appends a user manipulator.
    pub fn add<M>(&mut self, manipulator: M)
    where
        M: Manipulator + 'static,
    {
        self.user.push(Arc::new(manipulator));
    }

    /// Appends an already shared user manipulator.
    pub fn add_shared(&mut self, manipulator: Arc<dyn Manipulator>) {
        self.user.push(manipulator);
    }

    pub(crate) fn add_internal(&mut self, manipulator: Arc<dyn Manipulator>) {
        self.internal.push(manipulator);
    }

    /// Number of user manipulators.
    pub fn len(&self) -> usize {
        self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty()
    }

    pub fn internal_len(&self) -> usize {
        self.internal.len()
    }

    /// Names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.ordered().map(|m| m.name()).collect()
    }

    /// Runs the whole chain: internal then user for `Pre`, user then internal
    /// for `Post`. Stops at the first failure.
    pub fn apply_all(&self, ctx: &mut HttpContext, entry: &RoutingEntry) -> Result<(), ChainError> {
        self.run(self.ordered(), ctx, entry)
    }

    /// Runs the user list only.
    pub fn apply_user(&self, ctx: &mut HttpContext, entry: &RoutingEntry) -> Result<(), ChainError> {
        self.run(self.user.iter(), ctx, entry)
    }

    /// Runs the internal list only.
    pub fn apply_internal(
        &self,
        ctx: &mut HttpContext,
        entry: &RoutingEntry,
    ) -> Result<(), ChainError> {
        self.run(self.internal.iter(), ctx, entry)
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<dyn Manipulator>> {
        let (first, second) = match self.phase {
            Phase::Pre => (&self.internal, &self.user),
            Phase::Post => (&self.user, &self.internal),
        };
        first.iter().chain(second.iter())
    }

    fn run<'a>(
        &self,
        manipulators: impl Iterator<Item = &'a Arc<dyn Manipulator>>,
        ctx: &mut HttpContext,
        entry: &RoutingEntry,
    ) -> Result<(), ChainError> {
        for manipulator in manipulators {
            manipulator
                .manipulate(ctx, entry)
                .map_err(|source| ChainError {
                    phase: self.phase,
                    manipulator: manipulator.name().to_owned(),
                    source,
                })?;
        }
        Ok(())
    }
}

impl fmt::Debug for ManipulatorCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManipulatorCollection")
            .field("phase", &self.phase)
            .field("order", &self.names())
            .finish()
    }
}
