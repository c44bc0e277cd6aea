//! Routing entries and the handler types bound into them.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::context::HttpContext;
use crate::http::Method;

/// Outcome of a handler call. The handler writes its result into the
/// context's response; an `Err` is turned into a `500` error response.
pub type HandlerResult = Result<(), HandlerError>;

/// Type-erased handler bound to its controller at registration time.
///
/// Stored behind an `Arc` so every worker lane can call it without cloning
/// the closure.
pub type Handler = Arc<dyn Fn(&mut HttpContext) -> HandlerResult + Send + Sync + 'static>;

/// Errors raised by handler code.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// The object that owns a group of handler methods.
///
/// Controllers are shared across worker threads, so any state they hold must
/// be `Send + Sync`. The default [`name`](Controller::name) is the type name.
pub trait Controller: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Controller used for routes registered from a bare closure.
#[derive(Debug, Default)]
pub struct FunctionController;

impl Controller for FunctionController {
    fn name(&self) -> &str {
        "fn"
    }
}

/// A registration request: method, path pattern, processing group, and the
/// handler bound to its controller.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use restline::{Controller, HttpContext, HandlerResult, Method, Route};
///
/// struct Items;
/// impl Controller for Items {}
///
/// impl Items {
///     fn show(&self, ctx: &mut HttpContext) -> HandlerResult {
///         let id = ctx.params().get("id").unwrap_or_default().to_owned();
///         ctx.response_mut().set_body(id);
///         Ok(())
///     }
/// }
///
/// let route = Route::new(Method::Get, "/items/{id}", "default", Arc::new(Items), Items::show)
///     .content_type("text/plain");
/// assert_eq!(route.pattern(), "/items/{id}");
/// ```
pub struct Route {
    pub(crate) method: Method,
    pub(crate) pattern: String,
    pub(crate) group: String,
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) handler: Handler,
    pub(crate) content_type: Option<String>,
}

impl Route {
    /// Binds `method` of `controller` as the handler.
    pub fn new<C>(
        method: Method,
        pattern: impl Into<String>,
        group: impl Into<String>,
        controller: Arc<C>,
        handler: fn(&C, &mut HttpContext) -> HandlerResult,
    ) -> Self
    where
        C: Controller,
    {
        let bound = Arc::clone(&controller);
        Self {
            method,
            pattern: pattern.into(),
            group: group.into(),
            controller,
            handler: Arc::new(move |ctx| handler(&bound, ctx)),
            content_type: None,
        }
    }

    /// Uses a closure as the handler, owned by a [`FunctionController`].
    pub fn from_fn<F>(
        method: Method,
        pattern: impl Into<String>,
        group: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(&mut HttpContext) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            method,
            pattern: pattern.into(),
            group: group.into(),
            controller: Arc::new(FunctionController),
            handler: Arc::new(handler),
            content_type: None,
        }
    }

    /// Declares the content type the handler produces. The content-type
    /// pre-setter uses it instead of the service default.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

/// A registered route: the leaf payload of the routing tree.
///
/// Immutable once registered. The identifier is `<METHOD><pattern>` (for
/// example `GET/items/{id}`) and is unique tree-wide.
pub struct RoutingEntry {
    pub(crate) identifier: String,
    pub(crate) method: Method,
    pub(crate) pattern: String,
    // (segment index, parameter name), method segment excluded
    pub(crate) params: Vec<(usize, String)>,
    pub(crate) group: String,
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) handler: Handler,
    pub(crate) content_type: Option<String>,
    pub(crate) metrics: u64,
    pub(crate) sequence: u64,
}

impl RoutingEntry {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The registered pattern in normalized form: no trailing slash,
    /// parameters written as `{name}`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Name of the processing group whose workers run this handler.
    pub fn processing_group(&self) -> &str {
        &self.group
    }

    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    /// Specificity: higher wins. See [`Router`](super::Router) for the formula.
    pub fn metrics(&self) -> u64 {
        self.metrics
    }

    /// Registration order, used to break exact metric ties.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Content type declared at registration, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn has_explicit_content_type(&self) -> bool {
        self.content_type.is_some()
    }

    /// Names of the path parameters in pattern order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(_, name)| name.as_str())
    }

    /// Calls the bound handler.
    pub fn invoke(&self, ctx: &mut HttpContext) -> HandlerResult {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for RoutingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingEntry")
            .field("identifier", &self.identifier)
            .field("group", &self.group)
            .field("controller", &self.controller.name())
            .field("content_type", &self.content_type)
            .field("metrics", &format_args!("{:#x}", self.metrics))
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}
