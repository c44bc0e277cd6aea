use std::sync::Arc;

use super::{Manipulator, ManipulatorError};
use crate::context::HttpContext;
use crate::http::Method;
use crate::router::RoutingEntry;
use crate::security::CorsPolicy;

/// Fills the response content-type slot before the handler runs.
///
/// Uses the route's declared content type when it has one, otherwise the
/// service default. Handlers can still change the slot with
/// [`Response::set_content_type`](crate::Response::set_content_type).
#[derive(Debug, Clone)]
pub struct ContentTypePreSetter {
    default: String,
}

impl ContentTypePreSetter {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
        }
    }
}

impl Manipulator for ContentTypePreSetter {
    fn name(&self) -> &str {
        "content-type-pre"
    }

    fn manipulate(&self, ctx: &mut HttpContext, entry: &RoutingEntry) -> Result<(), ManipulatorError> {
        let content_type = entry.content_type().unwrap_or(&self.default);
        ctx.response_mut().set_content_type(content_type);
        Ok(())
    }
}

/// Writes the service CORS headers onto the response, overwriting whatever
/// is there.
#[derive(Debug, Clone)]
pub struct CorsHeaderSetter {
    policy: Arc<CorsPolicy>,
}

impl CorsHeaderSetter {
    pub fn new(policy: Arc<CorsPolicy>) -> Self {
        Self { policy }
    }

    /// Applies the policy outside a manipulator chain, for responses that
    /// never reach a processing group.
    pub(crate) fn apply(&self, ctx: &mut HttpContext) {
        let preflight = *ctx.request().method() == Method::Options;
        let origin = ctx.request().headers().get("origin").map(str::to_owned);
        self.policy
            .apply(ctx.response_mut(), origin.as_deref(), preflight);
    }
}

impl Manipulator for CorsHeaderSetter {
    fn name(&self) -> &str {
        "cors"
    }

    fn manipulate(&self, ctx: &mut HttpContext, _entry: &RoutingEntry) -> Result<(), ManipulatorError> {
        self.apply(ctx);
        Ok(())
    }
}

/// Copies the content-type slot into the `Content-Type` header.
///
/// Runs after every user post-manipulator, so the slot's final value wins
/// over any `Content-Type` header written directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentTypePostSetter;

impl ContentTypePostSetter {
    pub(crate) fn apply(ctx: &mut HttpContext) {
        let response = ctx.response_mut();
        if let Some(content_type) = response.content_type().map(str::to_owned) {
            response.set_header("Content-Type", content_type);
        }
    }
}

impl Manipulator for ContentTypePostSetter {
    fn name(&self) -> &str {
        "content-type-post"
    }

    fn manipulate(&self, ctx: &mut HttpContext, _entry: &RoutingEntry) -> Result<(), ManipulatorError> {
        Self::apply(ctx);
        Ok(())
    }
}
