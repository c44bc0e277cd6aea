//! Per-request context: the single-owner value that travels through the pipeline.
//!
//! An [`HttpContext`] pairs the parsed [`Request`] with the [`Response`] under
//! construction, the path [`Parameters`] bound by the router, and a typed
//! [`Extensions`] map. Stages hand it to each other by value over channels, so
//! exactly one thread can mutate it at any time.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use serde_json::json;

use crate::{Request, Response, StatusCode};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased request extensions map, used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a value into the extensions map, returning the previous value of the same type
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Get a value from the extensions map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Get a mutable reference to a value from the extensions map
    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Remove a value from the extensions map
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Path parameters bound by the router (`/items/{id}` → `id`)
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    map: HashMap<String, String>,
}

impl Parameters {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a value into the parameters map
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    /// Get a value from the parameters map
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Remove a value from the parameters map
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Request/response context for one request's trip through the pipeline.
///
/// # Examples
///
/// ```
/// use restline::{HttpContext, Method, Request, StatusCode};
///
/// let mut ctx = HttpContext::new(Request::new(Method::Get, "/ping"));
/// ctx.response_mut().set_status(StatusCode::NoContent);
/// assert_eq!(ctx.into_response().status(), StatusCode::NoContent);
/// ```
pub struct HttpContext {
    id: u64,
    request: Request,
    response: Response,
    params: Parameters,
    extensions: Extensions,
}

impl HttpContext {
    /// Create a new context from a request with a fresh `200 OK` response
    pub fn new(request: Request) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            request,
            response: Response::new(StatusCode::Ok),
            params: Parameters::new(),
            extensions: Extensions::new(),
        }
    }

    /// Process-unique id, used to correlate the finished context with its caller.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: Parameters) {
        self.params = params;
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Deserialize the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }

    /// Replace the response with a JSON error body: `{"error": message}`.
    ///
    /// Headers written so far are discarded; the framework's post-phase
    /// manipulators restore the ones it owns.
    pub fn fail(&mut self, status: StatusCode, message: &str) {
        let mut response = Response::new(status);
        response.set_body(json!({ "error": message }).to_string());
        response.set_content_type("application/json");
        self.response = response;
    }

    /// Consume the context, keeping only the response.
    pub fn into_response(self) -> Response {
        self.response
    }
}

impl std::fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpContext")
            .field("id", &self.id)
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("status", &self.response.status())
            .finish_non_exhaustive()
    }
}
