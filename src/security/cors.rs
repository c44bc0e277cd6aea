//! Cross-Origin Resource Sharing policy.

use serde::Deserialize;

use crate::Response;

/// Service-wide CORS policy: which origins, methods and headers are
/// advertised in `Access-Control-*` response headers.
///
/// Unlike a filtering middleware the policy never short-circuits a request:
/// the framework writes its headers on every response, including 404s and
/// error responses, so browsers always see a consistent policy.
///
/// # Behavior
///
/// - `Access-Control-Allow-Origin` is `*` when the allow-list contains `"*"`.
/// - Otherwise the request's `Origin` is echoed when it is in the list, with
///   `Vary: Origin`; when it is not (or absent) the first configured origin is
///   sent, which a browser will reject for a foreign page.
/// - `Access-Control-Allow-Methods` / `-Headers` are the joined lists.
/// - `Access-Control-Max-Age` is added to `OPTIONS` responses when configured.
///
/// # Examples
///
/// ```rust
/// use restline::security::CorsPolicy;
///
/// let cors = CorsPolicy::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Custom-Header");
/// assert_eq!(cors.origins(), ["https://example.com"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age_secs: Option<u64>,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsPolicy {
    /// Creates a permissive policy.
    ///
    /// | Setting          | Default value                          |
    /// |------------------|----------------------------------------|
    /// | Allowed origins  | `*` (all origins)                      |
    /// | Allowed methods  | `GET`, `POST`, `PUT`, `DELETE`         |
    /// | Allowed headers  | `Content-Type`, `Authorization`        |
    /// | Max age          | 3600 seconds                           |
    pub fn new() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "PUT".to_string(),
                "DELETE".to_string(),
            ],
            allowed_headers: vec!["Content-Type".to_string(), "Authorization".to_string()],
            max_age_secs: Some(3600),
        }
    }

    /// Adds an allowed origin.
    ///
    /// The first specific origin replaces the default wildcard. Pass `"*"` to
    /// go back to permitting all origins.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        if self.is_wildcard() && origin != "*" {
            self.allowed_origins.clear();
        }
        if !self.allowed_origins.contains(&origin) {
            self.allowed_origins.push(origin);
        }
        self
    }

    /// Adds an allowed HTTP method, sent verbatim.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    /// Adds an allowed request header, sent verbatim.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// Sets or clears the preflight cache duration.
    #[must_use]
    pub fn max_age(mut self, secs: Option<u64>) -> Self {
        self.max_age_secs = secs;
        self
    }

    pub fn origins(&self) -> &[String] {
        &self.allowed_origins
    }

    fn is_wildcard(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    /// Writes the `Access-Control-*` headers onto `response`.
    ///
    /// `origin` is the request's `Origin` header; `preflight` is true for
    /// `OPTIONS` requests. Existing `Access-Control-*` values are overwritten;
    /// `Origin` is merged into an existing `Vary` list.
    pub fn apply(&self, response: &mut Response, origin: Option<&str>, preflight: bool) {
        let allow_origin = if self.is_wildcard() {
            "*"
        } else if let Some(origin) = origin.filter(|o| self.allowed_origins.iter().any(|a| a == *o)) {
            add_vary_origin(response);
            origin
        } else {
            self.allowed_origins.first().map_or("null", String::as_str)
        };

        response.set_header("Access-Control-Allow-Origin", allow_origin);
        response.set_header("Access-Control-Allow-Methods", self.allowed_methods.join(", "));
        response.set_header("Access-Control-Allow-Headers", self.allowed_headers.join(", "));
        if preflight {
            if let Some(secs) = self.max_age_secs {
                response.set_header("Access-Control-Max-Age", secs.to_string());
            }
        }
    }
}

// Appends `Origin` to whatever `Vary` list the response already carries.
fn add_vary_origin(response: &mut Response) {
    let mut vary: Vec<String> = response
        .headers()
        .get_all("vary")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect();
    if !vary.iter().any(|v| v == "*" || v.eq_ignore_ascii_case("origin")) {
        vary.push("Origin".to_owned());
    }
    response.set_header("Vary", vary.join(", "));
}
