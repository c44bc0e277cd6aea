//! Service and processing-group configuration.
//!
//! Configuration can be built in code, parsed from JSON with
//! [`ServiceConfig::from_json`], or taken from the defaults and adjusted by
//! environment variables with [`ServiceConfig::from_env`]:
//!
//! - `RESTLINE_INBOUND_CAPACITY`: inbound queue size (default: 1024)
//! - `RESTLINE_POLL_TIMEOUT_MS`: routing stage poll timeout (default: 200)
//! - `RESTLINE_BACKPRESSURE`: `reject` or `block` (default: `block`)
//! - `RESTLINE_BACKPRESSURE_TIMEOUT_MS`: wait for `block` mode (default: 50)
//! - `RESTLINE_DEFAULT_CONTENT_TYPE`: content type for routes that declare none

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::pipeline::{Backpressure, DEFAULT_POLL_TIMEOUT};
use crate::security::CorsPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Service-wide settings.
///
/// | Field                  | Default                       |
/// |------------------------|-------------------------------|
/// | `default_content_type` | `text/plain; charset=utf-8`   |
/// | `default_group`        | `default`                     |
/// | `inbound_capacity`     | 1024                          |
/// | `poll_timeout_ms`      | 200                           |
/// | `backpressure`         | block, 50 ms                  |
/// | `cors`                 | [`CorsPolicy::new`]           |
/// | `groups`               | none (default group is added) |
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub default_content_type: String,
    /// Group used for framework routes such as the not-found fallback.
    pub default_group: String,
    pub inbound_capacity: usize,
    pub poll_timeout_ms: u64,
    /// Policy applied when a group queue is full.
    pub backpressure: Backpressure,
    pub cors: CorsPolicy,
    pub groups: Vec<GroupConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_content_type: "text/plain; charset=utf-8".to_owned(),
            default_group: "default".to_owned(),
            inbound_capacity: 1024,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT.as_millis() as u64,
            backpressure: Backpressure::default(),
            cors: CorsPolicy::new(),
            groups: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    ///
    /// ```
    /// use restline::config::{LaneMode, ServiceConfig};
    ///
    /// let config = ServiceConfig::from_json(r#"{
    ///     "groups": [{ "name": "io", "lanes": { "mode": "multi", "workers": 4 } }]
    /// }"#).unwrap();
    /// assert_eq!(config.groups[0].lanes, LaneMode::Multi { workers: 4 });
    /// ```
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults adjusted by `RESTLINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `RESTLINE_*` overrides read through `lookup`, then validates.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RESTLINE_INBOUND_CAPACITY") {
            self.inbound_capacity = parse_number("RESTLINE_INBOUND_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("RESTLINE_POLL_TIMEOUT_MS") {
            self.poll_timeout_ms = parse_number("RESTLINE_POLL_TIMEOUT_MS", &v)?;
        }

        let timeout = lookup("RESTLINE_BACKPRESSURE_TIMEOUT_MS")
            .map(|v| parse_number("RESTLINE_BACKPRESSURE_TIMEOUT_MS", &v))
            .transpose()?;
        let current_timeout = match self.backpressure {
            Backpressure::Block { timeout_ms } => Some(timeout_ms),
            Backpressure::Reject => None,
        };
        match lookup("RESTLINE_BACKPRESSURE")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("reject") => self.backpressure = Backpressure::Reject,
            Some("block") => {
                self.backpressure = Backpressure::Block {
                    timeout_ms: timeout.or(current_timeout).unwrap_or(50),
                }
            }
            Some(other) => {
                return Err(ConfigError::invalid(
                    "RESTLINE_BACKPRESSURE",
                    format!("expected `reject` or `block`, got {other:?}"),
                ));
            }
            None => {
                if let (Backpressure::Block { timeout_ms }, Some(t)) = (&mut self.backpressure, timeout) {
                    *timeout_ms = t;
                }
            }
        }

        if let Some(v) = lookup("RESTLINE_DEFAULT_CONTENT_TYPE") {
            self.default_content_type = v;
        }

        self.validate()?;
        Ok(self)
    }

    /// Appends a group.
    #[must_use]
    pub fn with_group(mut self, group: GroupConfig) -> Self {
        self.groups.push(group);
        self
    }

    #[must_use]
    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    #[must_use]
    pub fn with_cors(mut self, cors: CorsPolicy) -> Self {
        self.cors = cors;
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Checks capacities, timeouts and group names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inbound_capacity == 0 {
            return Err(ConfigError::invalid("inbound_capacity", "must be greater than zero"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::invalid("poll_timeout_ms", "must be greater than zero"));
        }
        if self.default_group.is_empty() {
            return Err(ConfigError::invalid("default_group", "must not be empty"));
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !seen.insert(group.name.as_str()) {
                return Err(ConfigError::invalid(
                    "groups",
                    format!("duplicate group name {:?}", group.name),
                ));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("expected a number, got {value:?}")))
}

/// Worker layout of a processing group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LaneMode {
    /// One worker; requests complete in arrival order.
    #[default]
    Single,
    /// `workers` threads draining one queue, no ordering guarantee.
    Multi { workers: usize },
}

impl LaneMode {
    pub fn workers(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Multi { workers } => *workers,
        }
    }
}

/// Settings of one processing group.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub name: String,
    /// How long a worker blocks on the group queue before re-checking for stop.
    pub timeout_ms: u64,
    pub lanes: LaneMode,
    pub queue_capacity: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

impl GroupConfig {
    /// A single-lane group with default timeout and capacity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_ms: DEFAULT_POLL_TIMEOUT.as_millis() as u64,
            lanes: LaneMode::Single,
            queue_capacity: 1024,
        }
    }

    /// A multi-lane group with `workers` threads.
    pub fn multi(name: impl Into<String>, workers: usize) -> Self {
        Self {
            lanes: LaneMode::Multi { workers },
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let field = |name: &str| format!("groups.{}.{name}", self.name);
        if self.name.is_empty() {
            return Err(ConfigError::invalid("groups.name", "must not be empty"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid(field("queue_capacity"), "must be greater than zero"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid(field("timeout_ms"), "must be greater than zero"));
        }
        if self.lanes.workers() == 0 {
            return Err(ConfigError::invalid(field("lanes"), "needs at least one worker"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.default_content_type, "text/plain; charset=utf-8");
        assert_eq!(config.default_group, "default");
        assert_eq!(config.inbound_capacity, 1024);
        assert_eq!(config.poll_timeout(), Duration::from_millis(200));
        assert_eq!(config.backpressure, Backpressure::Block { timeout_ms: 50 });
        assert!(config.validate().is_ok());

        let group = GroupConfig::new("io");
        assert_eq!(group.timeout(), Duration::from_millis(200));
        assert_eq!(group.lanes.workers(), 1);
    }

    #[test]
    fn json_fills_missing_fields() {
        let config = ServiceConfig::from_json(
            r#"{
                "default_content_type": "application/json",
                "backpressure": { "mode": "reject" },
                "groups": [
                    { "name": "fast" },
                    { "name": "io", "lanes": { "mode": "multi", "workers": 3 }, "queue_capacity": 8 }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.default_content_type, "application/json");
        assert_eq!(config.backpressure, Backpressure::Reject);
        assert_eq!(config.groups[0], GroupConfig::new("fast"));
        assert_eq!(config.groups[1].lanes, LaneMode::Multi { workers: 3 });
        assert_eq!(config.groups[1].queue_capacity, 8);
        assert_eq!(config.inbound_capacity, 1024);
    }

    #[test]
    fn json_errors() {
        assert!(matches!(ServiceConfig::from_json("{"), Err(ConfigError::Json(_))));
        assert!(matches!(
            ServiceConfig::from_json(r#"{"groups": [{"name": "a"}, {"name": "a"}]}"#),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            ServiceConfig::from_json(r#"{"groups": [{"name": "a", "lanes": {"mode": "multi", "workers": 0}}]}"#),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(ServiceConfig::from_json(r#"{"inbound_capacity": 0}"#).is_err());
    }

    #[test]
    fn env_overrides() {
        let config = ServiceConfig::default()
            .with_overrides(lookup(&[
                ("RESTLINE_INBOUND_CAPACITY", "16"),
                ("RESTLINE_POLL_TIMEOUT_MS", "25"),
                ("RESTLINE_BACKPRESSURE_TIMEOUT_MS", "5"),
                ("RESTLINE_DEFAULT_CONTENT_TYPE", "text/html"),
            ]))
            .unwrap();
        assert_eq!(config.inbound_capacity, 16);
        assert_eq!(config.poll_timeout_ms, 25);
        assert_eq!(config.backpressure, Backpressure::Block { timeout_ms: 5 });
        assert_eq!(config.default_content_type, "text/html");
    }

    #[test]
    fn env_backpressure_modes() {
        let reject = ServiceConfig::default()
            .with_overrides(lookup(&[("RESTLINE_BACKPRESSURE", "REJECT")]))
            .unwrap();
        assert_eq!(reject.backpressure, Backpressure::Reject);

        let block = reject
            .with_overrides(lookup(&[("RESTLINE_BACKPRESSURE", "block")]))
            .unwrap();
        assert_eq!(block.backpressure, Backpressure::Block { timeout_ms: 50 });

        let err = ServiceConfig::default()
            .with_overrides(lookup(&[("RESTLINE_BACKPRESSURE", "drop")]))
            .unwrap_err();
        assert!(err.to_string().contains("RESTLINE_BACKPRESSURE"));
    }

    #[test]
    fn env_rejects_garbage_numbers() {
        let err = ServiceConfig::default()
            .with_overrides(lookup(&[("RESTLINE_INBOUND_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "RESTLINE_INBOUND_CAPACITY"));
    }
}
