//! Security concerns applied by the framework on every response.
//!
//! Currently implemented:
//!
//! - [`CorsPolicy`]: service-wide Cross-Origin Resource Sharing configuration,
//!   applied by the internal CORS manipulator.

mod cors;

pub use cors::CorsPolicy;
