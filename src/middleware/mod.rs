pub mod auth;
pub mod metrics;

pub use auth::BearerAuth;
pub use metrics::RequestMetrics;
