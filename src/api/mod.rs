//! Request pipeline: build, intercept, send, retry, report.

pub mod client;
pub mod error;
pub mod interceptor;

pub use client::{retry_delay, ApiClient, RequestStats, RequestStatsSnapshot};
pub use error::{classify_status, ApiError, ApiErrorKind, STATUS_NO_RESPONSE};
pub use interceptor::{ErrorCallback, RequestInterceptor, ResponseContext, ResponseInterceptor};
