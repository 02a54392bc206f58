//! Interceptor hooks for the request pipeline.
//!
//! Request interceptors are pure transforms over the outgoing request
//! builder, applied in registration order. Response interceptors inspect the
//! received status for side effects (auth expiry detection, server-error
//! accounting) and never alter the response.

use reqwest::{Method, RequestBuilder};

use super::error::ApiError;

/// Pure transform applied to every outgoing request
pub type RequestInterceptor = Box<dyn Fn(RequestBuilder) -> RequestBuilder + Send + Sync>;

/// What a response interceptor gets to see
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub status: u16,
    pub method: Method,
    pub target: String,
    pub attempt: u32,
}

/// Side-effect hook invoked for every received HTTP response
pub type ResponseInterceptor = Box<dyn Fn(&ResponseContext) + Send + Sync>;

/// Invoked exactly once per terminal failure
pub type ErrorCallback = Box<dyn Fn(&ApiError) + Send + Sync>;
