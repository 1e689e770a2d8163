//! Process-wide configuration for `carecrawl`.
//!
//! Everything here is read once at startup and then shared read-only:
//! - [`config::Settings`]: environment-sourced settings
//! - [`proxy`]: proxy pool with port-range expansion
//! - [`headers`]: browser-like header profiles with periodic rotation
//! - [`http`]: request/response types and the reqwest-backed transport
pub mod config;
pub mod headers;
pub mod http;
pub mod proxy;

pub use config::{ConfigError, Settings};
pub use headers::{
    FixedHeaderProvider, HeaderProfile, HeaderProvider, RotatingHeaderProvider,
};
pub use http::{
    HttpClientParams, HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport,
    TransportError,
};
pub use proxy::{
    ProxyConfig, ProxyProvider, ProxyRotation, RandomProxyProvider, RoundRobinProxyProvider,
};
