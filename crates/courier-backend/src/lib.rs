//! # courier-backend
//!
//! HTTP client for the Hubfeed backend: token verification, job fetching,
//! result submission, and avatar snapshot sync.

pub mod http;

pub use http::HttpBackend;
