//! Transport layer for docpress.
//!
//! Currently provides HTTP transport via axum.

pub mod http;

pub use http::serve;
