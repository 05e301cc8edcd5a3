//! HTTP transport.

mod routes;
mod server;

pub use routes::{ConvertBody, routes};
pub use server::serve;
