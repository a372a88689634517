//! HTTP API.

mod routes;

pub use routes::{serve, AppState};
