//! HTTP surface of the server: Prometheus health metrics and the read API.

pub mod api;
pub mod health;
