//! Telemetry pipeline for HPX programs.
//!
//! The agent classifies program output ([`parser`]) and streams typed
//! records over TCP ([`transport`]). The server funnels them into a run
//! store ([`store`]), saves finalized runs ([`persist`]) and serves health
//! metrics and a read API ([`export`]).

pub mod agent;
pub mod config;
pub mod export;
pub mod parser;
pub mod persist;
pub mod server;
pub mod store;
pub mod transport;
