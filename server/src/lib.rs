//! Library surface for the orchestration core, split out of the `server`
//! binary so integration tests can assemble the real subsystem graph
//! (`Server::build`) without going through the production CLI/accept loop.

pub mod allocator;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod orchestrator;
pub mod repository;
pub mod scheduler;

pub use orchestrator::{setup_shutdown_signal, Handles, Server};
