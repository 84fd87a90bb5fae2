//! Embeddable client-side telemetry agent.
//!
//! Applications create sessions through [`Agent`], report events, values,
//! errors, crashes, and web-request traces through the fluent handles in
//! [`api`], and the agent ships the captured data as beacons to a remote
//! ingest endpoint from a single background sending worker.

pub mod api;
pub mod beacon;
pub mod cache;
pub mod clock;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod sender;
pub mod session;

pub use api::{Agent, Session};
pub use config::AgentConfig;
