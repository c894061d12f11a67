//! Communication with Stork agents.
//!
//! [`AgentClient`] is the only way the server reaches remote daemons. The
//! wire is abstracted behind [`AgentTransport`] so tests can script the
//! agents' answers.

mod client;
mod error;
mod transport;

#[cfg(test)]
pub mod mock;


pub use client::{
    AgentApp, AgentClient, AgentState, AgentStats, DaemonErrorStats, ZoneStream, BIND9_STATS_PATH,
    BIND9_ZONES_PATH, KEA_PATH, STATE_PATH,
};
pub use error::AgentError;
pub use transport::{AgentTransport, Endpoint, HttpTransport};
