//! Stork Server Library
//!
//! Management server for Kea DHCP and BIND 9 deployments:
//! - Agent communication over HTTP+JSON
//! - SQLite storage for machines, daemons, networks, hosts and zones
//! - Kea command synthesis and configuration transactions with locking
//! - Periodic pullers refreshing daemon state
//! - DNS zone inventory, configuration review, search and lease search
//! - REST API

pub mod agentcomm;
pub mod auth;
pub mod certs;
pub mod configmgr;
pub mod dhcp;
pub mod dns;
pub mod leases;
pub mod puller;
pub mod rest;
pub mod review;
pub mod search;
pub mod storage;

#[cfg(test)]
mod test_helpers;
