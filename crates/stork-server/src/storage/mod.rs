//! SQLite storage for the Stork server.
//!
//! Provides persistence for machines, apps, daemons, DHCP networks and
//! hosts, users, settings, events, configuration reviews and DNS zones.

mod db;
mod models;
mod queries_hosts;
mod queries_machines;
mod queries_networks;
mod queries_reviews;
mod queries_settings;
mod queries_users;
mod queries_zones;


pub use db::{DatabaseError, ServerDatabase};
pub use models::*;
pub use queries_settings::{SETTING_DEFAULTS, setting_default};
pub use queries_networks::CommittedNetworks;
pub use queries_users::DEFAULT_ADMIN_LOGIN;
