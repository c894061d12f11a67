//! SQLite database for the Stork server.

stork_core::define_database!(ServerDatabase, "Server database migrations complete");

pub use stork_core::db::DatabaseError;
