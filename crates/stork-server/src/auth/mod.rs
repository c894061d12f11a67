//! Account credentials.

pub mod password;
