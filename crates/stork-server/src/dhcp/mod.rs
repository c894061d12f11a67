//! Kea DHCP support: option and parameter models, command synthesis and
//! conversion to and from Kea configuration JSON.

pub mod command;
pub mod options;
pub mod params;
pub mod recipe;
pub mod wire;

pub use command::{DaemonStatus, KeaCommand, KeaResponse};
pub use options::{DhcpOption, OptionError, OptionField};
pub use params::KeaParameters;
pub use recipe::{ConfigRecipe, DaemonCommands, Intent, KeaModuleError, Resource};
