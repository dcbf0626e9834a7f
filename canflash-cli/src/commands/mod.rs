//! Command implementations.
//!
//! Each subcommand is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod list;
pub(crate) mod set_id;
