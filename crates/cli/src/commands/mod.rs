//! Subcommand implementations

pub mod inspect;
pub mod remote;
pub mod train;
