//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration from the platform
//! config directory (or an explicit path) and supplies defaults for anything
//! the file leaves out.

pub mod config;
