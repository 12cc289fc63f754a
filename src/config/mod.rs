//! Configuration module
//!
//! Handles loading server settings from defaults and TOML files.

mod server;

pub use server::*;
