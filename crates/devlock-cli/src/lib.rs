//! devlock CLI - Command-line client for the device lock daemon
//!
//! This crate provides a typed client over the daemon's IPC protocol and
//! the `devlock` command built on it.

pub mod client;
pub mod commands;

pub use client::{ClientError, DevlockClient};
pub use commands::*;
