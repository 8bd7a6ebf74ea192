//! IPC for clients of the lock daemon
//!
//! Newline-delimited JSON over a Unix domain socket. Each connection is one
//! client identity: sessions, input registrations and tokens are bound to it
//! and released when it closes.

mod client;
mod connection;
mod server;
mod types;

#[cfg(unix)]
mod unix;

// Public API
pub use client::{IpcClient, IpcSession};
pub use server::IpcServer;
pub use types::{IpcRequest, IpcResponse, ServerFrame};
