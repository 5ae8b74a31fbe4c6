//! Network I/O module
//!
//! Provides the framed connection and the async transfer client and server.

pub mod client;
pub mod connection;
pub mod server;

pub use client::{TransferClient, TransferOutcome};
pub use connection::FramedConnection;
pub use server::{run_session, TransferServer};
