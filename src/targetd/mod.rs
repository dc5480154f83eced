//! targetd Daemon Client
//!
//! JSON-RPC access to the targetd storage daemon:
//! - Transport: one authenticated request/response per call
//! - Methods: volume and export management

pub mod client;
pub mod methods;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use client::TargetdClient;
pub use types::{Export, Response, RpcError};
