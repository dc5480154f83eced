//! targetd JSON-RPC wire types

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Every request carries the same id; calls are never pipelined
pub const REQUEST_ID: i32 = 0;

// =============================================================================
// Envelope
// =============================================================================

/// JSON-RPC request envelope
#[derive(Debug, Serialize)]
pub struct Request<'a, P: Serialize + ?Sized> {
    #[serde(rename = "jsonrpc")]
    pub version: &'static str,
    pub id: i32,
    pub method: &'a str,
    #[serde(rename = "params", skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a P>,
}

impl<'a, P: Serialize + ?Sized> Request<'a, P> {
    pub fn new(method: &'a str, params: Option<&'a P>) -> Self {
        Self {
            version: JSONRPC_VERSION,
            id: REQUEST_ID,
            method,
            params,
        }
    }
}

/// JSON-RPC response envelope
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Response {
    #[serde(rename = "jsonrpc", default)]
    pub version: String,
    #[serde(default)]
    pub id: Option<i32>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// Application-level error embedded in a response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

// =============================================================================
// Exports
// =============================================================================

/// A volume exported to one initiator at one LUN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub initiator_wwn: String,
    pub lun: i32,
    pub vol_name: String,
    pub vol_size: u64,
    pub vol_uuid: String,
    pub pool: String,
}

// =============================================================================
// Method Parameters
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CreateVolumeParams<'a> {
    pub pool: &'a str,
    pub name: &'a str,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroyVolumeParams<'a> {
    pub pool: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateExportParams<'a> {
    pub pool: &'a str,
    pub vol: &'a str,
    pub initiator_wwn: &'a str,
    pub lun: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestroyExportParams<'a> {
    pub pool: &'a str,
    pub vol: &'a str,
    pub initiator_wwn: &'a str,
}
