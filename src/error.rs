//! Error types for the targetd provisioner
//!
//! Provides structured error types for the targetd transport, parameter
//! resolution, the provisioning state machine and the controller loop.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Request Validation Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid storage class parameter {key}={value:?}")]
    InvalidParameter { key: String, value: String },

    #[error("Volume {volume} is missing recovery annotation {key}")]
    MissingRecoveryState { volume: String, key: String },

    // =========================================================================
    // targetd Transport Errors
    // =========================================================================
    #[error("targetd transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("targetd returned {status}")]
    Protocol { status: String },

    #[error("targetd error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("targetd payload error: {0}")]
    Decode(#[from] serde_json::Error),

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    #[error("Failed to select viable LUN: {0}")]
    LunAllocation(String),

    #[error("Failed to create storage asset for volume {volume}: {reason}")]
    StorageAsset { volume: String, reason: String },

    #[error("Failed to export volume {volume} to initiator {initiator}: {reason}")]
    Export {
        volume: String,
        initiator: String,
        reason: String,
    },

    #[error("Failed to destroy volume {volume}: {reason}")]
    VolumeDestroy { volume: String, reason: String },

    // =========================================================================
    // Leader Election Errors
    // =========================================================================
    #[error("Lost leadership of lease {0}")]
    LeadershipLost(String),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Duration parse error: {0}")]
    DurationParse(String),

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // The claim or class has to change before another attempt can succeed
            Error::Validation(_)
            | Error::InvalidParameter { .. }
            | Error::CapacityParse(_)
            | Error::MissingRecoveryState { .. }
            | Error::Configuration(_)
            | Error::DurationParse(_) => ErrorAction::NoRequeue,

            // Partial exports are released first; give the daemon a moment before the retry
            Error::Export { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Kube(_) | Error::Protocol { .. })
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;
