//! targetd Provisioner
//!
//! A Kubernetes volume provisioner that carves iSCSI volumes out of a
//! targetd storage daemon and exports them to the cluster's initiators.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                      Provision Controller                          │
//! │        (claim / volume watchers, resync, retry accounting)         │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                      targetd Provisioner                           │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │    Parameter     │  │     LUN      │  │  Volume Descriptor   │  │
//! │  │    Resolver      │  │  Allocator   │  │  (recovery state)    │  │
//! │  └──────────────────┘  └──────────────┘  └──────────────────────┘  │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                 targetd JSON-RPC Client (HTTP)                     │
//! │        vol_create · vol_destroy · export_list/create/destroy       │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Watch loop driving provision and delete, leader election
//! - [`provisioner`]: Provision/Delete state machine against targetd
//! - [`targetd`]: JSON-RPC transport and daemon operations
//! - [`domain`]: Ports between the layers
//! - [`config`]: Process-wide options
//! - [`quantity`]: Kubernetes capacity quantities
//! - [`metrics`]: Prometheus counters and histograms
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod provisioner;
pub mod quantity;
pub mod targetd;

// Re-export commonly used types
pub use config::{ControllerOptions, Options, TargetdOptions};

pub use controller::{KubeCluster, LeaderElection, LeaseConfig, ProvisionController, RetryTracker};

pub use domain::ports::{
    ClusterApi, ClusterApiRef, ProvisionOptions, TargetdApi, TargetdApiRef, VolumeProvisioner,
    VolumeProvisionerRef,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::{Metrics, Outcome};

pub use provisioner::{RecoveryState, TargetdProvisioner, VolumeSpec};

pub use quantity::Capacity;

pub use targetd::{Export, TargetdClient};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
