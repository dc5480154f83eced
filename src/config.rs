//! Provisioner configuration
//!
//! Options are built once at startup and shared read-only (`Arc<Options>`)
//! with the targetd client, the provisioner and the controller loop.

use crate::error::{Error, Result};
use std::time::Duration;

pub const DEFAULT_TARGETD_PORT: u16 = 18700;
pub const DEFAULT_PROVISIONER_TYPE: &str = "targetd";
pub const DEFAULT_FILESYSTEM: &str = "ext4";
pub const DEFAULT_POOL: &str = "vg-targetd";

// =============================================================================
// targetd Connection
// =============================================================================

/// Connection settings for the targetd daemon
#[derive(Debug, Clone)]
pub struct TargetdOptions {
    /// Use plain HTTP instead of HTTPS
    pub insecure: bool,
    /// Daemon host name or address
    pub address: String,
    /// Daemon port
    pub port: u16,
    /// Basic auth user
    pub username: String,
    /// Basic auth password
    pub password: String,
    /// Treat an `error` member in a 200 response as a failure
    pub strict_errors: bool,
}

impl Default for TargetdOptions {
    fn default() -> Self {
        Self {
            insecure: true,
            address: String::new(),
            port: DEFAULT_TARGETD_PORT,
            username: String::new(),
            password: String::new(),
            strict_errors: true,
        }
    }
}

impl TargetdOptions {
    /// JSON-RPC endpoint of the daemon
    pub fn endpoint(&self) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}:{}/targetrpc", scheme, self.address, self.port)
    }
}

// =============================================================================
// Controller Loop
// =============================================================================

/// Settings for the claim/volume controller loop
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// How often claims and volumes are re-listed
    pub resync_period: Duration,
    /// Attempts per claim before giving up (0 = unlimited)
    pub failed_provision_threshold: u32,
    /// Attempts per volume before giving up (0 = unlimited)
    pub failed_delete_threshold: u32,
    /// Back off exponentially between failed attempts
    pub exponential_backoff: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(15 * 60),
            failed_provision_threshold: 15,
            failed_delete_threshold: 15,
            exponential_backoff: true,
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Process-wide provisioner options
#[derive(Debug, Clone)]
pub struct Options {
    pub targetd: TargetdOptions,
    pub controller: ControllerOptions,
    /// Provisioner name storage classes refer to
    pub provisioner_type: String,
    /// Filesystem used when the class does not set `fsType`
    pub default_fs: String,
    /// Pool used when the class does not set `pool`
    pub default_pool: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            targetd: TargetdOptions::default(),
            controller: ControllerOptions::default(),
            provisioner_type: DEFAULT_PROVISIONER_TYPE.to_string(),
            default_fs: DEFAULT_FILESYSTEM.to_string(),
            default_pool: DEFAULT_POOL.to_string(),
        }
    }
}

impl Options {
    /// Name of the CHAP secret synthesized for authenticated volumes
    pub fn chap_secret_name(&self) -> String {
        format!("{}-chap", self.provisioner_type)
    }

    /// Check the options before any component is built from them
    pub fn validate(&self) -> Result<()> {
        if self.targetd.address.is_empty() {
            return Err(Error::Configuration("targetd address is required".into()));
        }
        if self.provisioner_type.is_empty() {
            return Err(Error::Configuration("provisioner type is required".into()));
        }
        if self.controller.resync_period.is_zero() {
            return Err(Error::Configuration("resync period must be positive".into()));
        }
        Ok(())
    }
}

/// Parse a duration such as `90`, `30s`, `15m` or `1h30m`
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".into()));
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let multiplier = match c {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            _ => return Err(Error::DurationParse(format!("unknown unit '{}' in {}", c, s))),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| Error::DurationParse(format!("missing value before '{}' in {}", c, s)))?;
        total = value
            .checked_mul(multiplier)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| Error::DurationParse(format!("duration {} is too large", s)))?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(Error::DurationParse(format!("trailing value without unit in {}", s)));
    }

    Ok(Duration::from_secs(total))
}
