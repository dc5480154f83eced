//! Prometheus metrics for provisioning outcomes

use crate::error::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramTimer, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Result label for counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Provisioner metrics, registered in their own registry
pub struct Metrics {
    registry: Registry,
    provisions: IntCounterVec,
    deletions: IntCounterVec,
    duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let provisions = IntCounterVec::new(
            Opts::new(
                "targetd_provisioner_provisions_total",
                "Provisioning attempts by outcome",
            ),
            &["outcome"],
        )?;
        let deletions = IntCounterVec::new(
            Opts::new(
                "targetd_provisioner_deletions_total",
                "Deletion attempts by outcome",
            ),
            &["outcome"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "targetd_provisioner_operation_duration_seconds",
                "Duration of provision and delete operations",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(provisions.clone()))?;
        registry.register(Box::new(deletions.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            provisions,
            deletions,
            duration,
        })
    }

    pub fn record_provision(&self, outcome: Outcome) {
        self.provisions.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_deletion(&self, outcome: Outcome) {
        self.deletions.with_label_values(&[outcome.as_str()]).inc();
    }

    /// Observes the elapsed time when dropped
    pub fn start_timer(&self, operation: &str) -> HistogramTimer {
        self.duration.with_label_values(&[operation]).start_timer()
    }

    /// Text exposition format and its content type
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
