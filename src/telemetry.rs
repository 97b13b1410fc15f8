//! Tracing initialization.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingConfig};

pub struct TelemetryConfig {
    pub verbose: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbose: u8, logging: LoggingConfig) -> Self {
        Self { verbose, logging }
    }

    fn filter(&self) -> EnvFilter {
        let directive = match self.verbose {
            0 => self.logging.filter.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };
        EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Keeps the subscriber alive for the process lifetime.
pub struct TelemetryGuard {
    _private: (),
}

pub fn init(cfg: TelemetryConfig) -> TelemetryGuard {
    let filter = cfg.filter();
    let result = match cfg.logging.format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .finish()
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .finish()
            .try_init(),
    };
    if result.is_err() {
        // A subscriber is already installed (tests, embedding); keep it.
        tracing::debug!("telemetry already initialized");
    }
    TelemetryGuard { _private: () }
}
