use thiserror::Error;

/// Invalid parameters handed to a bandwidth component at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("invalid RED thresholds: min ({min} bytes) must be below max ({max} bytes)")]
    InvalidThresholds { min: u64, max: u64 },

    #[error("nominal bandwidth must be positive")]
    ZeroBandwidth,
}
