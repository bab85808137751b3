//! Result and error types for slotcov.

use thiserror::Error;

/// Result type for slotcov operations
pub type CoverageResult<T> = Result<T, CoverageError>;

/// Errors that can occur while allocating, recording, persisting or merging coverage
#[derive(Debug, Error)]
pub enum CoverageError {
    /// The front-end could not map a file to slots
    #[error("Malformed source {path}: {reason}")]
    MalformedSource {
        /// Path of the offending file
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// Checksum mismatch or truncated data point
    #[error("Corrupted data point {source_name}: {reason}")]
    CorruptedDataPoint {
        /// File name or label of the data point
        source_name: String,
        /// What failed to validate
        reason: String,
    },

    /// Format version outside the supported range
    #[error(
        "Unsupported format version {found} in {source_name} (supported {min_supported}..={max_supported})"
    )]
    UnsupportedFormat {
        /// File name or label of the input
        source_name: String,
        /// Version found in the header
        found: u16,
        /// Lowest readable version
        min_supported: u16,
        /// Highest readable version
        max_supported: u16,
    },

    /// No structural diff path from the data point's registry version
    #[error(
        "No registry available to remap data point version {data_point_version} onto registry version {registry_version}"
    )]
    RegistryVersionMismatch {
        /// Registry version the data point was recorded against
        data_point_version: u64,
        /// Registry version being merged into
        registry_version: u64,
    },

    /// Data point recorded too many registry versions ago
    #[error(
        "Data point version {data_point_version} lags registry version {registry_version} by more than {max_lag}"
    )]
    StaleDataPoint {
        /// Registry version the data point was recorded against
        data_point_version: u64,
        /// Registry version being merged into
        registry_version: u64,
        /// Configured maximum lag
        max_lag: u64,
    },

    /// Stored registry could not be read back
    #[error("Corrupted registry {source_name}: {reason}")]
    CorruptedRegistry {
        /// File name of the stored registry
        source_name: String,
        /// What failed to validate
        reason: String,
    },

    /// Counter store cannot hold the requested slot count
    #[error("Counter store capacity exceeded: requested {requested} slots, maximum {max}")]
    CapacityExceeded {
        /// Requested number of slots
        requested: usize,
        /// Hard maximum
        max: usize,
    },

    /// Counter memory could not be reserved
    #[error("Failed to allocate counter memory for {slots} slots")]
    AllocationFailed {
        /// Number of slots in the segment that failed
        slots: usize,
    },

    /// Internal invariant broken (e.g. duplicate slot within one registry version)
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        /// Description
        message: String,
    },

    /// Operation was cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration could not be loaded
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoverageError {
    /// Whether the error must be surfaced to the caller instead of being
    /// recovered locally by exclusion or skipping.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::AllocationFailed { .. }
                | Self::InvariantViolation { .. }
        )
    }

    pub(crate) fn corrupted(source_name: &str, reason: impl Into<String>) -> Self {
        Self::CorruptedDataPoint {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(path: &str, reason: impl Into<String>) -> Self {
        Self::MalformedSource {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
