//! Error types for Luos waveform decoding

use thiserror::Error;

/// Result type for Luos decoding operations
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Error types encountered while configuring or driving a decode run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bit rate outside the supported range
    #[error("Invalid bit rate: {0}")]
    InvalidBitRate(String),

    /// Sample rate too low for the configured bit rate
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(String),

    /// Malformed capture buffer (unordered or out-of-range edges)
    #[error("Invalid capture: {0}")]
    InvalidCapture(String),

    /// A field value outside the set the bus reserves
    #[error("Invalid field value: {0}")]
    InvalidFieldValue(String),

    /// A cursor ran past the end of its capture buffer
    ///
    /// Not a fault: the session converts this into a clean end of run
    /// once the current message is abandoned.
    #[error("End of capture reached")]
    EndOfCapture,
}

impl DecodeError {
    /// Create a new InvalidBitRate error
    pub fn invalid_bit_rate(msg: impl Into<String>) -> Self {
        DecodeError::InvalidBitRate(msg.into())
    }

    /// Create a new InvalidSampleRate error
    pub fn invalid_sample_rate(msg: impl Into<String>) -> Self {
        DecodeError::InvalidSampleRate(msg.into())
    }

    /// Create a new InvalidCapture error
    pub fn invalid_capture(msg: impl Into<String>) -> Self {
        DecodeError::InvalidCapture(msg.into())
    }

    /// Create a new InvalidFieldValue error
    pub fn invalid_field_value(msg: impl Into<String>) -> Self {
        DecodeError::InvalidFieldValue(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::invalid_bit_rate("0 is out of range");
        assert!(err.to_string().contains("Invalid bit rate"));

        let err = DecodeError::EndOfCapture;
        assert!(err.to_string().contains("End of capture"));
    }
}
