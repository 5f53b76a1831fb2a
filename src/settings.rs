//! Decode-run configuration and derived bit timing

use crate::consts;
use crate::error::{DecodeError, Result};

/// Validated configuration of one decode run
///
/// Channel captures are passed to the session separately; whether an Rx
/// capture is supplied is what selects one-wire versus dual-channel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecoderSettings {
    bit_rate: u32,
    sample_rate: u32,
}

impl DecoderSettings {
    /// Create settings, validating rate ranges
    pub fn new(bit_rate: u32, sample_rate: u32) -> Result<Self> {
        if bit_rate < consts::MIN_BIT_RATE || bit_rate > consts::MAX_BIT_RATE {
            return Err(DecodeError::invalid_bit_rate(format!(
                "Bit rate {} out of range [{}, {}]",
                bit_rate,
                consts::MIN_BIT_RATE,
                consts::MAX_BIT_RATE
            )));
        }
        let min_sample_rate = bit_rate.saturating_mul(consts::MIN_SAMPLE_RATE_FACTOR);
        if sample_rate < min_sample_rate {
            return Err(DecodeError::invalid_sample_rate(format!(
                "Sample rate {} below minimum {} ({}x the bit rate)",
                sample_rate,
                min_sample_rate,
                consts::MIN_SAMPLE_RATE_FACTOR
            )));
        }
        let samples_per_bit = sample_rate / bit_rate;
        if samples_per_bit > u32::MAX / consts::TIMEOUT_BIT_PERIODS {
            return Err(DecodeError::invalid_sample_rate(format!(
                "Sample rate {} oversamples bit rate {} beyond the timeout window's reach",
                sample_rate, bit_rate
            )));
        }
        Ok(DecoderSettings {
            bit_rate,
            sample_rate,
        })
    }

    /// Configured bit rate in bits per second
    pub fn bit_rate(&self) -> u32 {
        self.bit_rate
    }

    /// Configured sample rate in samples per second
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration of one transmitted bit in samples
    pub fn samples_per_bit(&self) -> u32 {
        self.sample_rate / self.bit_rate
    }

    /// Distance from a start-bit edge to the center of the first data bit
    pub fn first_bit_offset(&self) -> u32 {
        let spb = self.samples_per_bit();
        spb + spb / 2
    }

    /// Inactivity threshold in samples: 20 bit periods without a transition
    /// abandons the frame in progress
    pub fn timeout_samples(&self) -> u32 {
        consts::TIMEOUT_BIT_PERIODS * self.samples_per_bit()
    }
}
