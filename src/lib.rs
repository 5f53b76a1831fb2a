//! # Luos Bus Decoder
//!
//! A Rust library for decoding the Luos field-bus protocol from captured
//! digital waveforms (one line in half-duplex "one-wire" setups, or a
//! Tx/Rx pair).
//!
//! Given a capture and a bit rate, the decoder reconstructs the UART byte
//! framing, regroups bits into the protocol's multi-byte fields, verifies a
//! running CRC-16, arbitrates collisions between the two monitored lines
//! and classifies acknowledgement exchanges. This library provides:
//!
//! - A cursor abstraction over pre-captured digital channels
//! - The protocol state machine emitting typed, validated frames
//! - Collision arbitration and ack-window tracking in dual-channel mode
//! - Synthetic waveform generation for fixtures and self-test
//!
//! ## Features
//!
//! - `serde`: Enable serialization/deserialization support
//!
//! ## Example
//!
//! ```
//! use luos_decoder::{
//!     waveform, CancelToken, DecoderSession, DecoderSettings, WaveformBuilder,
//! };
//!
//! let settings = DecoderSettings::new(9600, 1_000_000)?;
//! let bytes = waveform::frame_bytes(0x1, 0x002, 0, 0x001, 12, 0, &[]);
//! let mut wave = WaveformBuilder::new(settings.samples_per_bit());
//! wave.idle_bits(4).bytes(&bytes);
//! let capture = wave.finish(25)?;
//!
//! let mut session = DecoderSession::new(&settings, &capture, None);
//! session.run(&CancelToken::new());
//! for frame in &session.results().frames {
//!     println!("{}", frame); // e.g. "CMD = 12 COLOR"
//! }
//! # Ok::<(), luos_decoder::DecodeError>(())
//! ```

pub mod crc;
pub mod cursor;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod settings;
pub mod waveform;

pub use crc::Crc16;
pub use cursor::{ChannelData, Cursor, Level};
pub use decoder::{CancelToken, DecoderSession, Results, RunEnd};
pub use error::{DecodeError, Result};
pub use frame::{AckCode, ChannelId, FieldKind, Frame, Marker, MarkerKind, TargetMode};
pub use settings::DecoderSettings;
pub use waveform::WaveformBuilder;

/// The Luos bus constants
pub mod consts {
    /// Inactivity threshold in bit periods: no transition for this long
    /// abandons the frame in progress (and bounds the ack wait)
    pub const TIMEOUT_BIT_PERIODS: u32 = 20;

    /// Hard cap on the number of data bytes consumed from one message
    pub const MAX_DATA_BYTES: u16 = 128;

    /// Lowest supported bit rate in bits per second
    pub const MIN_BIT_RATE: u32 = 1;

    /// Highest supported bit rate in bits per second
    pub const MAX_BIT_RATE: u32 = 6_000_000;

    /// Minimum oversampling of the bit rate required of a capture
    pub const MIN_SAMPLE_RATE_FACTOR: u32 = 4;
}
