//! The Luos protocol state machine
//!
//! [`DecoderSession`] walks one or two channel cursors through the fixed
//! field sequence of a Luos message (protocol, target, target mode, source,
//! cmd, size, data, crc, optional ack), feeding every completed wire byte to
//! the CRC engine and emitting one [`Frame`] per field. All error handling
//! is local: a framing timeout or CRC mismatch abandons the message and
//! resynchronizes on the next start bit.
//!
//! With two captures the session mirrors every bit on the Rx line while the
//! message is attributed to Tx; if the accumulated values of a field
//! diverge, the bus arbitration has been lost by Tx and the session adopts
//! the Rx bits for the field, its CRC bytes and the remainder of the
//! message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use crate::consts;
use crate::crc::Crc16;
use crate::cursor::{ChannelData, Cursor};
use crate::error::{DecodeError, Result};
use crate::frame::{ChannelId, FieldKind, Frame, Marker, MarkerKind, TargetMode};
use crate::settings::DecoderSettings;

/// How a decode run came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The capture buffer ran out of samples
    CaptureExhausted,
    /// The cancel token was raised between messages
    Cancelled,
}

/// Cooperative cancellation flag, polled once per state step
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the not-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the run stops before its next state step
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// True once [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Append-only decode output: frames in emission order plus the marker
/// side channel
#[derive(Debug, Clone, Default)]
pub struct Results {
    /// Decoded fields, one per completed state-machine step
    pub frames: Vec<Frame>,
    /// Visualization markers
    pub markers: Vec<Marker>,
}

/// States of the per-message machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Protocol,
    Target,
    TargetMode,
    Source,
    Cmd,
    Size,
    Data,
    Crc,
    Ack,
    Wait,
}

/// One or two monitored lines
enum ChannelSet<'a> {
    Single { tx: Cursor<'a> },
    Dual { tx: Cursor<'a>, rx: Cursor<'a> },
}

/// Per-message working storage, reset on every Protocol entry
///
/// `rx_active` and `compare_rx` are routing decisions made by the Wait scan
/// and therefore survive the reset; `compare_rx` implies `!rx_active`.
#[derive(Debug, Default)]
struct Scratch {
    /// bits consumed of the UART byte in flight, 0..=8
    bit_counter: u8,
    /// raw byte accumulator on the sending line
    byte_pri: u8,
    /// raw byte accumulator on the mirrored Rx line
    byte_sec: u8,
    /// completed bytes awaiting the CRC engine (at most two per field)
    pending_pri: Vec<u8>,
    pending_sec: Vec<u8>,
    target: u16,
    source: u16,
    size: u16,
    data_idx: u16,
    ack_expected: bool,
    ack_window_end: u64,
    collision_active: bool,
    /// Rx is the sending line for the rest of the message
    rx_active: bool,
    /// sample Rx alongside Tx and compare field values
    compare_rx: bool,
    /// Wait must drain a full timeout window of silence before re-arming
    resync_after_error: bool,
}

impl Scratch {
    fn begin_message(&mut self) {
        self.bit_counter = 0;
        self.byte_pri = 0;
        self.byte_sec = 0;
        self.pending_pri.clear();
        self.pending_sec.clear();
        self.target = 0;
        self.source = 0;
        self.size = 0;
        self.data_idx = 0;
        self.ack_expected = false;
        self.ack_window_end = 0;
        self.collision_active = false;
        self.resync_after_error = false;
    }
}

/// Field value as accumulated on the sending line and, in mirrored mode,
/// on the Rx line
struct FieldRead {
    pri: u32,
    sec: u32,
}

/// One decoding run over one or two captured channels
///
/// The session owns the cursors, the CRC accumulator and all per-message
/// scratch; it is driven single-threaded and emits into its own [`Results`].
pub struct DecoderSession<'a> {
    spb: u32,
    first_bit: u32,
    timeout: u32,
    channels: ChannelSet<'a>,
    state: State,
    crc: Crc16,
    scratch: Scratch,
    results: Results,
    progress: Option<Box<dyn FnMut(u64) + 'a>>,
}

impl<'a> DecoderSession<'a> {
    /// Create a session over a Tx capture and an optional Rx capture;
    /// omitting Rx selects one-wire (half-duplex) mode
    pub fn new(
        settings: &DecoderSettings,
        tx: &'a ChannelData,
        rx: Option<&'a ChannelData>,
    ) -> Self {
        let channels = match rx {
            Some(rx) => ChannelSet::Dual {
                tx: tx.cursor(),
                rx: rx.cursor(),
            },
            None => ChannelSet::Single { tx: tx.cursor() },
        };
        DecoderSession {
            spb: settings.samples_per_bit(),
            first_bit: settings.first_bit_offset(),
            timeout: settings.timeout_samples(),
            channels,
            state: State::Wait,
            crc: Crc16::new(),
            scratch: Scratch::default(),
            results: Results::default(),
            progress: None,
        }
    }

    /// Install a progress callback, invoked once per emitted frame with the
    /// frame's end sample (monotonically increasing)
    pub fn on_progress(&mut self, callback: impl FnMut(u64) + 'a) {
        self.progress = Some(Box::new(callback));
    }

    /// Decode output accumulated so far
    pub fn results(&self) -> &Results {
        &self.results
    }

    /// Consume the session, yielding its output
    pub fn into_results(self) -> Results {
        self.results
    }

    /// Drive the state machine until the capture runs out or the token is
    /// raised
    pub fn run(&mut self, cancel: &CancelToken) -> RunEnd {
        debug!(
            "decode run: {} samples/bit, timeout {} samples, {}",
            self.spb,
            self.timeout,
            if self.is_dual() { "dual-channel" } else { "one-wire" }
        );
        let end = match self.run_inner(cancel) {
            Ok(end) => end,
            // the only error that escapes the state machine
            Err(_) => RunEnd::CaptureExhausted,
        };
        debug!(
            "decode run finished ({:?}): {} frames, {} markers",
            end,
            self.results.frames.len(),
            self.results.markers.len()
        );
        end
    }

    fn run_inner(&mut self, cancel: &CancelToken) -> Result<RunEnd> {
        self.position_start()?;
        loop {
            if cancel.is_cancelled() {
                return Ok(RunEnd::Cancelled);
            }
            match self.state {
                State::Protocol => self.state_protocol()?,
                State::Target => self.state_target()?,
                State::TargetMode => self.state_target_mode()?,
                State::Source => self.state_source()?,
                State::Cmd => self.state_cmd()?,
                State::Size => self.state_size()?,
                State::Data => self.state_data()?,
                State::Crc => self.state_crc()?,
                State::Ack => self.state_ack()?,
                State::Wait => self.state_wait()?,
            }
        }
    }

    /// Lines idling low are moved to their first rising edge so the Wait
    /// scan sees falling edges as start-bit candidates
    fn position_start(&mut self) -> Result<()> {
        match &mut self.channels {
            ChannelSet::Single { tx } => {
                if tx.level().is_low() {
                    tx.advance_to_next_edge()?;
                }
            }
            ChannelSet::Dual { tx, rx } => {
                if tx.level().is_low() {
                    tx.advance_to_next_edge()?;
                }
                if rx.level().is_low() {
                    rx.advance_to_next_edge()?;
                }
            }
        }
        self.state = State::Wait;
        Ok(())
    }

    // ----- cursor plumbing -------------------------------------------------

    fn is_dual(&self) -> bool {
        matches!(self.channels, ChannelSet::Dual { .. })
    }

    fn primary(&self) -> &Cursor<'a> {
        match &self.channels {
            ChannelSet::Single { tx } => tx,
            ChannelSet::Dual { tx, rx } => {
                if self.scratch.rx_active {
                    rx
                } else {
                    tx
                }
            }
        }
    }

    fn primary_mut(&mut self) -> &mut Cursor<'a> {
        let rx_active = self.scratch.rx_active;
        match &mut self.channels {
            ChannelSet::Single { tx } => tx,
            ChannelSet::Dual { tx, rx } => {
                if rx_active {
                    rx
                } else {
                    tx
                }
            }
        }
    }

    fn primary_channel(&self) -> ChannelId {
        if self.scratch.rx_active {
            ChannelId::Rx
        } else {
            ChannelId::Tx
        }
    }

    /// Sample span boundary: half a bit behind the sending cursor
    fn half_bit_back(&self) -> u64 {
        self.primary().sample_index() - (self.spb / 2) as u64
    }

    fn timeout_hit(&self) -> bool {
        !self.primary().would_transition_within(self.timeout)
    }

    fn mark(&mut self, sample: u64, kind: MarkerKind, channel: ChannelId) {
        self.results.markers.push(Marker {
            sample,
            kind,
            channel,
        });
    }

    /// Markers for one sampled bit, per the active channel mode
    fn mark_bit(&mut self) {
        let (tx_pos, rx_pos) = match &self.channels {
            ChannelSet::Single { tx } => (tx.sample_index(), None),
            ChannelSet::Dual { tx, rx } => (tx.sample_index(), Some(rx.sample_index())),
        };
        match rx_pos {
            None => self.mark(tx_pos, MarkerKind::Sample, ChannelId::Tx),
            Some(rx_pos) => {
                if self.scratch.rx_active {
                    self.mark(rx_pos, MarkerKind::Sample, ChannelId::Rx);
                    if self.scratch.collision_active {
                        // arbitration loss overlay on the silenced line
                        self.mark(rx_pos, MarkerKind::Error, ChannelId::Tx);
                    }
                } else if self.scratch.compare_rx {
                    self.mark(tx_pos, MarkerKind::Sample, ChannelId::Tx);
                    self.mark(rx_pos, MarkerKind::AckSquare, ChannelId::Rx);
                } else {
                    self.mark(tx_pos, MarkerKind::Sample, ChannelId::Tx);
                }
            }
        }
    }

    /// Levels to accumulate this bit from: sending line, plus the mirrored
    /// Rx line while comparison is armed
    fn sample_levels(&self) -> (bool, Option<bool>) {
        match &self.channels {
            ChannelSet::Single { tx } => (tx.level().is_high(), None),
            ChannelSet::Dual { tx, rx } => {
                if self.scratch.rx_active {
                    (rx.level().is_high(), None)
                } else if self.scratch.compare_rx {
                    (tx.level().is_high(), Some(rx.level().is_high()))
                } else {
                    (tx.level().is_high(), None)
                }
            }
        }
    }

    /// Move the sampling cursor(s) one bit period forward
    fn advance_bit(&mut self) -> Result<()> {
        let spb = self.spb;
        let rx_active = self.scratch.rx_active;
        let compare = self.scratch.compare_rx;
        match &mut self.channels {
            ChannelSet::Single { tx } => tx.advance(spb),
            ChannelSet::Dual { tx, rx } => {
                if rx_active {
                    rx.advance(spb)
                } else if compare {
                    tx.advance(spb)?;
                    rx.advance(spb)
                } else {
                    tx.advance(spb)
                }
            }
        }
    }

    /// Cross the stop/start gap onto the center of the next byte's first bit
    ///
    /// Returns false after routing to Wait when no transition arrives inside
    /// the timeout window.
    fn hop_to_next_byte(&mut self) -> Result<bool> {
        if self.timeout_hit() {
            self.framing_timeout();
            return Ok(false);
        }
        let first_bit = self.first_bit;
        {
            let cur = self.primary_mut();
            cur.advance_to_next_edge()?;
            cur.advance(first_bit)?;
        }
        if self.scratch.compare_rx {
            let timeout = self.timeout;
            let rx_stalled = match &self.channels {
                ChannelSet::Dual { rx, .. } => !rx.would_transition_within(timeout),
                ChannelSet::Single { .. } => false,
            };
            if rx_stalled {
                self.framing_timeout();
                return Ok(false);
            }
            if let ChannelSet::Dual { rx, .. } = &mut self.channels {
                rx.advance_to_next_edge()?;
                rx.advance(first_bit)?;
            }
        }
        Ok(true)
    }

    /// In dual mode, pull a lagging Tx cursor up to the Rx position so the
    /// next Wait scan starts from a consistent point on both lines
    fn sync_tx_forward(&mut self) {
        if let ChannelSet::Dual { tx, rx } = &mut self.channels {
            if rx.sample_index() > tx.sample_index() {
                // best effort: the Tx capture may simply be shorter
                let _ = tx.advance_to(rx.sample_index());
            }
        }
    }

    /// Align whichever line is behind with the one ahead
    fn sync_dual(&mut self) {
        if let ChannelSet::Dual { tx, rx } = &mut self.channels {
            let (tp, rp) = (tx.sample_index(), rx.sample_index());
            if rp > tp {
                let _ = tx.advance_to(rp);
            } else if tp > rp {
                let _ = rx.advance_to(tp);
            }
        }
    }

    // ----- field machinery -------------------------------------------------

    /// Abandon the frame in progress: error marker, no frame, Wait with a
    /// silence drain
    fn framing_timeout(&mut self) {
        let pos = self.primary().sample_index();
        let ch = self.primary_channel();
        debug!("framing timeout at sample {} on {}", pos, ch);
        self.mark(pos, MarkerKind::Error, ch);
        self.scratch.ack_expected = false;
        self.scratch.resync_after_error = true;
        self.state = State::Wait;
    }

    /// Finish the UART byte in flight and queue it for the CRC engine
    fn push_byte(&mut self) {
        let s = &mut self.scratch;
        s.pending_pri.push(s.byte_pri);
        s.pending_sec.push(s.byte_sec);
        s.byte_pri = 0;
        s.byte_sec = 0;
        s.bit_counter = 0;
    }

    /// Read `width` field bits LSB-first, crossing byte boundaries
    /// transparently
    ///
    /// Expects the sending cursor on the center of the field's first bit.
    /// `checked_bits` limits the per-bit timeout lookahead to the given bit
    /// index (the CRC field must not demand an edge after the message when
    /// no ack follows). Returns None after a timeout routed the machine to
    /// Wait.
    fn read_bits(&mut self, width: u32, checked_bits: Option<u32>) -> Result<Option<FieldRead>> {
        let mut pri = 0u32;
        let mut sec = 0u32;
        for i in 0..width {
            // lookahead runs before the byte hop so the gap is measured from
            // the stop-bit center, and trailing all-high bytes are not asked
            // for an edge that never comes
            let checked = checked_bits.map_or(true, |limit| i <= limit);
            if checked && self.timeout_hit() {
                self.framing_timeout();
                return Ok(None);
            }
            if self.scratch.bit_counter == 8 {
                self.push_byte();
                if !self.hop_to_next_byte()? {
                    return Ok(None);
                }
            }
            self.mark_bit();
            let (pri_high, sec_high) = self.sample_levels();
            if pri_high {
                pri |= 1 << i;
                self.scratch.byte_pri |= 1 << self.scratch.bit_counter;
            }
            if sec_high == Some(true) {
                sec |= 1 << i;
                self.scratch.byte_sec |= 1 << self.scratch.bit_counter;
            }
            self.scratch.bit_counter += 1;
            self.advance_bit()?;
        }
        Ok(Some(FieldRead { pri, sec }))
    }

    /// Close a field: arbitrate a Tx/Rx divergence, flush a byte completed
    /// on the field boundary and feed the queued bytes to the CRC engine
    fn end_field(&mut self, read: FieldRead, arbitrate: bool, feed_crc: bool) -> u32 {
        let mut value = read.pri;
        if arbitrate && self.scratch.compare_rx && read.sec != read.pri {
            debug!(
                "collision: Tx value {:#X} diverges from Rx value {:#X}, Rx takes the bus",
                read.pri, read.sec
            );
            value = read.sec;
            self.scratch.byte_pri = self.scratch.byte_sec;
            std::mem::swap(&mut self.scratch.pending_pri, &mut self.scratch.pending_sec);
            self.scratch.compare_rx = false;
            self.scratch.rx_active = true;
            self.scratch.collision_active = true;
        }
        if self.scratch.bit_counter == 8 {
            self.push_byte();
        }
        if feed_crc {
            for &b in &self.scratch.pending_pri {
                self.crc.update(b);
            }
        }
        self.scratch.pending_pri.clear();
        self.scratch.pending_sec.clear();
        value
    }

    /// Append a frame and report progress
    fn emit(&mut self, kind: FieldKind, value: u32, start: u64, end: u64) {
        let frame = Frame {
            kind,
            value,
            start_sample: start,
            end_sample: end,
        };
        trace!("frame: {} [{}..{}]", frame, start, end);
        self.results.frames.push(frame);
        if let Some(callback) = self.progress.as_mut() {
            callback(end);
        }
    }

    // ----- states ----------------------------------------------------------

    fn state_protocol(&mut self) -> Result<()> {
        self.crc = Crc16::new();
        self.scratch.begin_message();
        // the Wait scan leaves Tx-driven modes on the start-bit edge and an
        // Rx sender already on its first bit center
        if !self.scratch.rx_active {
            let first_bit = self.first_bit;
            self.primary_mut().advance(first_bit)?;
        }
        if self.timeout_hit() {
            self.framing_timeout();
            return Ok(());
        }
        let start = self.half_bit_back();
        let read = match self.read_bits(4, None)? {
            Some(read) => read,
            None => return Ok(()),
        };
        let value = self.end_field(read, true, true);
        let end = self.half_bit_back();
        self.emit(FieldKind::Protocol, value, start, end);
        self.state = State::Target;
        Ok(())
    }

    fn state_target(&mut self) -> Result<()> {
        if self.timeout_hit() {
            self.framing_timeout();
            return Ok(());
        }
        let start = self.half_bit_back();
        let read = match self.read_bits(12, None)? {
            Some(read) => read,
            None => return Ok(()),
        };
        let value = self.end_field(read, true, true);
        self.scratch.target = value as u16;
        let end = self.half_bit_back();
        self.emit(FieldKind::Target, value, start, end);
        self.state = State::TargetMode;
        Ok(())
    }

    fn state_target_mode(&mut self) -> Result<()> {
        if !self.hop_to_next_byte()? {
            return Ok(());
        }
        let start = self.half_bit_back();
        let read = match self.read_bits(4, None)? {
            Some(read) => read,
            None => return Ok(()),
        };
        let value = self.end_field(read, true, true);
        self.scratch.ack_expected = TargetMode::try_from(value)
            .map(|mode| mode.expects_ack())
            .unwrap_or(false);
        let end = self.half_bit_back();
        self.emit(FieldKind::TargetMode, value, start, end);
        self.state = State::Source;
        Ok(())
    }

    fn state_source(&mut self) -> Result<()> {
        if self.timeout_hit() {
            self.framing_timeout();
            return Ok(());
        }
        let start = self.half_bit_back();
        let read = match self.read_bits(12, None)? {
            Some(read) => read,
            None => return Ok(()),
        };
        let value = self.end_field(read, true, true);
        self.scratch.source = value as u16;
        let end = self.half_bit_back();
        self.emit(FieldKind::Source, value, start, end);
        self.state = State::Cmd;
        Ok(())
    }

    fn state_cmd(&mut self) -> Result<()> {
        if !self.hop_to_next_byte()? {
            return Ok(());
        }
        let start = self.half_bit_back();
        let read = match self.read_bits(8, None)? {
            Some(read) => read,
            None => return Ok(()),
        };
        let value = self.end_field(read, true, true);
        let end = self.half_bit_back();
        self.emit(FieldKind::Cmd, value, start, end);
        self.sync_tx_forward();
        self.state = State::Size;
        Ok(())
    }

    fn state_size(&mut self) -> Result<()> {
        if !self.hop_to_next_byte()? {
            return Ok(());
        }
        let start = self.half_bit_back();
        let read = match self.read_bits(16, None)? {
            Some(read) => read,
            None => return Ok(()),
        };
        let value = self.end_field(read, true, true);
        self.scratch.size = value as u16;
        let end = self.half_bit_back();
        self.emit(FieldKind::Size, value, start, end);
        self.sync_tx_forward();
        self.state = if self.scratch.size == 0 {
            State::Crc
        } else {
            State::Data
        };
        Ok(())
    }

    fn state_data(&mut self) -> Result<()> {
        if !self.hop_to_next_byte()? {
            self.scratch.data_idx = 0;
            return Ok(());
        }
        let start = self.half_bit_back();
        let read = match self.read_bits(8, None)? {
            Some(read) => read,
            None => {
                self.scratch.data_idx = 0;
                return Ok(());
            }
        };
        let value = self.end_field(read, true, true);
        let end = self.half_bit_back();
        self.emit(FieldKind::Data(self.scratch.data_idx), value, start, end);
        self.scratch.data_idx += 1;
        self.sync_tx_forward();
        if self.scratch.data_idx == self.scratch.size
            || self.scratch.data_idx == consts::MAX_DATA_BYTES
        {
            self.state = State::Crc;
        }
        Ok(())
    }

    fn state_crc(&mut self) -> Result<()> {
        if !self.hop_to_next_byte()? {
            return Ok(());
        }
        let start = self.half_bit_back();
        let read = match self.read_bits(16, Some(8))? {
            Some(read) => read,
            None => return Ok(()),
        };
        // verification is read-only: the received field never enters the
        // accumulator
        let received = self.end_field(read, false, false);
        let computed = self.crc.value() as u32;

        let mut ack_coming = false;
        if self.scratch.ack_expected {
            // window opens at the end of the last CRC bit
            let tracking = self.half_bit_back();
            self.mark(tracking, MarkerKind::TimeoutStart, ChannelId::Tx);
            if self.is_dual() {
                self.mark(tracking, MarkerKind::TimeoutStart, ChannelId::Rx);
            }
            let window_end = tracking + self.timeout as u64;
            self.scratch.ack_window_end = window_end;
            self.sync_dual();
            ack_coming = self.ack_transition_ahead();
            if !ack_coming {
                self.mark(window_end, MarkerKind::Error, ChannelId::Tx);
                if self.is_dual() {
                    self.mark(window_end, MarkerKind::Error, ChannelId::Rx);
                }
            }
        }

        let end = self.half_bit_back();
        if received == computed {
            self.emit(FieldKind::Crc, received, start, end);
            if self.scratch.ack_expected && ack_coming {
                self.state = State::Ack;
            } else {
                self.scratch.ack_expected = false;
                self.state = State::Wait;
            }
        } else {
            debug!(
                "CRC mismatch: received {:#06X}, computed {:#06X}",
                received, computed
            );
            self.emit(FieldKind::CrcInvalid, received, start, end);
            self.scratch.ack_expected = false;
            self.scratch.resync_after_error = true;
            self.state = State::Wait;
        }
        self.sync_tx_forward();
        Ok(())
    }

    /// True if either line transitions inside the ack window
    fn ack_transition_ahead(&self) -> bool {
        let timeout = self.timeout;
        match &self.channels {
            ChannelSet::Single { tx } => tx.would_transition_within(timeout),
            ChannelSet::Dual { tx, rx } => {
                tx.would_transition_within(timeout) || rx.would_transition_within(timeout)
            }
        }
    }

    /// Which line carries the acknowledgement, and whether Rx must first be
    /// aligned to Tx
    fn ack_routing(&self) -> (bool, bool) {
        if !self.is_dual() {
            return (false, false);
        }
        let s = &self.scratch;
        if s.target == s.source {
            // answered on the same line the message used
            (s.rx_active, false)
        } else if s.rx_active {
            if s.target == 0 {
                (true, false)
            } else {
                (false, false)
            }
        } else {
            (true, true)
        }
    }

    fn state_ack(&mut self) -> Result<()> {
        let (use_rx, align_rx) = self.ack_routing();
        let first_bit = self.first_bit;
        let spb = self.spb;
        let half = (self.spb / 2) as u64;
        if align_rx {
            if let ChannelSet::Dual { tx, rx } = &mut self.channels {
                rx.advance_to(tx.sample_index())?;
            }
        }
        let mut value = 0u32;
        let start;
        let end;
        {
            let results = &mut self.results;
            let (cur, ch) = match &mut self.channels {
                ChannelSet::Single { tx } => (tx, ChannelId::Tx),
                ChannelSet::Dual { tx, rx } => {
                    if use_rx {
                        (rx, ChannelId::Rx)
                    } else {
                        (tx, ChannelId::Tx)
                    }
                }
            };
            cur.advance_to_next_edge()?;
            cur.advance(first_bit)?;
            start = cur.sample_index() - half;
            for i in 0..8 {
                results.markers.push(Marker {
                    sample: cur.sample_index(),
                    kind: MarkerKind::Sample,
                    channel: ch,
                });
                if cur.level().is_high() {
                    value |= 1 << i;
                }
                cur.advance(spb)?;
            }
            end = cur.sample_index() - half;
        }
        let window_end = self.scratch.ack_window_end;
        self.mark(window_end, MarkerKind::TimeoutStop, ChannelId::Tx);
        if self.is_dual() {
            self.mark(window_end, MarkerKind::TimeoutStop, ChannelId::Rx);
        }
        self.sync_dual();
        self.emit(FieldKind::Ack, value, start, end);
        self.scratch.ack_expected = false;
        self.state = State::Wait;
        Ok(())
    }

    // ----- wait / resynchronization ---------------------------------------

    fn state_wait(&mut self) -> Result<()> {
        if self.scratch.resync_after_error {
            self.drain_silence()?;
            self.scratch.resync_after_error = false;
            if let ChannelSet::Single { .. } = self.channels {
                // the drain left the cursor on the next start-bit edge
                self.state = State::Protocol;
                return Ok(());
            }
            return self.dual_scan();
        }
        match &mut self.channels {
            ChannelSet::Single { tx } => loop {
                tx.advance_to_next_edge()?;
                if tx.level().is_low() {
                    self.state = State::Protocol;
                    return Ok(());
                }
            },
            ChannelSet::Dual { .. } => self.dual_scan(),
        }
    }

    /// Skip edges until a full timeout window of quiet, so mid-byte garbage
    /// is not mistaken for a start bit
    fn drain_silence(&mut self) -> Result<()> {
        let timeout = self.timeout;
        match &mut self.channels {
            ChannelSet::Single { tx } => {
                while tx.would_transition_within(timeout) {
                    tx.advance_to_next_edge()?;
                }
                tx.advance_to_next_edge()?;
                Ok(())
            }
            ChannelSet::Dual { tx, rx } => {
                while tx.would_transition_within(timeout) {
                    tx.advance_to_next_edge()?;
                }
                while rx.would_transition_within(timeout) {
                    rx.advance_to_next_edge()?;
                }
                // sender election re-arms from the quiet gaps
                Ok(())
            }
        }
    }

    /// Elect the sending line for the next message
    ///
    /// The line whose next edge comes first is the sender. If both lines
    /// start within one timeout window of each other the message is decoded
    /// from Tx with Rx mirrored bit-for-bit; any later divergence is a
    /// collision and resolves in favor of Rx.
    fn dual_scan(&mut self) -> Result<()> {
        let timeout = self.timeout as u64;
        let first_bit = self.first_bit;
        loop {
            let (tx_edge, rx_edge) = match &self.channels {
                ChannelSet::Dual { tx, rx } => (tx.next_edge_sample(), rx.next_edge_sample()),
                ChannelSet::Single { .. } => return Err(DecodeError::EndOfCapture),
            };
            let rx_solo = match (tx_edge, rx_edge) {
                (None, None) => return Err(DecodeError::EndOfCapture),
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (Some(te), Some(re)) => {
                    if re + timeout <= te {
                        true
                    } else if te + timeout <= re {
                        false
                    } else {
                        // both lines open within one window: mirrored start
                        if let ChannelSet::Dual { tx, rx } = &mut self.channels {
                            tx.advance_to_next_edge()?;
                            rx.advance_to_next_edge()?;
                            if tx.level().is_low() {
                                let mirrored = rx.level().is_low();
                                if mirrored {
                                    rx.advance(first_bit)?;
                                }
                                self.scratch.rx_active = false;
                                self.scratch.compare_rx = mirrored;
                                self.state = State::Protocol;
                                return Ok(());
                            }
                            if rx.level().is_low() {
                                rx.advance(first_bit)?;
                                self.scratch.rx_active = true;
                                self.scratch.compare_rx = false;
                                self.state = State::Protocol;
                                return Ok(());
                            }
                        }
                        continue;
                    }
                }
            };
            if rx_solo {
                if let ChannelSet::Dual { tx, rx } = &mut self.channels {
                    rx.advance_to_next_edge()?;
                    if rx.level().is_low() {
                        let pos = rx.sample_index();
                        let _ = tx.advance_to(pos);
                        rx.advance(first_bit)?;
                        self.scratch.rx_active = true;
                        self.scratch.compare_rx = false;
                        self.state = State::Protocol;
                        return Ok(());
                    }
                }
            } else if let ChannelSet::Dual { tx, rx } = &mut self.channels {
                tx.advance_to_next_edge()?;
                if tx.level().is_low() {
                    let _ = rx.advance_to(tx.sample_index());
                    self.scratch.rx_active = false;
                    self.scratch.compare_rx = false;
                    self.state = State::Protocol;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::{frame_bytes, WaveformBuilder};

    const BIT_RATE: u32 = 9600;
    const SAMPLE_RATE: u32 = 1_000_000;

    fn settings() -> DecoderSettings {
        DecoderSettings::new(BIT_RATE, SAMPLE_RATE).unwrap()
    }

    fn capture_of(bytes: &[u8]) -> ChannelData {
        let mut wave = WaveformBuilder::new(settings().samples_per_bit());
        wave.idle_bits(4).bytes(bytes);
        wave.finish(25).unwrap()
    }

    fn decode(tx: &ChannelData) -> Results {
        let s = settings();
        let mut session = DecoderSession::new(&s, tx, None);
        assert_eq!(session.run(&CancelToken::new()), RunEnd::CaptureExhausted);
        session.into_results()
    }

    fn decode_dual(tx: &ChannelData, rx: &ChannelData) -> Results {
        let s = settings();
        let mut session = DecoderSession::new(&s, tx, Some(rx));
        assert_eq!(session.run(&CancelToken::new()), RunEnd::CaptureExhausted);
        session.into_results()
    }

    fn kinds(results: &Results) -> Vec<FieldKind> {
        results.frames.iter().map(|f| f.kind).collect()
    }

    fn header_kinds() -> Vec<FieldKind> {
        vec![
            FieldKind::Protocol,
            FieldKind::Target,
            FieldKind::TargetMode,
            FieldKind::Source,
            FieldKind::Cmd,
            FieldKind::Size,
        ]
    }

    #[test]
    fn test_minimal_message() {
        let capture = capture_of(&frame_bytes(0x1, 0x000, 0, 0x001, 0, 0, &[]));
        let results = decode(&capture);

        let mut expected = header_kinds();
        expected.push(FieldKind::Crc);
        assert_eq!(kinds(&results), expected);

        let values: Vec<u32> = results.frames.iter().map(|f| f.value).collect();
        assert_eq!(values[0], 0x1); // protocol
        assert_eq!(values[1], 0x000); // target
        assert_eq!(values[2], 0); // mode ID
        assert_eq!(values[3], 0x001); // source
        assert_eq!(values[4], 0); // cmd
        assert_eq!(values[5], 0); // size

        // size 0: straight to a valid CRC, no data, no ack window
        assert!(!results
            .markers
            .iter()
            .any(|m| m.kind == MarkerKind::TimeoutStart));
        // 4+12+4+12+8+16+16 sampled bits, one dot each
        let dots = results
            .markers
            .iter()
            .filter(|m| m.kind == MarkerKind::Sample)
            .count();
        assert_eq!(dots, 72);
    }

    #[test]
    fn test_payload_bytes() {
        let payload = [0xAA, 0x55, 0x01];
        let capture = capture_of(&frame_bytes(0x1, 0x002, 2, 0x003, 12, 3, &payload));
        let results = decode(&capture);

        let mut expected = header_kinds();
        expected.extend([
            FieldKind::Data(0),
            FieldKind::Data(1),
            FieldKind::Data(2),
            FieldKind::Crc,
        ]);
        assert_eq!(kinds(&results), expected);
        assert_eq!(results.frames[6].value, 0xAA);
        assert_eq!(results.frames[7].value, 0x55);
        assert_eq!(results.frames[8].value, 0x01);
        assert_eq!(results.frames[4].value, 12); // cmd
    }

    #[test]
    fn test_frame_spans_and_progress() {
        let capture = capture_of(&frame_bytes(0x1, 0x005, 0, 0x001, 3, 1, &[0x42]));
        let s = settings();
        let mut reported = Vec::new();
        let results;
        {
            let mut session = DecoderSession::new(&s, &capture, None);
            session.on_progress(|sample| reported.push(sample));
            session.run(&CancelToken::new());
            results = session.into_results();
        }
        assert_eq!(reported.len(), results.frames.len());
        for (frame, sample) in results.frames.iter().zip(&reported) {
            assert_eq!(frame.end_sample, *sample);
            assert!(frame.start_sample < frame.end_sample);
        }
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_ack_observed() {
        let mut wave = WaveformBuilder::new(settings().samples_per_bit());
        wave.idle_bits(4)
            .bytes(&frame_bytes(0x1, 0x000, 1, 0x001, 0, 0, &[]))
            .idle_bits(5)
            .byte(0x0F);
        let capture = wave.finish(25).unwrap();
        let results = decode(&capture);

        let mut expected = header_kinds();
        expected.extend([FieldKind::Crc, FieldKind::Ack]);
        assert_eq!(kinds(&results), expected);
        assert_eq!(results.frames[7].value, 0x0F);
        assert!(results
            .markers
            .iter()
            .any(|m| m.kind == MarkerKind::TimeoutStart));
        assert!(results
            .markers
            .iter()
            .any(|m| m.kind == MarkerKind::TimeoutStop));
    }

    #[test]
    fn test_ack_missing() {
        let capture = capture_of(&frame_bytes(0x1, 0x000, 1, 0x001, 0, 0, &[]));
        let results = decode(&capture);

        let mut expected = header_kinds();
        expected.push(FieldKind::Crc);
        assert_eq!(kinds(&results), expected);

        // window opened, expired, flagged
        let start = results
            .markers
            .iter()
            .find(|m| m.kind == MarkerKind::TimeoutStart)
            .expect("window bracket");
        let timeout = settings().timeout_samples() as u64;
        assert!(results
            .markers
            .iter()
            .any(|m| m.kind == MarkerKind::Error && m.sample == start.sample + timeout));
        assert!(!results
            .markers
            .iter()
            .any(|m| m.kind == MarkerKind::TimeoutStop));
    }

    #[test]
    fn test_crc_mismatch_then_recovery() {
        let mut bad = frame_bytes(0x1, 0x004, 0, 0x001, 0, 0, &[]);
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        let good = frame_bytes(0x1, 0x004, 0, 0x002, 0, 0, &[]);

        let mut wave = WaveformBuilder::new(settings().samples_per_bit());
        wave.idle_bits(4).bytes(&bad).idle_bits(25).bytes(&good);
        let capture = wave.finish(25).unwrap();
        let results = decode(&capture);

        assert_eq!(results.frames.len(), 14);
        assert_eq!(results.frames[6].kind, FieldKind::CrcInvalid);
        assert_eq!(results.frames[13].kind, FieldKind::Crc);
        assert_eq!(results.frames[10].value, 0x002); // second message's source
    }

    #[test]
    fn test_truncated_message() {
        // one byte then silence: the protocol nibble decodes, the target
        // field times out mid-way
        let capture = capture_of(&[0x51]);
        let results = decode(&capture);
        assert_eq!(kinds(&results), vec![FieldKind::Protocol]);
        assert!(results.markers.iter().any(|m| m.kind == MarkerKind::Error));
    }

    #[test]
    fn test_interbyte_gap_tolerance() {
        let bytes = frame_bytes(0x1, 0x000, 0, 0x001, 0, 0, &[]);
        let timeout = settings().timeout_samples() as u64;
        let half = (settings().samples_per_bit() / 2) as u64;

        // the mid-field lookahead runs from the stop-bit center, so a pause
        // of timeout - half_bit before the next start edge sits exactly on
        // the threshold
        for (pause, decodes) in [(timeout - half - 1, true), (timeout - half, false)] {
            let mut wave = WaveformBuilder::new(settings().samples_per_bit());
            wave.idle_bits(4).byte(bytes[0]).idle_samples(pause);
            for &b in &bytes[1..] {
                wave.byte(b);
            }
            let capture = wave.finish(25).unwrap();
            let results = decode(&capture);
            if decodes {
                assert_eq!(results.frames.len(), 7, "pause {} should decode", pause);
                assert_eq!(results.frames[6].kind, FieldKind::Crc);
            } else {
                // the aborted message never completes its checksum; whatever
                // the resynchronization makes of the residue, no checksum
                // field can be assembled from the bytes left over
                assert!(
                    results
                        .frames
                        .iter()
                        .all(|f| !matches!(f.kind, FieldKind::Crc | FieldKind::CrcInvalid)),
                    "pause {} should time out",
                    pause
                );
                assert!(results.markers.iter().any(|m| m.kind == MarkerKind::Error));
            }
        }
    }

    #[test]
    fn test_data_capped_at_128() {
        let payload = vec![0x77u8; 128];
        // the size field claims more than the cap; collection stops at 128
        let capture = capture_of(&frame_bytes(0x1, 0x000, 0, 0x001, 0, 200, &payload));
        let results = decode(&capture);

        let data_frames = results
            .frames
            .iter()
            .filter(|f| matches!(f.kind, FieldKind::Data(_)))
            .count();
        assert_eq!(data_frames, 128);
        assert_eq!(results.frames.len(), 6 + 128 + 1);
        assert_eq!(results.frames.last().unwrap().kind, FieldKind::Crc);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let capture = capture_of(&frame_bytes(0x2, 0x123, 2, 0x456, 7, 2, &[9, 8]));
        let first = decode(&capture);
        let second = decode(&capture);
        assert_eq!(first.frames, second.frames);
        assert_eq!(first.markers, second.markers);
    }

    #[test]
    fn test_cancelled_before_start() {
        let capture = capture_of(&frame_bytes(0x1, 0x000, 0, 0x001, 0, 0, &[]));
        let s = settings();
        let mut session = DecoderSession::new(&s, &capture, None);
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(session.run(&token), RunEnd::Cancelled);
        assert!(session.results().frames.is_empty());
    }

    #[test]
    fn test_dual_collision_prefers_rx() {
        let spb = settings().samples_per_bit();
        // identical protocol nibble, divergent target
        let tx_bytes = frame_bytes(0x1, 0x005, 0, 0x001, 0, 0, &[]);
        let rx_bytes = frame_bytes(0x1, 0x00A, 0, 0x001, 0, 0, &[]);

        let mut tx_wave = WaveformBuilder::new(spb);
        tx_wave.idle_bits(4).bytes(&tx_bytes);
        let tx = tx_wave.finish(25).unwrap();

        let mut rx_wave = WaveformBuilder::new(spb);
        rx_wave.idle_bits(4).bytes(&rx_bytes);
        let rx = rx_wave.finish(25).unwrap();

        let results = decode_dual(&tx, &rx);
        let mut expected = header_kinds();
        expected.push(FieldKind::Crc);
        assert_eq!(kinds(&results), expected);

        // the arbitration winner's bits are kept, CRC still checks out
        assert_eq!(results.frames[1].value, 0x00A);
        assert_eq!(results.frames[6].kind, FieldKind::Crc);

        // losing line flagged from the target boundary on
        assert!(results
            .markers
            .iter()
            .any(|m| m.kind == MarkerKind::Error && m.channel == ChannelId::Tx));
        // mirrored sampling before the divergence
        assert!(results
            .markers
            .iter()
            .any(|m| m.kind == MarkerKind::AckSquare && m.channel == ChannelId::Rx));
    }

    #[test]
    fn test_dual_rx_only_message() {
        let spb = settings().samples_per_bit();
        let tx = ChannelData::new(crate::cursor::Level::High, vec![], 2_000_000).unwrap();
        let mut rx_wave = WaveformBuilder::new(spb);
        rx_wave
            .idle_bits(4)
            .bytes(&frame_bytes(0x1, 0x007, 0, 0x002, 5, 0, &[]));
        let rx = rx_wave.finish(25).unwrap();

        let results = decode_dual(&tx, &rx);
        let mut expected = header_kinds();
        expected.push(FieldKind::Crc);
        assert_eq!(kinds(&results), expected);
        assert_eq!(results.frames[1].value, 0x007);
        // all sampling happened on Rx
        assert!(results
            .markers
            .iter()
            .filter(|m| m.kind == MarkerKind::Sample)
            .all(|m| m.channel == ChannelId::Rx));
    }

    #[test]
    fn test_dual_ack_on_opposite_line() {
        let spb = settings().samples_per_bit();
        let bytes = frame_bytes(0x1, 0x002, 1, 0x003, 0, 0, &[]);

        let mut tx_wave = WaveformBuilder::new(spb);
        tx_wave.idle_bits(4).bytes(&bytes);
        let tx = tx_wave.finish(40).unwrap();

        // Rx mirrors the message, then answers
        let mut rx_wave = WaveformBuilder::new(spb);
        rx_wave.idle_bits(4).bytes(&bytes).idle_bits(5).byte(0x0F);
        let rx = rx_wave.finish(25).unwrap();

        let results = decode_dual(&tx, &rx);
        let ack = results
            .frames
            .iter()
            .find(|f| f.kind == FieldKind::Ack)
            .expect("ack frame");
        assert_eq!(ack.value, 0x0F);
        // the acknowledgement was sampled on the Rx line
        let ack_dots: Vec<_> = results
            .markers
            .iter()
            .filter(|m| {
                m.kind == MarkerKind::Sample
                    && m.channel == ChannelId::Rx
                    && m.sample >= ack.start_sample
            })
            .collect();
        assert_eq!(ack_dots.len(), 8);
    }
}

