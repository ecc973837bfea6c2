/// DHT22 / AM2302 frame decoding from timestamped edge events
use std::time::Instant;

use crate::models::{DiagnosticCounters, EdgeEvent, Level, Reading};
use crate::utils::tick_diff;

/// Consecutive missing messages tolerated before the sensor is power cycled.
pub const MAX_NO_RESPONSE: u32 = 2;

/// HIGH pulses at least this long (µs) encode a 1 bit (datasheet: ~70µs vs ~26µs).
pub const BIT_ONE_MIN_US: u32 = 50;

/// HIGH pulses at least this long (µs) cannot be a data bit and spoil the frame.
pub const BIT_INVALID_MIN_US: u32 = 200;

/// A rising edge this long (µs) after the previous one starts a new frame.
pub const FRAME_GAP_US: u32 = 250_000;

/// Bit position meaning "frame complete, ignore further pulses".
const FRAME_BITS: i32 = 40;

/// Result of feeding one edge event to the decoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// Edge absorbed, frame still in flight (or nothing in flight).
    Pending,
    /// 40 bits received and the checksum matched.
    Reading(Reading),
    /// 40 bits received but the checksum did not match.
    BadChecksum,
    /// Watchdog fired after some data bits but before the frame completed.
    ShortMessage,
    /// Watchdog fired with essentially no data received. `escalated` is set
    /// when the no-response streak ran out and the sensor should be reset.
    MissingMessage { escalated: bool },
    /// Watchdog fired after a complete frame.
    Idle,
}

impl Outcome {
    /// Whether the owner must disable the watchdog after this outcome.
    pub fn disarms_watchdog(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

/// Accumulators for the frame currently on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FrameBuffer {
    humidity_high: u8,
    humidity_low: u8,
    temp_high: u8,
    temp_low: u8,
    checksum: u8,
    /// Set by an overlong pulse; the checksum can never match afterwards.
    poisoned: bool,
}

impl FrameBuffer {
    fn checksum_matches(&self) -> bool {
        let total = self
            .humidity_high
            .wrapping_add(self.humidity_low)
            .wrapping_add(self.temp_high)
            .wrapping_add(self.temp_low);
        !self.poisoned && total == self.checksum
    }

    /// Humidity in %RH, 0.1 resolution.
    fn humidity(&self) -> f64 {
        f64::from(u16::from_be_bytes([self.humidity_high, self.humidity_low])) / 10.0
    }

    /// Temperature in °C, 0.1 resolution, sign in bit 7 of the high byte.
    fn temperature(&self) -> f64 {
        let magnitude = u16::from_be_bytes([self.temp_high & 0x7F, self.temp_low]);
        let temperature = f64::from(magnitude) / 10.0;
        if self.temp_high & 0x80 != 0 {
            -temperature
        } else {
            temperature
        }
    }
}

/// Incremental bit-timing state machine for one sensor's data line.
///
/// Events must be fed in chronological order from a single context. Rising
/// edges timestamp the start of each HIGH pulse; falling edges measure it and
/// shift the resulting bit into the byte selected by the current bit position.
/// The two leading pulses of every frame are the sensor's response preamble.
#[derive(Debug)]
pub struct FrameDecoder {
    frame: FrameBuffer,
    bit: i32,
    last_high_us: u32,
    no_response: u32,
    counters: DiagnosticCounters,
    reading: Option<Reading>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            frame: FrameBuffer::default(),
            bit: FRAME_BITS,
            last_high_us: 0,
            no_response: 0,
            counters: DiagnosticCounters::default(),
            reading: None,
        }
    }

    pub fn feed(&mut self, event: EdgeEvent) -> Outcome {
        match event.level {
            Level::Low => self.falling_edge(event.timestamp_us),
            Level::High => {
                self.rising_edge(event.timestamp_us);
                Outcome::Pending
            }
            Level::Timeout => self.timeout(),
        }
    }

    pub fn reading(&self) -> Option<Reading> {
        self.reading
    }

    pub fn counters(&self) -> DiagnosticCounters {
        self.counters
    }

    pub fn no_response(&self) -> u32 {
        self.no_response
    }

    pub fn bit(&self) -> i32 {
        self.bit
    }

    fn rising_edge(&mut self, tick: u32) {
        let diff = tick_diff(self.last_high_us, tick);
        self.last_high_us = tick;
        if diff > FRAME_GAP_US {
            self.bit = -2;
            self.frame = FrameBuffer::default();
        }
    }

    fn falling_edge(&mut self, tick: u32) -> Outcome {
        let diff = tick_diff(self.last_high_us, tick);
        let val = u8::from(diff >= BIT_ONE_MIN_US);
        if diff >= BIT_INVALID_MIN_US {
            self.frame.poisoned = true;
        }

        let mut outcome = Outcome::Pending;
        let frame = &mut self.frame;
        match self.bit {
            b if b >= FRAME_BITS => {
                self.bit = FRAME_BITS;
                return outcome;
            }
            b if b >= 32 => {
                frame.checksum = (frame.checksum << 1) | val;
                if b == FRAME_BITS - 1 {
                    outcome = self.finish_frame();
                }
            }
            b if b >= 24 => frame.temp_low = (frame.temp_low << 1) | val,
            b if b >= 16 => frame.temp_high = (frame.temp_high << 1) | val,
            b if b >= 8 => frame.humidity_low = (frame.humidity_low << 1) | val,
            b if b >= 0 => frame.humidity_high = (frame.humidity_high << 1) | val,
            _ => {} // preamble
        }

        self.bit += 1;
        outcome
    }

    fn finish_frame(&mut self) -> Outcome {
        self.no_response = 0;
        if self.frame.checksum_matches() {
            let reading = Reading {
                humidity_pct: self.frame.humidity(),
                temperature_c: self.frame.temperature(),
                observed_at: Instant::now(),
            };
            self.reading = Some(reading);
            Outcome::Reading(reading)
        } else {
            self.counters.bad_checksum += 1;
            Outcome::BadChecksum
        }
    }

    fn timeout(&mut self) -> Outcome {
        if self.bit < 8 {
            self.counters.missing_message += 1;
            self.no_response = self.no_response.saturating_add(1);
            let escalated = self.no_response > MAX_NO_RESPONSE;
            if escalated {
                self.no_response = 0;
                self.counters.sensor_resets += 1;
            }
            Outcome::MissingMessage { escalated }
        } else if self.bit < FRAME_BITS - 1 {
            self.counters.short_message += 1;
            self.no_response = 0;
            Outcome::ShortMessage
        } else {
            self.no_response = 0;
            Outcome::Idle
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
