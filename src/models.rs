use std::time::Instant;

use crate::utils::nanos_to_ticks;

/// Logic level reported for a GPIO edge, or the watchdog firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
    Timeout,
}

/// One edge transition on the data line, timestamped in wrapping microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub level: Level,
    pub timestamp_us: u32,
}

impl EdgeEvent {
    pub fn low(timestamp_us: u32) -> Self {
        EdgeEvent {
            level: Level::Low,
            timestamp_us,
        }
    }

    pub fn high(timestamp_us: u32) -> Self {
        EdgeEvent {
            level: Level::High,
            timestamp_us,
        }
    }

    pub fn timeout(timestamp_us: u32) -> Self {
        EdgeEvent {
            level: Level::Timeout,
            timestamp_us,
        }
    }

    /// Build an event from a kernel line event stamped in CLOCK_MONOTONIC nanoseconds.
    pub fn from_kernel(rising: bool, timestamp_ns: u64) -> Self {
        let tick = nanos_to_ticks(timestamp_ns);
        if rising {
            Self::high(tick)
        } else {
            Self::low(tick)
        }
    }
}

/// Last checksum-valid measurement decoded from the sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub humidity_pct: f64,
    pub temperature_c: f64,
    pub observed_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticCounters {
    pub bad_checksum: u64,
    pub short_message: u64,
    pub missing_message: u64,
    pub sensor_resets: u64,
}

/// Snapshot of everything readers may see about a sensor.
///
/// Published by the sensor worker on every change; readers only ever hold
/// copies, never the decoder's frame buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorStatus {
    pub reading: Option<Reading>,
    pub counters: DiagnosticCounters,
}

impl SensorStatus {
    pub fn temperature(&self) -> Option<f64> {
        self.reading.map(|r| r.temperature_c)
    }

    pub fn humidity(&self) -> Option<f64> {
        self.reading.map(|r| r.humidity_pct)
    }

    /// Seconds since the last good frame, `f64::INFINITY` if there never was one.
    pub fn staleness(&self) -> f64 {
        self.staleness_at(Instant::now())
    }

    pub fn staleness_at(&self, now: Instant) -> f64 {
        match self.reading {
            Some(reading) => now
                .saturating_duration_since(reading.observed_at)
                .as_secs_f64(),
            None => f64::INFINITY,
        }
    }
}
