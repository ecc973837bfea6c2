/// Per-sensor event handling: decoder, watchdog, LED and power recovery
use log::{debug, error, warn};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::models::{EdgeEvent, Level, SensorStatus};
use crate::sensor::decoder::{FrameDecoder, Outcome};
use crate::sensor::recovery::{OutputLine, PowerState, RecoveryController};

/// Silence on the data line after which an armed watchdog fires.
pub const WATCHDOG_WINDOW: Duration = Duration::from_millis(200);

/// Fires a timeout when no edge arrives within [`WATCHDOG_WINDOW`].
///
/// Every edge restarts the window while armed.
#[derive(Debug, Default)]
pub struct Watchdog {
    deadline: Option<Instant>,
}

impl Watchdog {
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + WATCHDOG_WINDOW);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    fn kick(&mut self, now: Instant) {
        if self.is_armed() {
            self.arm(now);
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// How long the caller may block waiting for an edge, at most `cap`.
    pub fn wait_budget(&self, now: Instant, cap: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(now).min(cap),
            None => cap,
        }
    }
}

/// Everything one sensor's worker thread owns besides the GPIO handles.
///
/// Each status change is published through a watch channel, which is the only
/// path by which other tasks observe readings and counters.
pub struct SensorEngine<L> {
    decoder: FrameDecoder,
    recovery: Option<RecoveryController<L>>,
    led: Option<L>,
    power: PowerState,
    watchdog: Watchdog,
    status: watch::Sender<SensorStatus>,
}

impl<L: OutputLine> SensorEngine<L> {
    pub fn new(
        recovery: Option<RecoveryController<L>>,
        led: Option<L>,
        status: watch::Sender<SensorStatus>,
    ) -> Self {
        let power = match &recovery {
            Some(recovery) => recovery.state().clone(),
            None => PowerState::new(true),
        };
        SensorEngine {
            decoder: FrameDecoder::new(),
            recovery,
            led,
            power,
            watchdog: Watchdog::default(),
            status,
        }
    }

    pub fn power_state(&self) -> PowerState {
        self.power.clone()
    }

    pub fn is_powered(&self) -> bool {
        self.power.is_powered()
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Switch the sensor on at startup, blocking for the settle time.
    pub fn power_on(&mut self) {
        if let Some(recovery) = self.recovery.as_mut() {
            if let Err(e) = recovery.power_on() {
                error!("Failed to switch sensor power on: {}", e);
            }
        }
    }

    /// Called just before the data line is pulled low to request a reading.
    pub fn begin_attempt(&mut self) {
        self.set_led(true);
    }

    /// Called once the host has released the data line after the start pulse.
    ///
    /// The release is the rising edge that opens the frame, so it is fed to
    /// the decoder like any other edge.
    pub fn line_released(&mut self, tick: u32, now: Instant) {
        self.decoder.feed(EdgeEvent::high(tick));
        self.watchdog.arm(now);
    }

    /// Feed a timeout to the decoder if the watchdog has expired.
    pub fn check_watchdog(&mut self, tick: u32, now: Instant) -> Option<Outcome> {
        if self.watchdog.expired(now) {
            Some(self.handle(EdgeEvent::timeout(tick), now))
        } else {
            None
        }
    }

    pub fn handle(&mut self, event: EdgeEvent, now: Instant) -> Outcome {
        if event.level != Level::Timeout {
            self.watchdog.kick(now);
        }

        let outcome = self.decoder.feed(event);
        if outcome.disarms_watchdog() {
            self.watchdog.disarm();
        }

        match outcome {
            Outcome::Pending => return outcome,
            Outcome::Reading(reading) => {
                debug!(
                    "Frame decoded: temp={:.1}°C, humidity={:.1}%",
                    reading.temperature_c, reading.humidity_pct
                );
                self.set_led(false);
            }
            Outcome::BadChecksum => debug!("Frame rejected: bad checksum"),
            Outcome::ShortMessage => {
                debug!("Frame stalled after {} of 40 bits", self.decoder.bit())
            }
            Outcome::MissingMessage { .. } => debug!(
                "Sensor did not respond ({} in a row)",
                self.decoder.no_response()
            ),
            Outcome::Idle => {}
        }

        self.publish();

        if let Outcome::MissingMessage { escalated: true } = outcome {
            let attempts = crate::sensor::decoder::MAX_NO_RESPONSE + 1;
            match self.recovery.as_mut() {
                Some(recovery) => {
                    warn!("No response after {} attempts, resetting sensor", attempts);
                    if let Err(e) = recovery.power_cycle() {
                        error!("Sensor power cycle failed: {}", e);
                    }
                }
                None => warn!(
                    "No response after {} attempts and no power line to reset the sensor",
                    attempts
                ),
            }
        }

        outcome
    }

    /// Disarm the watchdog and switch the LED off.
    pub fn shutdown(&mut self) {
        self.watchdog.disarm();
        self.set_led(false);
    }

    fn publish(&self) {
        self.status.send_replace(SensorStatus {
            reading: self.decoder.reading(),
            counters: self.decoder.counters(),
        });
    }

    fn set_led(&mut self, on: bool) {
        if let Some(led) = self.led.as_mut() {
            if let Err(e) = led.set_level(on) {
                warn!("Failed to drive LED: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::decoder::tests::{frame_events, with_checksum};
    use crate::sensor::decoder::MAX_NO_RESPONSE;
    use crate::sensor::recovery::tests::RecordingLine;

    fn engine(
        power: Option<RecordingLine>,
        led: Option<RecordingLine>,
    ) -> (SensorEngine<RecordingLine>, watch::Receiver<SensorStatus>) {
        let (tx, rx) = watch::channel(SensorStatus::default());
        let recovery = power.map(|line| {
            let state = line.state.clone().unwrap_or_else(|| PowerState::new(true));
            RecoveryController::new(line, state).with_settle(Duration::ZERO)
        });
        (SensorEngine::new(recovery, led, tx), rx)
    }

    /// Run one triggered attempt: release edge, the given sensor edges, then
    /// let the watchdog expire.
    fn attempt(
        engine: &mut SensorEngine<RecordingLine>,
        start: u32,
        edges: &[EdgeEvent],
    ) -> Option<Outcome> {
        let now = Instant::now();
        engine.begin_attempt();
        engine.line_released(start, now);
        for edge in edges {
            engine.handle(*edge, now);
        }
        engine.check_watchdog(start + 300_000, now + WATCHDOG_WINDOW)
    }

    #[test]
    fn test_watchdog_budget_and_expiry() {
        let now = Instant::now();
        let mut watchdog = Watchdog::default();
        let cap = Duration::from_millis(50);
        assert_eq!(watchdog.wait_budget(now, cap), cap);
        assert!(!watchdog.expired(now + Duration::from_secs(10)));

        watchdog.arm(now);
        assert!(!watchdog.expired(now + Duration::from_millis(199)));
        assert!(watchdog.expired(now + WATCHDOG_WINDOW));
        assert_eq!(
            watchdog.wait_budget(now + Duration::from_millis(180), cap),
            Duration::from_millis(20)
        );

        watchdog.kick(now + Duration::from_millis(150));
        assert!(!watchdog.expired(now + Duration::from_millis(300)));
    }

    #[test]
    fn test_good_frame_published_and_led_cleared() {
        let led = RecordingLine::new(None);
        let (mut engine, rx) = engine(None, Some(led.clone()));

        let events = frame_events(1_000_000, with_checksum([0x01, 0x90, 0x00, 0xC8]));
        let outcome = attempt(&mut engine, 1_000_000, &events[1..]);

        assert_eq!(outcome, None, "frame completion disarms the watchdog");
        assert!(!engine.watchdog().is_armed());
        let status = *rx.borrow();
        assert_eq!(status.humidity(), Some(40.0));
        assert_eq!(status.temperature(), Some(20.0));
        assert!(status.staleness() < 1.0);
        assert_eq!(led.levels(), vec![true, false]);
    }

    #[test]
    fn test_silent_sensor_is_power_cycled_once() {
        let state = PowerState::new(true);
        let power = RecordingLine::new(Some(state.clone()));
        let (mut engine, rx) = engine(Some(power.clone()), None);

        for i in 0..=MAX_NO_RESPONSE {
            let outcome = attempt(&mut engine, 1_000_000 + i * 3_000_000, &[]);
            assert!(matches!(outcome, Some(Outcome::MissingMessage { .. })));
        }

        assert_eq!(power.levels(), vec![false, true]);
        assert!(engine.is_powered());
        let counters = rx.borrow().counters;
        assert_eq!(counters.sensor_resets, 1);
        assert_eq!(counters.missing_message, u64::from(MAX_NO_RESPONSE) + 1);
        assert!(rx.borrow().staleness().is_infinite());
    }

    #[test]
    fn test_escalation_without_power_line() {
        let (mut engine, rx) = engine(None, None);
        let mut escalations = 0;
        for i in 0..6u32 {
            let outcome = attempt(&mut engine, 1_000_000 + i * 3_000_000, &[]);
            if outcome == Some(Outcome::MissingMessage { escalated: true }) {
                escalations += 1;
            }
        }
        assert_eq!(escalations, 2);
        let counters = rx.borrow().counters;
        assert_eq!(counters.missing_message, 6);
        assert_eq!(counters.sensor_resets, 2);
        assert!(engine.is_powered());
    }

    #[test]
    fn test_edges_keep_watchdog_alive() {
        let (mut engine, _rx) = engine(None, None);
        let now = Instant::now();
        engine.line_released(1_000_000, now);

        let later = now + Duration::from_millis(150);
        engine.handle(EdgeEvent::low(1_000_030), later);
        assert_eq!(engine.check_watchdog(1_250_000, now + WATCHDOG_WINDOW), None);
        assert!(engine
            .check_watchdog(1_400_000, later + WATCHDOG_WINDOW)
            .is_some());
    }

    #[test]
    fn test_shutdown_disarms() {
        let led = RecordingLine::new(None);
        let (mut engine, _rx) = engine(None, Some(led.clone()));
        engine.begin_attempt();
        engine.line_released(1_000_000, Instant::now());
        engine.shutdown();
        assert!(!engine.watchdog().is_armed());
        assert_eq!(led.levels(), vec![true, false]);
    }
}
