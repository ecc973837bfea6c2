/// Power-cycle recovery for a sensor that stopped answering
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use crate::error::Result;

/// Time the supply line is held in each state during a power cycle.
pub const POWER_SETTLE: Duration = Duration::from_secs(2);

/// A digital output the sensor side drives: the power supply or the LED.
pub trait OutputLine {
    fn set_level(&mut self, high: bool) -> Result<()>;
}

/// Shared flag telling the trigger path whether the sensor is powered.
#[derive(Debug, Clone)]
pub struct PowerState(Arc<AtomicBool>);

impl PowerState {
    pub fn new(powered: bool) -> Self {
        PowerState(Arc::new(AtomicBool::new(powered)))
    }

    pub fn is_powered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, powered: bool) {
        self.0.store(powered, Ordering::Release);
    }
}

/// Drives the sensor's power line.
///
/// Every procedure blocks the calling thread for its full settle time, so it
/// must only run on the thread dedicated to this sensor.
pub struct RecoveryController<L> {
    line: L,
    state: PowerState,
    settle: Duration,
}

impl<L: OutputLine> RecoveryController<L> {
    pub fn new(line: L, state: PowerState) -> Self {
        RecoveryController {
            line,
            state,
            settle: POWER_SETTLE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn state(&self) -> &PowerState {
        &self.state
    }

    /// Switch the sensor on and wait for it to become ready.
    pub fn power_on(&mut self) -> Result<()> {
        self.state.set(false);
        let result = self.line.set_level(true);
        if result.is_ok() {
            sleep(self.settle);
        }
        self.state.set(true);
        result
    }

    /// Cut power, wait, restore power, wait.
    ///
    /// The state reads unpowered for the whole procedure and is restored even
    /// when the line cannot be driven, so triggering resumes on the next cycle.
    pub fn power_cycle(&mut self) -> Result<()> {
        warn!("Power cycling unresponsive sensor");
        self.state.set(false);
        let result = self.cycle();
        self.state.set(true);
        if result.is_ok() {
            info!("Sensor power restored");
        }
        result
    }

    fn cycle(&mut self) -> Result<()> {
        self.line.set_level(false)?;
        sleep(self.settle);
        self.line.set_level(true)?;
        sleep(self.settle);
        Ok(())
    }
}
