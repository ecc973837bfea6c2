/// Linux GPIO character-device binding for a DHT22 sensor
use gpio_cdev::{
    Chip, EventRequestFlags, EventType, Line, LineEvent, LineEventHandle, LineHandle,
    LineRequestFlags,
};
use log::{debug, error, info};
use std::io;
use std::os::unix::io::AsRawFd;
use std::thread::{self, sleep, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;

use crate::config::SensorPins;
use crate::error::Result;
use crate::models::{EdgeEvent, SensorStatus};
use crate::sensor::engine::SensorEngine;
use crate::sensor::recovery::{OutputLine, PowerState, RecoveryController};
use crate::utils::monotonic_us;

/// Consumer label shown for our lines in `gpioinfo`.
const CONSUMER: &str = "dht2mqtt";

/// How long the host holds the data line low to wake the sensor.
const START_PULSE: Duration = Duration::from_millis(17);

/// Longest the worker blocks on the line before checking for commands.
const IDLE_POLL: Duration = Duration::from_millis(50);

impl OutputLine for LineHandle {
    fn set_level(&mut self, high: bool) -> Result<()> {
        self.set_value(u8::from(high))?;
        Ok(())
    }
}

/// Map a kernel line event to an edge; the kernel stamps it with CLOCK_MONOTONIC.
fn edge_event(event: &LineEvent) -> EdgeEvent {
    let rising = matches!(event.event_type(), EventType::RisingEdge);
    EdgeEvent::from_kernel(rising, event.timestamp())
}

/// Request both-edge events, which also turns the line into an input.
fn listen(line: &Line) -> Result<LineEventHandle> {
    Ok(line.events(
        LineRequestFlags::INPUT,
        EventRequestFlags::BOTH_EDGES,
        CONSUMER,
    )?)
}

fn output_line(chip: &mut Chip, offset: u32) -> Result<LineHandle> {
    Ok(chip
        .get_line(offset)?
        .request(LineRequestFlags::OUTPUT, 0, CONSUMER)?)
}

enum Command {
    Trigger,
    Shutdown,
}

/// Handle to one DHT22 sensor served by a dedicated worker thread.
///
/// The worker owns the line requests and the decoder for as long as this
/// handle lives; dropping it (or calling [`Dht22Sensor::cancel`]) disarms the
/// watchdog and releases every line request.
pub struct Dht22Sensor {
    data_line: u32,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SensorStatus>,
    power: PowerState,
    worker: Option<JoinHandle<()>>,
}

impl Dht22Sensor {
    pub fn start(pins: &SensorPins) -> Result<Self> {
        let mut chip = Chip::new(&pins.chip)?;
        let data = chip.get_line(pins.data)?;
        let events = listen(&data)?;

        let recovery = match pins.power {
            Some(offset) => Some(RecoveryController::new(
                output_line(&mut chip, offset)?,
                PowerState::new(false),
            )),
            None => None,
        };
        let led = match pins.led {
            Some(offset) => Some(output_line(&mut chip, offset)?),
            None => None,
        };

        let (status_tx, status_rx) = watch::channel(SensorStatus::default());
        let engine = SensorEngine::new(recovery, led, status_tx);
        let power = engine.power_state();
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            data,
            events: Some(events),
            commands: rx,
            engine,
        };
        let handle = thread::Builder::new()
            .name(format!("dht22-line{}", pins.data))
            .spawn(move || worker.run())?;

        info!("DHT22 on {} line {} started", pins.chip, pins.data);

        Ok(Dht22Sensor {
            data_line: pins.data,
            commands: tx,
            status: status_rx,
            power,
            worker: Some(handle),
        })
    }

    /// Request one reading. Does nothing while the sensor is unpowered.
    ///
    /// Triggers must be at least ~2 seconds apart or the sensor hangs, and
    /// the result is only available after the watchdog window has passed.
    pub fn trigger(&self) -> bool {
        if !self.power.is_powered() {
            debug!("Line {}: sensor unpowered, skipping trigger", self.data_line);
            return false;
        }
        self.commands.send(Command::Trigger).is_ok()
    }

    pub fn status(&self) -> SensorStatus {
        *self.status.borrow()
    }

    pub fn powered(&self) -> bool {
        self.power.is_powered()
    }

    /// Stop the worker and release the lines. Blocks until the worker exits,
    /// which can take a full power cycle.
    pub fn cancel(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(Command::Shutdown);
            if worker.join().is_err() {
                error!("Line {}: sensor worker panicked", self.data_line);
            }
            info!("DHT22 on line {} stopped", self.data_line);
        }
    }
}

impl Drop for Dht22Sensor {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Worker {
    data: Line,
    /// Present whenever the host is not driving the data line itself.
    events: Option<LineEventHandle>,
    commands: mpsc::UnboundedReceiver<Command>,
    engine: SensorEngine<LineHandle>,
}

impl Worker {
    fn run(mut self) {
        self.engine.power_on();

        loop {
            match self.commands.try_recv() {
                Ok(Command::Trigger) => {
                    if let Err(e) = self.trigger() {
                        error!("Line {}: trigger failed: {}", self.data.offset(), e);
                    }
                }
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let budget = self.engine.watchdog().wait_budget(Instant::now(), IDLE_POLL);
            match self.next_edge(budget) {
                Ok(Some(event)) => {
                    self.engine.handle(event, Instant::now());
                }
                Ok(None) => {
                    self.engine.check_watchdog(monotonic_us(), Instant::now());
                }
                Err(e) => {
                    error!("Line {}: edge read failed: {}", self.data.offset(), e);
                    sleep(IDLE_POLL);
                }
            }
        }

        self.release();
    }

    /// Wait up to `timeout` for the next queued kernel edge event.
    fn next_edge(&mut self, timeout: Duration) -> Result<Option<EdgeEvent>> {
        let Some(events) = self.events.as_mut() else {
            sleep(timeout);
            return Ok(None);
        };

        let mut fd = libc::pollfd {
            fd: events.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `fd` is a single valid pollfd that outlives the call.
        let ready = unsafe { libc::poll(&mut fd, 1, timeout.as_millis() as libc::c_int) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(err.into());
        }
        if ready == 0 || fd.revents & libc::POLLIN == 0 {
            return Ok(None);
        }

        let event = events.get_event()?;
        Ok(Some(edge_event(&event)))
    }

    fn trigger(&mut self) -> Result<()> {
        if !self.engine.is_powered() {
            return Ok(());
        }
        self.engine.begin_attempt();

        // No edge delivery while the host drives the line.
        self.events = None;
        let start = self
            .data
            .request(LineRequestFlags::OUTPUT, 0, CONSUMER)?;
        sleep(START_PULSE);
        drop(start);

        // The line is released when the event request switches it to input.
        // The sensor answers 20-40µs later, so the tick is taken first.
        let released = monotonic_us();
        self.events = Some(listen(&self.data)?);
        self.engine.line_released(released, Instant::now());
        Ok(())
    }

    fn release(&mut self) {
        self.engine.shutdown();
        self.events = None;
        debug!("Line {}: event request released", self.data.offset());
    }
}
