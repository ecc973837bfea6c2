mod config;
mod error;
mod models;
mod mqtt;
mod sensor;
mod utils;

use log::{error, info, warn};
use time::OffsetDateTime;
use tokio::time::{sleep, Duration, Instant};

use config::ServiceConfig;
use mqtt::{MqttPublisher, Topics};
use sensor::Dht22Sensor;
use utils::format_datetime;

/// Time allowed for a triggered frame to arrive before the result is read.
/// Covers the watchdog window with margin, and keeps triggers ~2s apart.
const READ_WINDOW: Duration = Duration::from_secs(2);

async fn main_loop(
    config: &ServiceConfig,
    sensor: &Dht22Sensor,
    publisher: &MqttPublisher,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Publishing {} line {} readings to {}/# every {} seconds",
        config.pins.chip,
        config.pins.data,
        config.topic,
        config.interval.as_secs()
    );

    loop {
        let cycle_start = Instant::now();

        if !sensor.trigger() {
            if sensor.powered() {
                error!("Sensor worker is not running");
            } else {
                warn!("Sensor is being power cycled, skipping this reading");
            }
        }
        sleep(READ_WINDOW).await;

        let status = sensor.status();
        match publisher.publish_if_fresh(&status, config.interval) {
            Ok(true) => info!(
                "Published at {}: temp={:.1}°C, humidity={:.1}%",
                format_datetime(&OffsetDateTime::now_utc()),
                status.temperature().unwrap_or_default(),
                status.humidity().unwrap_or_default()
            ),
            Ok(false) => {
                let counters = status.counters;
                warn!(
                    "No fresh reading (staleness {:.0}s); bad checksum: {}, short: {}, missing: {}, resets: {}",
                    status.staleness(),
                    counters.bad_checksum,
                    counters.short_message,
                    counters.missing_message,
                    counters.sensor_resets
                );
            }
            Err(e) => error!("Failed to publish reading: {}", e),
        }

        // Wait until next cycle should start
        let elapsed = cycle_start.elapsed();
        if elapsed < config.interval {
            sleep(config.interval - elapsed).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match ServiceConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let mut sensor = Dht22Sensor::start(&config.pins)?;
    let publisher = MqttPublisher::connect(&config.broker, Topics::new(&config.topic));

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        let _ = tx.send(());
    });

    // Run main loop or wait for shutdown signal
    tokio::select! {
        result = main_loop(&config, &sensor, &publisher) => {
            if let Err(e) = result {
                error!("Fatal error: {}", e);
            }
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    publisher.disconnect().await;
    // Joining the worker can block for a full power cycle.
    tokio::task::spawn_blocking(move || sensor.cancel()).await?;

    Ok(())
}
