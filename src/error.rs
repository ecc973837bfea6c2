/// Error type for the sensor and publishing plumbing.
///
/// Frame decode failures are not errors: they are counted by the decoder.
#[derive(thiserror::Error, Debug)]
pub enum Dht2MqttError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GPIO error: {0}")]
    Gpio(#[from] gpio_cdev::Error),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

pub type Result<T> = std::result::Result<T, Dht2MqttError>;
