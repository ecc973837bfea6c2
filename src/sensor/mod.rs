pub mod decoder;
pub mod engine;
pub mod gpio;
pub mod recovery;

pub use gpio::Dht22Sensor;
