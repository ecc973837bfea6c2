pub mod publisher;

pub use publisher::{MqttPublisher, Topics};
