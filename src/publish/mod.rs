/// Message bus trait and in-memory bus
pub mod bus;

/// MQTT implementation of the bus
pub mod mqtt;

/// Outbound event and status publishing
pub mod publisher;

/// Inbound command decoding
pub mod commands;

pub use bus::{BusMessage, MemoryBus, MessageBus, StalledBus};
pub use commands::{AudioCommand, InboundMessage, PlanBroadcast, ServerCommand};
pub use mqtt::MqttBus;
pub use publisher::{EventPublisher, DEFAULT_PUBLISH_TIMEOUT};
