//! MQTT module: session plumbing and the ping/pong echo responder.

pub mod client;
pub mod echo;

// Re-exports for cleaner imports from crate::mqtt
pub use client::{LoggerPublisher, MqQos, MqttPublish, keep_alive_ping_interval_secs};
pub use echo::{PING, PONG, build_echo_topic, reply_for, respond};

#[cfg(feature = "mqtt")]
pub use client::{
    EmbassyNetTransport, MqttSessionConfig, RustMqttSession, connect_rust_mqtt_session,
    describe_reason_code,
};
