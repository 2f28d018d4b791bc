//! MQTT session plumbing and rust-mqtt integration.
//!
//! The echo logic only needs a tiny publish seam, so the real client
//! is kept behind the `mqtt` feature and the trait below; the default
//! build runs against a log-only publisher.

use defmt::info;

// ----------------------------------------------------------------------------
// MQTT publishing abstraction (crate-agnostic)
// ----------------------------------------------------------------------------

/// MQTT QoS mapping for a minimal, crate-agnostic publish interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MqQos {
    /// QoS 0 — At most once
    AtMostOnce,
    /// QoS 1 — At least once
    AtLeastOnce,
}

/// Minimal MQTT publish trait to decouple the echo responder from a
/// specific client crate.
#[allow(async_fn_in_trait)]
pub trait MqttPublish {
    type Err;
    /// Publish a binary payload to `topic` with the given QoS and retain flag.
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: MqQos,
        retain: bool,
    ) -> Result<(), Self::Err>;
}

/// Log-only publisher used when the `mqtt` feature is disabled.
/// Lets the echo path run end to end without a broker.
pub struct LoggerPublisher;

impl MqttPublish for LoggerPublisher {
    type Err = core::convert::Infallible;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: MqQos,
        retain: bool,
    ) -> Result<(), Self::Err> {
        let qos_str = match qos {
            MqQos::AtMostOnce => "QoS0",
            MqQos::AtLeastOnce => "QoS1",
        };
        info!(
            "mqtt(LOG): publishing to topic='{}' len={} {} retain={}",
            topic,
            payload.len(),
            qos_str,
            retain
        );
        Ok(())
    }
}

/// Seconds of idle time after which the receive loop sends its own
/// PINGREQ. Half the negotiated keep-alive stays well inside the
/// broker's 1.5x keep-alive liveness deadline; clamped so a tiny
/// keep-alive still yields a nonzero cadence.
pub fn keep_alive_ping_interval_secs(keep_alive_secs: u16) -> u64 {
    (u64::from(keep_alive_secs) / 2).max(1)
}

// ----------------------------------------------------------------------------
// rust-mqtt transport adapter (feature-gated)
// ----------------------------------------------------------------------------

#[cfg(feature = "mqtt")]
use embedded_io_async::{ErrorType, Read, Write as IoWrite};

/// Transport adapter wrapping `embassy_net::tcp::TcpSocket` for the
/// rust-mqtt client, via the embedded_io_async traits it requires.
#[cfg(feature = "mqtt")]
pub struct EmbassyNetTransport<'a> {
    socket: embassy_net::tcp::TcpSocket<'a>,
}

#[cfg(feature = "mqtt")]
impl<'a> EmbassyNetTransport<'a> {
    /// Wrap an already-connected TCP socket.
    pub fn new(socket: embassy_net::tcp::TcpSocket<'a>) -> Self {
        Self { socket }
    }
}

#[cfg(feature = "mqtt")]
impl ErrorType for EmbassyNetTransport<'_> {
    type Error = embassy_net::tcp::Error;
}

#[cfg(feature = "mqtt")]
impl Read for EmbassyNetTransport<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.socket.read(buf).await
    }
}

#[cfg(feature = "mqtt")]
impl IoWrite for EmbassyNetTransport<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.socket.write(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.socket.flush().await
    }
}

// ----------------------------------------------------------------------------
// rust-mqtt session wrapper (feature-gated)
// ----------------------------------------------------------------------------

#[cfg(feature = "mqtt")]
use rust_mqtt::client::client::MqttClient;
#[cfg(feature = "mqtt")]
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
#[cfg(feature = "mqtt")]
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
#[cfg(feature = "mqtt")]
use rust_mqtt::utils::rng_generator::CountingRng;

/// Configuration for the MQTT CONNECT handshake.
#[cfg(feature = "mqtt")]
pub struct MqttSessionConfig<'a> {
    pub client_id: &'a str,
    pub keep_alive_secs: u16,
}

/// A connected MQTT v5 session: publish, subscribe, receive.
#[cfg(feature = "mqtt")]
pub struct RustMqttSession<'a, T: Read + IoWrite> {
    client: MqttClient<'a, T, 5, CountingRng>,
}

#[cfg(feature = "mqtt")]
impl<T: Read + IoWrite> RustMqttSession<'_, T> {
    /// Subscribe to a single topic at the library's default QoS.
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), ReasonCode> {
        info!("mqtt: subscribing to topic='{}'", topic);
        self.client.subscribe_to_topic(topic).await
    }

    /// Wait for the next inbound PUBLISH on any subscribed topic.
    pub async fn receive(&mut self) -> Result<(&str, &[u8]), ReasonCode> {
        self.client.receive_message().await
    }

    /// Send a PINGREQ. rust-mqtt v0.3 does not ping on its own while
    /// the client sits in `receive_message()`, so an idle subscriber
    /// must drive the keep-alive itself or the broker will drop the
    /// connection at 1.5x the keep-alive interval.
    pub async fn send_ping(&mut self) -> Result<(), ReasonCode> {
        self.client.send_ping().await
    }
}

#[cfg(feature = "mqtt")]
impl<T: Read + IoWrite> MqttPublish for RustMqttSession<'_, T> {
    type Err = ReasonCode;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: MqQos,
        retain: bool,
    ) -> Result<(), Self::Err> {
        let mqtt_qos = match qos {
            MqQos::AtMostOnce => QualityOfService::QoS0,
            MqQos::AtLeastOnce => QualityOfService::QoS1,
        };

        info!("mqtt: publishing to topic='{}' len={}", topic, payload.len());

        match self
            .client
            .send_message(topic, payload, mqtt_qos, retain)
            .await
        {
            Ok(()) => Ok(()),
            // Published fine, nobody was listening.
            Err(ReasonCode::NoMatchingSubscribers) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Human-readable description of a CONNACK/operation reason code, for
/// log diagnostics only.
#[cfg(feature = "mqtt")]
pub fn describe_reason_code(reason: &ReasonCode) -> &'static str {
    match *reason {
        ReasonCode::Success => "success",
        ReasonCode::UnspecifiedError => "unspecified error",
        ReasonCode::MalformedPacket => "malformed packet",
        ReasonCode::ProtocolError => "protocol error",
        ReasonCode::UnsupportedProtocolVersion => "unsupported protocol version",
        ReasonCode::ClientIdNotValid => "client identifier not valid",
        ReasonCode::NotAuthorized => "not authorized",
        ReasonCode::ServerUnavailable => "server unavailable",
        ReasonCode::ServerBusy => "server busy",
        ReasonCode::TopicNameInvalid => "topic name invalid",
        ReasonCode::PacketTooLarge => "packet too large",
        ReasonCode::QuotaExceeded => "quota exceeded",
        ReasonCode::ConnectionRateExceeded => "connection rate exceeded",
        _ => "unknown reason code",
    }
}

/// Run the MQTT CONNECT handshake over an already-connected transport.
///
/// `recv_buffer` and `write_buffer` back the client's packet assembly
/// and must outlive the returned session.
#[cfg(feature = "mqtt")]
pub async fn connect_rust_mqtt_session<'a>(
    transport: EmbassyNetTransport<'a>,
    config: MqttSessionConfig<'a>,
    recv_buffer: &'a mut [u8],
    write_buffer: &'a mut [u8],
) -> Result<RustMqttSession<'a, EmbassyNetTransport<'a>>, ReasonCode> {
    use rust_mqtt::client::client_config::{ClientConfig, MqttVersion};

    let rng = CountingRng(0);

    let mut client_config = ClientConfig::new(MqttVersion::MQTTv5, rng);
    client_config.add_client_id(config.client_id);
    client_config.keep_alive = config.keep_alive_secs;

    let mut client = MqttClient::<_, 5, _>::new(
        transport,
        write_buffer,
        write_buffer.len(),
        recv_buffer,
        recv_buffer.len(),
        client_config,
    );

    match client.connect_to_broker().await {
        Ok(()) => {
            info!("mqtt: connected to broker");
            Ok(RustMqttSession { client })
        }
        Err(e) => {
            defmt::error!(
                "mqtt: CONNECT failed: {} ({:?})",
                describe_reason_code(&e),
                defmt::Debug2Format(&e)
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_cadence_stays_inside_the_broker_deadline() {
        // The broker closes an idle connection at 1.5x keep-alive;
        // the cadence must beat the keep-alive itself with margin.
        for keep_alive in [10u16, 60, 120, u16::MAX] {
            let interval = keep_alive_ping_interval_secs(keep_alive);
            assert!(interval < u64::from(keep_alive));
            assert!(interval * 2 <= u64::from(keep_alive));
        }
    }

    #[test]
    fn ping_cadence_is_never_zero() {
        assert_eq!(keep_alive_ping_interval_secs(0), 1);
        assert_eq!(keep_alive_ping_interval_secs(1), 1);
        assert_eq!(keep_alive_ping_interval_secs(60), 30);
    }
}
