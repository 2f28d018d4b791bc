//! Ping/pong echo responder.
//!
//! The device subscribes to one topic and answers any payload that is
//! exactly `ping` with a single `pong` on the same topic. Anything
//! else is ignored.

use core::fmt::Write;
use heapless::String;

use super::client::{MqQos, MqttPublish};

/// Payload that triggers a reply. The match is byte-exact.
pub const PING: &[u8] = b"ping";

/// The canned reply.
pub const PONG: &[u8] = b"pong";

/// Build the echo topic for a device.
/// Format: echo/{device_id}/hello
///
/// The topic is capped at 64 bytes. Segments are written whole or not
/// at all, so a device id that cannot fit leaves just the `echo/`
/// namespace rather than a mangled id.
pub fn build_echo_topic(device_id: &str) -> String<64> {
    let mut topic = String::new();
    write!(topic, "echo/{}/hello", device_id).ok();
    topic
}

/// Reply for an inbound payload, if any.
pub fn reply_for(payload: &[u8]) -> Option<&'static [u8]> {
    if payload == PING { Some(PONG) } else { None }
}

/// Answer an inbound payload over an MQTT client.
///
/// Publishes exactly one `pong` to `topic` (QoS 1, not retained) when
/// the payload matches. Returns whether a reply was sent.
pub async fn respond<C: MqttPublish + ?Sized>(
    client: &mut C,
    topic: &str,
    payload: &[u8],
) -> Result<bool, C::Err> {
    let Some(reply) = reply_for(payload) else {
        return Ok(false);
    };

    defmt::info!("echo: ping received on topic='{}', replying", topic);
    client
        .publish(topic, reply, MqQos::AtLeastOnce, false)
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use futures::executor::block_on;

    /// Records publishes so tests can assert on exactly what went out.
    struct RecordingPublisher {
        published: std::vec::Vec<(std::string::String, std::vec::Vec<u8>, MqQos, bool)>,
    }

    impl RecordingPublisher {
        fn new() -> Self {
            Self {
                published: std::vec::Vec::new(),
            }
        }
    }

    impl MqttPublish for RecordingPublisher {
        type Err = core::convert::Infallible;

        async fn publish(
            &mut self,
            topic: &str,
            payload: &[u8],
            qos: MqQos,
            retain: bool,
        ) -> Result<(), Self::Err> {
            self.published
                .push((topic.into(), payload.into(), qos, retain));
            Ok(())
        }
    }

    #[test]
    fn exact_ping_yields_pong() {
        assert_eq!(reply_for(b"ping"), Some(PONG));
    }

    #[test]
    fn near_misses_yield_nothing() {
        assert_eq!(reply_for(b"PING"), None);
        assert_eq!(reply_for(b"ping "), None);
        assert_eq!(reply_for(b"pin"), None);
        assert_eq!(reply_for(b""), None);
        assert_eq!(reply_for(b"pong"), None);
    }

    #[test]
    fn respond_publishes_exactly_one_pong_to_the_same_topic() {
        let mut publisher = RecordingPublisher::new();
        let topic = build_echo_topic("echo-node-01");

        let replied = block_on(respond(&mut publisher, topic.as_str(), b"ping")).unwrap();

        assert!(replied);
        assert_eq!(publisher.published.len(), 1);
        let (out_topic, payload, qos, retain) = &publisher.published[0];
        assert_eq!(out_topic.as_str(), "echo/echo-node-01/hello");
        assert_eq!(payload.as_slice(), PONG);
        assert_eq!(*qos, MqQos::AtLeastOnce);
        assert!(!retain);
    }

    #[test]
    fn respond_ignores_non_matching_payloads() {
        let mut publisher = RecordingPublisher::new();
        let topic = build_echo_topic("echo-node-01");

        let replied = block_on(respond(&mut publisher, topic.as_str(), b"hello")).unwrap();

        assert!(!replied);
        assert!(publisher.published.is_empty());
    }

    #[test]
    fn echo_topic_is_namespaced_by_device() {
        let topic = build_echo_topic("echo-node-01");
        assert_eq!(topic.as_str(), "echo/echo-node-01/hello");
    }

    #[test]
    fn echo_topic_fills_the_capacity_exactly_at_the_boundary() {
        // 5 ("echo/") + 53 + 6 ("/hello") is exactly the 64-byte cap.
        let id = "x".repeat(53);
        let topic = build_echo_topic(&id);
        assert_eq!(topic.len(), 64);
        assert!(topic.as_str().starts_with("echo/"));
        assert!(topic.as_str().ends_with("/hello"));
    }

    #[test]
    fn over_capacity_device_id_drops_whole_segments() {
        let id = "x".repeat(80);
        let topic = build_echo_topic(&id);
        // heapless writes are all-or-nothing per segment, so an id
        // that cannot fit never shows up half-written.
        assert_eq!(topic.as_str(), "echo/");
    }
}
