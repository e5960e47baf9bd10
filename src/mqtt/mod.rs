//! Thin MQTT 3.1.1 codec wrapper (component F) around the `mqtt-protocol`
//! crate, the same dependency the teacher uses in
//! `src/broker/mqtt_conn.rs` for `VariablePacket`/`Decodable`/`Encodable`.
//! This module only encodes/decodes packets; connection lifecycle lives in
//! `conn`.

use std::io::Cursor;

use mqtt::control::variable_header::{ConnectReturnCode, ProtocolLevel};
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::suback::SubscribeReturnCode;
pub use mqtt::packet::VariablePacket;
use mqtt::packet::*;
use mqtt::{Decodable, Encodable, QualityOfService, TopicFilter, TopicName};

use crate::error::ErrorKind;

/// Quality of service level a publish or subscription is made at. Only
/// "at most once" and "at least once" are supported; the proxy never
/// needs exactly-once delivery (spec Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl From<Qos> for QoSWithPacketIdentifier {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoSWithPacketIdentifier::Level0,
            Qos::AtLeastOnce => QoSWithPacketIdentifier::Level1,
        }
    }
}

/// Encode a packet to its wire bytes.
pub fn encode<E: Encodable>(packet: &E) -> Result<Vec<u8>, ErrorKind> {
    let mut buf = Cursor::new(Vec::new());
    packet.encode(&mut buf).map_err(|_| ErrorKind::Writing)?;
    Ok(buf.into_inner())
}

/// Decode one packet from its wire bytes.
pub fn decode(bytes: &[u8]) -> Result<VariablePacket, ErrorKind> {
    VariablePacket::decode(&mut Cursor::new(bytes)).map_err(|_| ErrorKind::InvalidFormat)
}

pub fn connect_packet(
    client_id: &str,
    keep_alive_secs: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> ConnectPacket {
    let mut packet = ConnectPacket::new("MQTT", client_id);
    packet.set_protocol_level(ProtocolLevel::Version311);
    packet.set_clean_session(true);
    packet.set_keep_alive(keep_alive_secs);
    if let Some(user) = username {
        packet.set_user_name(Some(user.to_string()));
    }
    if let Some(pass) = password {
        packet.set_password(Some(pass.to_string()));
    }
    packet
}

pub fn publish_packet(
    pkt_id: u16,
    topic: &str,
    qos: Qos,
    payload: Vec<u8>,
) -> Result<PublishPacket, ErrorKind> {
    let topic_name = TopicName::new(topic.to_string()).map_err(|_| ErrorKind::Arg)?;
    let qos_id = match qos {
        Qos::AtMostOnce => QoSWithPacketIdentifier::Level0,
        Qos::AtLeastOnce => QoSWithPacketIdentifier::Level1,
    };
    let mut packet = PublishPacket::new(topic_name, qos_id, payload);
    if matches!(qos, Qos::AtLeastOnce) {
        packet.set_packet_identifier(pkt_id);
    }
    Ok(packet)
}

pub fn subscribe_packet(pkt_id: u16, topics: &[String]) -> Result<SubscribePacket, ErrorKind> {
    let subscribes = topics
        .iter()
        .map(|t| {
            TopicFilter::new(t.clone())
                .map(|f| (f, QualityOfService::Level0))
                .map_err(|_| ErrorKind::Arg)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SubscribePacket::new(pkt_id, subscribes))
}

pub fn unsubscribe_packet(pkt_id: u16, topics: &[String]) -> Result<UnsubscribePacket, ErrorKind> {
    let filters = topics
        .iter()
        .map(|t| TopicFilter::new(t.clone()).map_err(|_| ErrorKind::Arg))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(UnsubscribePacket::new(pkt_id, filters))
}

pub fn pingreq_packet() -> PingreqPacket {
    PingreqPacket::new()
}

pub fn disconnect_packet() -> DisconnectPacket {
    DisconnectPacket::new()
}

/// Whether a CONNACK's return code indicates the broker accepted the
/// connection, mirroring `io_mqtt_connection_handle_CONNECT_ACK`'s switch.
pub fn connack_accepted(code: ConnectReturnCode) -> bool {
    matches!(code, ConnectReturnCode::ConnectionAccepted)
}

/// Whether any slot of a SUBACK reports a delivery failure.
pub fn suback_has_failure(codes: &[SubscribeReturnCode]) -> bool {
    codes.iter().any(|c| *c == SubscribeReturnCode::Failure)
}

/// Compare a received topic against a subscription's topic filter,
/// returning the remainder of `topic` past the match point (where any
/// trailing `?key=value` properties appended by the publisher would
/// start).
///
/// Grounded on `io_mqtt_topic_matches`'s walk (`#`/`+` only trigger right
/// after a `/` boundary), but tracked with a cursor per string rather than
/// one shared index: the original advances a single index through both
/// `topic` and `match` at once, which only produces the right answer for a
/// `+`-matched segment when it happens to be exactly as long as the `+/`
/// it replaces in the filter — anything else desyncs the two strings.
/// Once the filter is exhausted, a topic that continues with `?` (the
/// start of appended properties) still counts as a match; anything else
/// left in topic does not.
pub fn topic_matches<'a>(topic: &'a str, filter: &str) -> Option<&'a str> {
    let topic_b = topic.as_bytes();
    let filter_b = filter.as_bytes();
    let mut ti = 0usize;
    let mut fi = 0usize;

    loop {
        let t = topic_b.get(ti).copied();
        let f = filter_b.get(fi).copied();

        if f.is_none() {
            return if t.is_none() || t == Some(b'?') {
                Some(&topic[ti..])
            } else {
                None
            };
        }
        if t.is_none() || t != f {
            return None;
        }

        if t == Some(b'/') {
            match filter_b.get(fi + 1).copied() {
                Some(b'#') => return Some(&topic[ti + 1..]),
                Some(b'+') => {
                    let mut tj = ti + 1;
                    while let Some(c) = topic_b.get(tj).copied() {
                        if c == b'/' {
                            break;
                        }
                        tj += 1;
                    }
                    if topic_b.get(tj).is_none() {
                        // Topic ended inside the wildcard segment: the
                        // single level matched and there is nothing left
                        // to check the rest of the filter against.
                        return Some(&topic[tj..]);
                    }
                    ti = tj;
                    fi = match filter_b.get(fi + 2) {
                        Some(_) => fi + 2,
                        None => filter_b.len(),
                    };
                    continue;
                }
                _ => {}
            }
        }
        ti += 1;
        fi += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert_eq!(topic_matches("a/b/c", "a/b/c"), Some(""));
    }

    #[test]
    fn multi_level_wildcard() {
        assert_eq!(topic_matches("a/b/c", "a/#"), Some("b/c"));
    }

    #[test]
    fn single_level_wildcard() {
        assert_eq!(topic_matches("a/b/c", "a/+/c"), Some(""));
    }

    #[test]
    fn single_level_wildcard_matches_multi_character_segment() {
        assert_eq!(
            topic_matches("home/kitchen/temp?unit=C", "home/+/temp"),
            Some("?unit=C")
        );
    }

    #[test]
    fn multi_level_wildcard_drops_leading_slash() {
        assert_eq!(
            topic_matches("home/kitchen/a/b", "home/#"),
            Some("kitchen/a/b")
        );
    }

    #[test]
    fn single_level_wildcard_rejects_mismatched_trailing_segment() {
        assert_eq!(topic_matches("home/kitchen/temp", "home/+/light"), None);
    }

    #[test]
    fn mismatch_returns_none() {
        assert_eq!(topic_matches("a/b/c", "x/y/z"), None);
    }

    #[test]
    fn extra_topic_level_past_an_exact_filter_does_not_match() {
        assert_eq!(topic_matches("a/b/c", "a/b"), None);
    }

    #[test]
    fn properties_trailing_an_exact_filter_match() {
        assert_eq!(topic_matches("a/b?x=1", "a/b"), Some("?x=1"));
    }

    #[test]
    fn properties_after_multi_level_wildcard_are_returned() {
        assert_eq!(topic_matches("a/b?x=1", "a/#"), Some("b?x=1"));
    }
}
