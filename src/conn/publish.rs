//! Publish queue (component I): outbound messages waiting for their
//! PUBACK. Grounded on `io_mqtt_message_t` and
//! `io_mqtt_connection_publish_message`/`handle_PUBLISH_ACK` in the
//! original implementation.

use std::time::Instant;

use async_std::channel::Sender;

use crate::error::ErrorKind;
use crate::mqtt::Qos;

pub struct PublishMessage {
    pub pkt_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub published: bool,
    pub attempted: Option<Instant>,
    pub complete: Option<Sender<Result<(), ErrorKind>>>,
}

impl PublishMessage {
    /// Whether this message has been outstanding (published, unacked) for
    /// longer than `2 * keep_alive`. Mirrors the missing-pub-ack check in
    /// `io_mqtt_connection_monitor`.
    pub fn is_overdue(&self, now: Instant, keep_alive: std::time::Duration) -> bool {
        match self.attempted {
            Some(attempted) => self.published && now.duration_since(attempted) > keep_alive * 2,
            None => false,
        }
    }
}
