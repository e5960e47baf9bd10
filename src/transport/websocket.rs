//! Client-side MQTT-over-WebSocket transport.
//!
//! Grounded on `src/broker/mqtt_conn.rs`, which assumes (for its own,
//! server-side use) that MQTT packets are always aligned with WebSocket
//! frames, so one `Message` is always exactly one encoded packet. This
//! client keeps that same assumption on the way out (one packet per
//! `Message::binary`) and in (one `Message` yields one packet), since both
//! ends of this tunnel speak the same MQTT-protocol crate.

use async_std::net::TcpStream;
use async_tungstenite::async_std::{connect_async, ClientStream};
use async_tungstenite::tungstenite::Message;
use async_tungstenite::WebSocketStream;
use futures_util::{SinkExt, StreamExt};
use log::debug;

use crate::config::Config;
use crate::error::ErrorKind;

use super::{RawPacket, Transport, TransportIo, MIN_WS_RECV_SIZE};

pub struct WebSocketTransport {
    stream: WebSocketStream<ClientStream<TcpStream>>,
    io: TransportIo,
}

impl WebSocketTransport {
    pub async fn connect(config: &Config) -> Result<Self, ErrorKind> {
        let url = format!("wss://{}:{}/mqtt", config.broker_host, config.broker_port);
        debug!("connecting websocket transport to {url}");

        let (stream, _response) = connect_async(&url).await.map_err(|_| ErrorKind::Connecting)?;

        Ok(Self {
            stream,
            io: TransportIo::new("ws", MIN_WS_RECV_SIZE),
        })
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, packet: RawPacket) -> Result<(), ErrorKind> {
        self.io.enqueue_send(&packet);
        let (handle, _len) = self.io.begin_send().expect("just enqueued");
        let bytes = self.io.send_bytes(handle);
        let result = self
            .stream
            .send(Message::binary(bytes))
            .await
            .map_err(|_| ErrorKind::Writing);
        self.io.end_send(handle, result.clone());
        result
    }

    async fn recv(&mut self) -> Result<Option<RawPacket>, ErrorKind> {
        let (handle, _size) = match self.io.begin_recv() {
            Some(v) => v,
            None => return Err(ErrorKind::Closed),
        };

        let outcome = match self.stream.next().await {
            Some(Ok(Message::Binary(data))) => Ok(data),
            Some(Ok(Message::Close(_))) | None => {
                self.io.end_recv(handle, Err(ErrorKind::Closed));
                return Ok(None);
            }
            Some(Ok(_other)) => Ok(Vec::new()),
            Some(Err(_)) => {
                self.io.end_recv(handle, Err(ErrorKind::Reading));
                return Err(ErrorKind::Reading);
            }
        };

        let data = outcome.expect("handled above");
        let handle = self.io.stage_bytes(handle, &data);
        self.io.end_recv(handle, Ok(data.len()));

        let mut out = Vec::new();
        self.io.drain_done(&mut out);
        Ok(Some(out))
    }

    fn receive_enable(&mut self, enabled: bool) {
        self.io.receive_enable(enabled);
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
