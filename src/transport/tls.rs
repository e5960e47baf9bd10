//! Raw-TLS MQTT transport, used when no WebSocket capability is available
//! or the broker URL pins the `tls`/`ssl` scheme.
//!
//! Structurally grounded on `original_source/src/xio_sk.c`/`xio_ws.c`'s
//! split between a raw socket layer and an MQTT codec sitting on top of
//! it. Since a raw TLS byte stream carries no message framing of its own
//! (unlike the WebSocket transport, where one `Message` is one packet),
//! this adapter accumulates bytes and decodes complete packets out of the
//! buffer as they become available — mirroring the dynamic-buffer growth
//! pattern in `original_source/src/util_stream.c`.

use async_native_tls::{TlsConnector, TlsStream};
use async_std::net::TcpStream;
use futures_util::{AsyncReadExt, AsyncWriteExt};
use mqtt::{Decodable, Encodable};
use std::io::Cursor;

use crate::config::Config;
use crate::error::ErrorKind;
use crate::mqtt::VariablePacket;

use super::{RawPacket, Transport, TransportIo, MIN_RAW_RECV_SIZE};

pub struct TlsTransport {
    stream: TlsStream<TcpStream>,
    io: TransportIo,
    /// Bytes drained from completed receive buffers but not yet enough to
    /// decode a full packet; a raw byte stream carries no framing of its
    /// own, unlike the WebSocket transport's one-message-per-packet frames.
    decode_buffer: Vec<u8>,
}

impl TlsTransport {
    pub async fn connect(config: &Config) -> Result<Self, ErrorKind> {
        let addr = (config.broker_host.as_str(), config.broker_port);
        let tcp = TcpStream::connect(addr).await.map_err(|_| ErrorKind::Connecting)?;
        let stream = TlsConnector::new()
            .connect(&config.broker_host, tcp)
            .await
            .map_err(|_| ErrorKind::Connecting)?;

        Ok(Self {
            stream,
            io: TransportIo::new("tls", MIN_RAW_RECV_SIZE),
            decode_buffer: Vec::new(),
        })
    }

    /// Try to decode one full packet out of the front of `decode_buffer`.
    /// Returns `None` if more bytes are needed.
    fn try_decode(&mut self) -> Option<RawPacket> {
        let mut cursor = Cursor::new(&self.decode_buffer[..]);
        match VariablePacket::decode(&mut cursor) {
            Ok(_packet) => {
                let consumed = cursor.position() as usize;
                let frame = self.decode_buffer[..consumed].to_vec();
                self.decode_buffer.drain(..consumed);
                Some(frame)
            }
            Err(_) => None,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TlsTransport {
    async fn send(&mut self, packet: RawPacket) -> Result<(), ErrorKind> {
        self.io.enqueue_send(&packet);
        let (handle, _len) = self.io.begin_send().expect("just enqueued");
        let bytes = self.io.send_bytes(handle);
        let result: Result<(), ErrorKind> = async {
            self.stream.write_all(&bytes).await.map_err(|_| ErrorKind::Writing)?;
            self.stream.flush().await.map_err(|_| ErrorKind::Writing)
        }
        .await;
        self.io.end_send(handle, result);
        result
    }

    async fn recv(&mut self) -> Result<Option<RawPacket>, ErrorKind> {
        if let Some(frame) = self.try_decode() {
            return Ok(Some(frame));
        }

        loop {
            let (handle, size) = match self.io.begin_recv() {
                Some(v) => v,
                None => return Err(ErrorKind::Closed),
            };

            let mut chunk = vec![0u8; size];
            let n = match self.stream.read(&mut chunk).await {
                Ok(0) => {
                    self.io.end_recv(handle, Err(ErrorKind::Closed));
                    return Ok(None);
                }
                Ok(n) => n,
                Err(_) => {
                    self.io.end_recv(handle, Err(ErrorKind::Reading));
                    return Err(ErrorKind::Reading);
                }
            };

            self.io.write_into(handle, &chunk[..n]);
            self.io.end_recv(handle, Ok(n));
            self.io.drain_done(&mut self.decode_buffer);

            if let Some(frame) = self.try_decode() {
                return Ok(Some(frame));
            }
        }
    }

    fn receive_enable(&mut self, enabled: bool) {
        self.io.receive_enable(enabled);
    }

    async fn close(&mut self) {
        let _ = self.stream.close().await;
    }
}
