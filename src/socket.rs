//! Application-facing socket API (§6.1): a Berkeley-socket-like surface
//! exposing process-local descriptors to callers, backed by the
//! connection/buffer core rather than a local kernel socket layer — no
//! TCP/UDP I/O happens in this crate, the remote proxy performs it.
//!
//! Grounded structurally on the original's descriptor-to-record handle map
//! (`prx_types.h`'s `prx_socket_t`), re-architected per spec.md's "Ownership
//! re-architecture" guidance: an arena of records keyed by a plain `i32`
//! descriptor rather than a reference-counted global singleton.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::{BufferHandle, BufferPool, IoQueue};
use crate::conn::subscription::SubscriptionToken;
use crate::conn::Connection;
use crate::error::ErrorKind;
use crate::mqtt::Qos;
use crate::proxy::{
    AddressFamily, Inet4Address, InetAddress, InetSocketAddress, ProtocolType, SocketAddress,
    SocketOption, SocketType,
};

/// Invalid socket descriptor, matching the original's `-1`.
pub const INVALID_SOCKET: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Connecting,
    Connected,
    Disconnected,
}

/// Readiness bits returned by [`SocketTable::poll`], mirroring the
/// combination of `can_recv`/`can_send`/`has_error` the original exposes as
/// separate calls plus an aggregate poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollEvents {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

struct SocketRecord {
    family: AddressFamily,
    socktype: SocketType,
    protocol: ProtocolType,
    local: Option<SocketAddress>,
    peer: Option<SocketAddress>,
    state: SocketState,
    options: HashMap<SocketOption, u64>,
    error: Option<ErrorKind>,
    inbound: IoQueue,
    outbound: IoQueue,
    subscription: Option<SubscriptionToken>,
}

impl SocketRecord {
    fn new(family: AddressFamily, socktype: SocketType, protocol: ProtocolType) -> Self {
        Self {
            family,
            socktype,
            protocol,
            local: None,
            peer: None,
            state: SocketState::Closed,
            options: HashMap::new(),
            error: None,
            inbound: IoQueue::new("socket-inbound"),
            outbound: IoQueue::new("socket-outbound"),
            subscription: None,
        }
    }
}

/// Owns every open socket descriptor for one connection. Analogous to the
/// original's handle map, but indexable directly by descriptor with no
/// unsafe pointer recovery.
pub struct SocketTable {
    connection: Connection,
    pool: BufferPool,
    sockets: Mutex<HashMap<i32, SocketRecord>>,
    next_fd: AtomicI32,
}

impl SocketTable {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            pool: BufferPool::new("socket-buffers"),
            sockets: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(0),
        }
    }

    fn topic_for(fd: i32, suffix: &str) -> String {
        format!("proxy/socket/{fd}/{suffix}")
    }

    /// Create a new socket descriptor. Mirrors `prx_socket_create`: purely
    /// local bookkeeping, no network activity until `connect`/`bind`.
    pub fn socket(&self, family: AddressFamily, socktype: SocketType, protocol: ProtocolType) -> i32 {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.sockets
            .lock()
            .unwrap()
            .insert(fd, SocketRecord::new(family, socktype, protocol));
        fd
    }

    fn with_record<T>(&self, fd: i32, f: impl FnOnce(&SocketRecord) -> T) -> Result<T, ErrorKind> {
        let sockets = self.sockets.lock().unwrap();
        sockets.get(&fd).map(f).ok_or(ErrorKind::Arg)
    }

    fn with_record_mut<T>(&self, fd: i32, f: impl FnOnce(&mut SocketRecord) -> T) -> Result<T, ErrorKind> {
        let mut sockets = self.sockets.lock().unwrap();
        sockets.get_mut(&fd).map(f).ok_or(ErrorKind::Arg)
    }

    pub fn bind(&self, fd: i32, local: SocketAddress) -> Result<(), ErrorKind> {
        self.with_record_mut(fd, |s| {
            s.local = Some(local);
        })
    }

    /// Request the remote proxy start listening. The accept queue is the
    /// socket's own inbound [`IoQueue`]: each accepted connection arrives as
    /// a zero-length buffer tagged with the new peer address via
    /// `buffer.code`.
    pub async fn listen(&self, fd: i32, _backlog: i32) -> Result<(), ErrorKind> {
        self.with_record_mut(fd, |s| s.state = SocketState::Connecting)?;
        let topic = Self::topic_for(fd, "listen");
        self.connection
            .publish(&topic, None, Qos::AtLeastOnce, Vec::new())
            .await
    }

    /// Pop one queued inbound connection, mirroring `prx_socket_accept`.
    /// Returns `Arg` if nothing has completed yet; callers poll/`can_recv`
    /// first.
    pub fn accept(&self, fd: i32, family: AddressFamily, socktype: SocketType, protocol: ProtocolType) -> Result<i32, ErrorKind> {
        let handle = self
            .with_record_mut(fd, |s| s.inbound.pop_done())?
            .ok_or(ErrorKind::Arg)?;
        let new_fd = self.socket(family, socktype, protocol);
        self.with_record_mut(new_fd, |s| s.state = SocketState::Connected)?;
        self.pool.release(handle);
        Ok(new_fd)
    }

    pub async fn connect(self: &Arc<Self>, fd: i32, peer: SocketAddress, key: usize) -> Result<(), ErrorKind> {
        self.with_record_mut(fd, |s| {
            s.peer = Some(peer);
            s.state = SocketState::Connecting;
        })?;

        let inbound_topic = Self::topic_for(fd, "inbound");
        let table = self.clone();
        let token = self
            .connection
            .subscribe(&inbound_topic, move |_props, payload| {
                table.deliver(fd, payload);
            })
            .await;
        self.with_record_mut(fd, |s| s.subscription = Some(token))?;

        let topic = Self::topic_for(fd, "connect");
        self.connection
            .publish(&topic, None, Qos::AtLeastOnce, key.to_le_bytes().to_vec())
            .await?;
        self.with_record_mut(fd, |s| s.state = SocketState::Connected)?;
        Ok(())
    }

    pub async fn send(&self, fd: i32, data: &[u8], _key: usize) -> Result<usize, ErrorKind> {
        let state = self.with_record(fd, |s| s.state)?;
        if state != SocketState::Connected {
            return Err(ErrorKind::BadState);
        }
        let topic = Self::topic_for(fd, "send");
        self.connection
            .publish(&topic, None, Qos::AtLeastOnce, data.to_vec())
            .await?;
        Ok(data.len())
    }

    pub async fn sendto(&self, fd: i32, data: &[u8], dest: &SocketAddress, key: usize) -> Result<usize, ErrorKind> {
        let topic = format!("{}?dest={:?}", Self::topic_for(fd, "sendto"), dest.family());
        let _ = key;
        self.connection
            .publish(&topic, None, Qos::AtMostOnce, data.to_vec())
            .await?;
        Ok(data.len())
    }

    /// Copy the oldest completed inbound buffer into `out`. Returns `0` for
    /// graceful end-of-stream (spec.md §7: "the receive callback is invoked
    /// with zero length to signal graceful end-of-stream").
    pub fn recv(&self, fd: i32, out: &mut [u8]) -> Result<usize, ErrorKind> {
        let handle = self
            .with_record_mut(fd, |s| s.inbound.pop_done())?
            .ok_or(ErrorKind::Arg)?;
        let stream = self.pool.as_stream(handle);
        let n = stream.read(out);
        if stream.readable() == 0 {
            self.pool.release(handle);
        } else {
            self.with_record(fd, |s| s.inbound.push_done_front(handle))?;
        }
        Ok(n)
    }

    pub fn recvfrom(&self, fd: i32, out: &mut [u8]) -> Result<(usize, SocketAddress), ErrorKind> {
        let peer = self.with_record(fd, |s| s.peer.clone())?.ok_or(ErrorKind::BadState)?;
        let n = self.recv(fd, out)?;
        Ok((n, peer))
    }

    pub fn getsockopt(&self, fd: i32, option: SocketOption) -> Result<u64, ErrorKind> {
        self.with_record(fd, |s| s.options.get(&option).copied())?
            .ok_or(ErrorKind::NotFound)
    }

    pub fn setsockopt(&self, fd: i32, option: SocketOption, value: u64) -> Result<(), ErrorKind> {
        self.with_record_mut(fd, |s| {
            s.options.insert(option, value);
        })
    }

    pub fn getpeername(&self, fd: i32) -> Result<SocketAddress, ErrorKind> {
        self.with_record(fd, |s| s.peer.clone())?.ok_or(ErrorKind::NotFound)
    }

    pub fn getsockname(&self, fd: i32) -> Result<SocketAddress, ErrorKind> {
        self.with_record(fd, |s| s.local.clone())?.ok_or(ErrorKind::NotFound)
    }

    /// Release a descriptor. Mirrors `prx_socket_close`: any buffers still
    /// queued are aborted (`ErrorKind::Aborted`, via `IoQueue::clear`) before
    /// the record is dropped.
    pub async fn close(&self, fd: i32) {
        let removed = self.sockets.lock().unwrap().remove(&fd);
        if let Some(mut record) = removed {
            record.inbound.clear(ErrorKind::Aborted as i32);
            record.outbound.clear(ErrorKind::Aborted as i32);
            if let Some(token) = record.subscription.take() {
                self.connection.unsubscribe(token).await;
            }
        }
    }

    pub fn poll(&self, fd: i32) -> Result<PollEvents, ErrorKind> {
        self.with_record(fd, |s| PollEvents {
            readable: s.inbound.has_done(),
            writable: s.state == SocketState::Connected,
            error: s.error.is_some(),
        })
    }

    pub fn can_recv(&self, fd: i32) -> bool {
        self.with_record(fd, |s| s.inbound.has_done()).unwrap_or(false)
    }

    pub fn can_send(&self, fd: i32) -> bool {
        self.with_record(fd, |s| s.state == SocketState::Connected).unwrap_or(false)
    }

    pub fn has_error(&self, fd: i32) -> bool {
        self.with_record(fd, |s| s.error.is_some()).unwrap_or(true)
    }

    pub fn is_disconnected(&self, fd: i32) -> bool {
        self.with_record(fd, |s| s.state == SocketState::Disconnected)
            .unwrap_or(true)
    }

    /// Deliver an inbound message from the connection manager into a
    /// socket's receive queue. Called from the subscription callback
    /// registered when the socket connects.
    fn deliver(&self, fd: i32, payload: &[u8]) -> Option<BufferHandle> {
        let handle = self.pool.create(payload.len(), Some(payload));
        self.with_record(fd, |s| s.inbound.push_done(handle)).ok()?;
        Some(handle)
    }
}

/// Parse a textual address into the wire representation, mirroring
/// `prx_socket_address_from_string` for the families this crate handles
/// locally (resolution of `proxy` addresses happens on the remote side).
pub fn pton(family: AddressFamily, text: &str) -> Result<SocketAddress, ErrorKind> {
    match family {
        AddressFamily::Inet => {
            let ip: std::net::Ipv4Addr = text.parse().map_err(|_| ErrorKind::InvalidFormat)?;
            Ok(SocketAddress::Inet(InetSocketAddress {
                port: 0,
                flow: 0,
                address: InetAddress::V4(Inet4Address { addr: ip.octets() }),
            }))
        }
        AddressFamily::Unix => Ok(SocketAddress::Unix(crate::proxy::UnixAddress {
            path: text.to_string(),
        })),
        _ => Err(ErrorKind::NotSupported),
    }
}

/// Render a wire address as text, the inverse of [`pton`].
pub fn ntop(address: &SocketAddress) -> Result<String, ErrorKind> {
    match address {
        SocketAddress::Inet(InetSocketAddress {
            address: InetAddress::V4(v4),
            ..
        }) => Ok(std::net::Ipv4Addr::from(v4.addr).to_string()),
        SocketAddress::Inet(InetSocketAddress {
            address: InetAddress::V6(v6),
            ..
        }) => Ok(std::net::Ipv6Addr::from(v6.addr).to_string()),
        SocketAddress::Unix(u) => Ok(u.path.clone()),
        SocketAddress::Proxy(p) => Ok(p.host.clone()),
    }
}

/// Resolve a host/service pair to candidate addresses. Performed locally via
/// the standard resolver rather than proxied, since DNS resolution for the
/// agent's own broker connection (as opposed to tunneled application
/// traffic) never crosses the tunnel.
pub fn getaddrinfo(host: &str, port: u16) -> Result<Vec<SocketAddress>, ErrorKind> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| ErrorKind::NotFound)?;
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            std::net::SocketAddr::V4(v4) => out.push(SocketAddress::Inet(InetSocketAddress {
                port: v4.port(),
                flow: 0,
                address: InetAddress::V4(Inet4Address { addr: v4.ip().octets() }),
            })),
            std::net::SocketAddr::V6(v6) => out.push(SocketAddress::Inet(InetSocketAddress {
                port: v6.port(),
                flow: v6.flowinfo(),
                address: InetAddress::V6(crate::proxy::Inet6Address {
                    addr: v6.ip().octets(),
                    scope_id: v6.scope_id(),
                }),
            })),
        }
    }
    if out.is_empty() {
        Err(ErrorKind::NotFound)
    } else {
        Ok(out)
    }
}

/// No-op, kept for API parity with the original's `prx_client_freeaddrinfo`:
/// resolved addresses here are owned `Vec`s dropped normally.
pub fn freeaddrinfo(_addresses: Vec<SocketAddress>) {}

/// Reverse-resolve a socket address to host/service strings.
pub fn getnameinfo(address: &SocketAddress) -> Result<(String, String), ErrorKind> {
    match address {
        SocketAddress::Inet(inet) => Ok((ntop(address)?, inet.port.to_string())),
        SocketAddress::Proxy(p) => Ok((p.host.clone(), p.port.to_string())),
        SocketAddress::Unix(u) => Ok((u.path.clone(), String::new())),
    }
}

/// Local network interface enumeration needs platform APIs this crate does
/// not otherwise depend on; unlike `pton`/`ntop`/`getaddrinfo`, it has no
/// equivalent in the standard library, so it is surfaced as unsupported
/// rather than faked.
pub fn getifaddrinfo() -> Result<Vec<SocketAddress>, ErrorKind> {
    Err(ErrorKind::NotSupported)
}

pub fn freeifaddrinfo(_addresses: Vec<SocketAddress>) {}

pub fn getifnameinfo(_address: &SocketAddress) -> Result<String, ErrorKind> {
    Err(ErrorKind::NotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pton_ntop_round_trip() {
        let addr = pton(AddressFamily::Inet, "192.168.1.1").unwrap();
        assert_eq!(ntop(&addr).unwrap(), "192.168.1.1");
    }

    #[test]
    fn pton_rejects_malformed_input() {
        assert_eq!(pton(AddressFamily::Inet, "not-an-ip"), Err(ErrorKind::InvalidFormat));
    }

    #[test]
    fn getifaddrinfo_is_unsupported() {
        assert_eq!(getifaddrinfo(), Err(ErrorKind::NotSupported));
    }
}
