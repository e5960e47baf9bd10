//! Proxy wire types: address families, socket kinds, and protocol numbers
//! used to describe the remote destination a tunneled socket connects to.
//!
//! Grounded on `original_source/inc/prx_types.h`. These are plain
//! encode/decode value types; no local socket syscalls are performed
//! against them (the remote proxy host performs the actual I/O).

pub mod properties;

pub use properties::PropertyBag;

pub const MAX_HOST_LENGTH: usize = 1025;
pub const MAX_INTERFACE_LENGTH: usize = 128;
pub const MAX_UNIX_PATH_LENGTH: usize = 108;

/// IANA-assigned address family, extended with a non-standard value for
/// addresses that only make sense behind a proxy tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AddressFamily {
    Unspecified = 0,
    Unix = 1,
    Inet = 2,
    Inet6 = 23,
    Proxy = 28165,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixAddress {
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inet4Address {
    pub addr: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inet6Address {
    pub addr: [u8; 16],
    pub scope_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InetAddress {
    V4(Inet4Address),
    V6(Inet6Address),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InetSocketAddress {
    pub port: u16,
    pub flow: u32,
    pub address: InetAddress,
}

/// Logical destination reached only through the proxy: host name plus port
/// rather than a resolved IP, since resolution happens on the far side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySocketAddress {
    pub port: u16,
    pub flags: u16,
    pub itf_index: i32,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Unix(UnixAddress),
    Inet(InetSocketAddress),
    Proxy(ProxySocketAddress),
}

impl SocketAddress {
    pub fn family(&self) -> AddressFamily {
        match self {
            SocketAddress::Unix(_) => AddressFamily::Unix,
            SocketAddress::Inet(a) => match a.address {
                InetAddress::V4(_) => AddressFamily::Inet,
                InetAddress::V6(_) => AddressFamily::Inet6,
            },
            SocketAddress::Proxy(_) => AddressFamily::Proxy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketType {
    Stream = 1,
    Dgram = 2,
    Raw = 3,
    Rdm = 4,
    SeqPacket = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolType {
    Unspecified = 0,
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
    Icmpv6 = 58,
}

/// Minimal bitflags-style macro so the capability set stays a plain value
/// type without pulling in the `bitflags` crate for nine constants.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $flag: $name = $name($value);)*
            pub const ALL: $name = $name($($value)|*);

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            pub const fn without(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }
    };
}

bitflags_like! {
    /// PAL capability bitmap (external interface catalog). This crate never
    /// calls into a PAL itself; the bitmap exists so the connection manager
    /// can advertise/accept capability-gated behavior symmetrically with
    /// the remote side.
    pub struct PalCapabilities: u32 {
        const FILE = 0x1;
        const NET = 0x2;
        const SOCKETS = 0x4;
        const WSCLIENT = 0x8;
        const CRED = 0x10;
        const EV = 0x20;
        const DNSSD = 0x40;
        const DIRS = 0x80;
        const SCAN = 0x100;
    }
}

/// Socket option catalog (§6.7), a dense integer set mirroring
/// `prx_socket_option_t`. Every option's value is logically a 64-bit
/// unsigned integer; multicast join/leave instead carries a
/// [`MulticastOption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketOption {
    Nonblocking,
    Available,
    Shutdown,
    Debug,
    Acceptconn,
    Reuseaddr,
    Keepalive,
    Dontroute,
    Broadcast,
    Linger,
    Oobinline,
    Sndbuf,
    Rcvbuf,
    Sndlowat,
    Rcvlowat,
    Sndtimeo,
    Rcvtimeo,
    Error,
    Type,
    IpOptions,
    IpHdrincl,
    IpTos,
    IpTtl,
    IpMulticastTtl,
    IpMulticastLoop,
    IpPktinfo,
    Ipv6Hoplimit,
    Ipv6ProtectionLevel,
    Ipv6V6only,
    TcpNodelay,
    IpMulticastJoin,
    IpMulticastLeave,
    PropsTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastOption {
    pub family: AddressFamily,
    pub itf_index: i32,
    pub address: InetAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_union_and_contains() {
        let caps = PalCapabilities::NET.union(PalCapabilities::SOCKETS);
        assert!(caps.contains(PalCapabilities::NET));
        assert!(caps.contains(PalCapabilities::SOCKETS));
        assert!(!caps.contains(PalCapabilities::WSCLIENT));
        assert_eq!(caps.bits(), 0x6);
    }

    #[test]
    fn address_family_matches_wire_values() {
        assert_eq!(AddressFamily::Proxy as u16, 28165);
        assert_eq!(AddressFamily::Inet6 as u16, 23);
    }
}
