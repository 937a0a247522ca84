//! Connection tuples and packet tuple extraction
//!
//! A merged flow is pinned to the 5-tuple of the packet that triggered it.
//! Only plain IPv4 TCP/UDP packets outside connection setup and teardown
//! are eligible; everything else stays on the unmerged path.

use thiserror::Error;

/// EtherType for IPv4
pub const ETH_P_IP: u16 = 0x0800;
/// EtherType for IPv6
pub const ETH_P_IPV6: u16 = 0x86dd;
/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// TCP FIN flag
pub const TCP_FIN: u8 = 0x01;
/// TCP SYN flag
pub const TCP_SYN: u8 = 0x02;
/// TCP RST flag
pub const TCP_RST: u8 = 0x04;
/// TCP ACK flag
pub const TCP_ACK: u8 = 0x10;

const IP_MF: u16 = 0x2000;
const IP_OFFSET: u16 = 0x1fff;

/// IPv4 5-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiveTuple {
    /// Source IPv4 address
    pub src_ip: u32,
    /// Destination IPv4 address
    pub dst_ip: u32,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// IP protocol (TCP=6, UDP=17)
    pub protocol: u8,
}

impl FiveTuple {
    /// Create new tuple
    #[inline(always)]
    pub const fn new(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16, protocol: u8) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
        }
    }

    /// Reply direction of this tuple
    #[inline(always)]
    pub fn reverse(&self) -> Self {
        Self::new(self.dst_ip, self.src_ip, self.dst_port, self.src_port, self.protocol)
    }

    /// Extract the tuple from parsed packet headers
    pub fn extract(headers: &PacketHeaders) -> Result<Self, UnsupportedPacket> {
        match headers.ethertype {
            ETH_P_IP => {}
            ETH_P_IPV6 => return Err(UnsupportedPacket::Ipv6),
            other => return Err(UnsupportedPacket::EtherType(other)),
        }
        if headers.ihl != 5 {
            return Err(UnsupportedPacket::IpOptions);
        }
        if headers.frag_off & (IP_MF | IP_OFFSET) != 0 {
            return Err(UnsupportedPacket::Fragment);
        }
        match headers.protocol {
            IPPROTO_TCP => {
                if headers.tcp_flags & (TCP_FIN | TCP_SYN | TCP_RST) != 0 {
                    return Err(UnsupportedPacket::TcpControl);
                }
            }
            IPPROTO_UDP => {}
            other => return Err(UnsupportedPacket::Protocol(other)),
        }
        Ok(Self::new(
            headers.src_ip,
            headers.dst_ip,
            headers.src_port,
            headers.dst_port,
            headers.protocol,
        ))
    }
}

/// Connection tracking zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Zone(pub u16);

/// Key of a connection tuple table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnKey {
    /// Directional tuple
    pub tuple: FiveTuple,
    /// Conntrack zone
    pub zone: Zone,
}

impl ConnKey {
    /// Create new key
    pub const fn new(tuple: FiveTuple, zone: Zone) -> Self {
        Self { tuple, zone }
    }

    /// Same connection, reply direction
    pub fn reverse(&self) -> Self {
        Self::new(self.tuple.reverse(), self.zone)
    }
}

/// Direction of a NAT rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatKind {
    /// Rewrite source address and port
    Source,
    /// Rewrite destination address and port
    Destination,
}

/// NAT translation applied by a connection step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatInfo {
    /// Which side is rewritten
    pub kind: NatKind,
    /// Translated address
    pub addr: u32,
    /// Translated L4 port
    pub port: u16,
}

/// One connection-dependent step of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnStep {
    /// Tuple the connection was matched on
    pub key: ConnKey,
    /// NAT the step applies, if any
    pub nat: Option<NatInfo>,
}

/// Parsed header fields the classifier hands to the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeaders {
    /// Outer EtherType
    pub ethertype: u16,
    /// IPv4 header length in 32-bit words
    pub ihl: u8,
    /// IPv4 flags and fragment offset
    pub frag_off: u16,
    /// IP protocol
    pub protocol: u8,
    /// Source address
    pub src_ip: u32,
    /// Destination address
    pub dst_ip: u32,
    /// L4 source port
    pub src_port: u16,
    /// L4 destination port
    pub dst_port: u16,
    /// TCP flags, zero for other protocols
    pub tcp_flags: u8,
}

impl PacketHeaders {
    /// Plain IPv4 TCP segment with only ACK set
    pub fn tcp(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16) -> Self {
        Self {
            ethertype: ETH_P_IP,
            ihl: 5,
            protocol: IPPROTO_TCP,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            tcp_flags: TCP_ACK,
            ..Default::default()
        }
    }

    /// Plain IPv4 UDP datagram
    pub fn udp(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16) -> Self {
        Self {
            ethertype: ETH_P_IP,
            ihl: 5,
            protocol: IPPROTO_UDP,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            ..Default::default()
        }
    }
}

/// Why a packet cannot anchor a merged flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UnsupportedPacket {
    /// IPv6 is not merged
    #[error("ipv6 packets are not merged")]
    Ipv6,
    /// Not an IP packet
    #[error("unsupported ethertype {0:#06x}")]
    EtherType(u16),
    /// IPv4 header carries options
    #[error("ipv4 options present")]
    IpOptions,
    /// IPv4 fragment
    #[error("fragmented packet")]
    Fragment,
    /// TCP segment with FIN, SYN or RST
    #[error("tcp connection control segment")]
    TcpControl,
    /// Neither TCP nor UDP
    #[error("unsupported ip protocol {0}")]
    Protocol(u8),
}
