// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared fixtures for the crate's tests: a stack with both IP engines and
//! a fake transport, recording endpoints, and wire-format builders.

use crate::ipv4::Ipv4Protocol;
use crate::ipv6::Ipv6Protocol;
use crate::link::channel::ChannelEndpoint;
use crate::link::LinkCapabilities;
use crate::ndp::NdpConfigs;
use crate::ndp::NdpDispatcher;
use crate::protocol::ControlType;
use crate::protocol::PacketEndpoint;
use crate::protocol::PacketType;
use crate::protocol::RawTransportEndpoint;
use crate::protocol::TransportEndpoint;
use crate::protocol::TransportEndpointId;
use crate::protocol::TransportProtocol;
use crate::route::Route;
use crate::stack::Stack;
use crate::stack::StackOptions;
use parking_lot::Mutex;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::Icmpv6Packet;
use smoltcp::wire::Icmpv6Repr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpCidr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use smoltcp::wire::Ipv6Cidr;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::Ipv6Repr;
use smoltcp::wire::NdiscNeighborFlags;
use smoltcp::wire::NdiscPrefixInfoFlags;
use smoltcp::wire::NdiscPrefixInformation;
use smoltcp::wire::NdiscRepr;
use smoltcp::wire::NdiscRouterFlags;
use smoltcp::wire::RawHardwareAddress;
use smoltcp::wire::IPV6_HEADER_LEN;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::sync::Arc;
use tcpip::buffer::PacketBuffer;
use tcpip::time::Duration;
use tcpip::time::ManualClock;
use tcpip::NicId;
use tcpip::TransportProtocolNumber;

pub(crate) const FAKE_TRANSPORT_NUMBER: TransportProtocolNumber = 17;

pub(crate) fn mac(last: u8) -> EthernetAddress {
    EthernetAddress([0x02, 0, 0, 0, 0, last])
}

pub(crate) fn eth_link(last: u8) -> Arc<ChannelEndpoint> {
    ChannelEndpoint::new(
        1500,
        mac(last),
        LinkCapabilities {
            loopback: false,
            resolution_required: true,
        },
    )
}

pub(crate) struct TestSetup {
    pub stack: Arc<Stack>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingDispatcher>,
}

impl TestSetup {
    pub fn advance(&self, d: Duration) {
        self.clock.advance(d);
        self.stack.handle_timers();
    }
}

pub(crate) fn test_stack(tweak: impl FnOnce(&mut StackOptions)) -> TestSetup {
    let clock = Arc::new(ManualClock::default());
    let events = Arc::new(RecordingDispatcher::default());
    let mut opts = StackOptions {
        network_protocols: vec![Arc::new(Ipv4Protocol), Arc::new(Ipv6Protocol)],
        transport_protocols: vec![Arc::new(FakeTransport)],
        clock: Some(clock.clone()),
        ndp_dispatcher: Some(events.clone()),
        ..Default::default()
    };
    // Most tests do not want router-solicitation timers in the way.
    opts.ndp_configs.max_rtr_solicitations = 0;
    tweak(&mut opts);
    TestSetup {
        stack: Stack::new(opts),
        clock,
        events,
    }
}

/// A transport protocol with an 8-byte header carrying big-endian source
/// and destination ports in its first four bytes.
pub(crate) struct FakeTransport;

impl TransportProtocol for FakeTransport {
    fn number(&self) -> TransportProtocolNumber {
        FAKE_TRANSPORT_NUMBER
    }

    fn minimum_packet_size(&self) -> usize {
        8
    }

    fn parse_ports(&self, header: &[u8]) -> Result<(u16, u16), tcpip::Error> {
        if header.len() < 4 {
            return Err(tcpip::Error::BadAddress);
        }
        Ok((
            u16::from_be_bytes([header[0], header[1]]),
            u16::from_be_bytes([header[2], header[3]]),
        ))
    }

    fn parse(&self, pkt: &mut PacketBuffer) -> bool {
        if pkt.network_payload().len() < 8 {
            return false;
        }
        pkt.mark_transport_header(8);
        true
    }

    fn handle_unknown_destination_packet(
        &self,
        _route: &Route,
        _id: &TransportEndpointId,
        _pkt: &PacketBuffer,
    ) -> bool {
        false
    }
}

#[derive(Default)]
pub(crate) struct RecordingTransportEndpoint {
    pub received: Mutex<Vec<(TransportEndpointId, Vec<u8>)>>,
    pub control: Mutex<Vec<(TransportEndpointId, ControlType, u32)>>,
}

impl TransportEndpoint for RecordingTransportEndpoint {
    fn handle_packet(&self, id: &TransportEndpointId, pkt: &PacketBuffer) {
        self.received
            .lock()
            .push((id.clone(), pkt.transport_payload().to_vec()));
    }

    fn handle_control_packet(
        &self,
        id: &TransportEndpointId,
        typ: ControlType,
        extra: u32,
        _pkt: &PacketBuffer,
    ) {
        self.control.lock().push((id.clone(), typ, extra));
    }
}

#[derive(Default)]
pub(crate) struct RecordingRawEndpoint {
    pub received: Mutex<Vec<Vec<u8>>>,
}

impl RawTransportEndpoint for RecordingRawEndpoint {
    fn handle_packet(&self, _route: &Route, pkt: &PacketBuffer) {
        self.received.lock().push(pkt.as_slice().to_vec());
    }
}

pub(crate) struct PacketRecord {
    pub nic: NicId,
    pub proto: u16,
    pub packet_type: PacketType,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct RecordingPacketEndpoint {
    pub received: Mutex<Vec<PacketRecord>>,
}

impl PacketEndpoint for RecordingPacketEndpoint {
    fn handle_packet(
        &self,
        nic: NicId,
        _local_link: EthernetAddress,
        proto: u16,
        pkt: PacketBuffer,
        packet_type: PacketType,
    ) {
        self.received.lock().push(PacketRecord {
            nic,
            proto,
            packet_type,
            data: pkt.as_slice().to_vec(),
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Dad { addr: Ipv6Addr, resolved: bool },
    RouterDiscovered(Ipv6Addr),
    RouterInvalidated(Ipv6Addr),
    PrefixDiscovered(Ipv6Cidr),
    PrefixInvalidated(Ipv6Cidr),
    AutoGen(IpCidr),
    AutoGenDeprecated(IpCidr),
    AutoGenInvalidated(IpCidr),
}

#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingDispatcher {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock())
    }

    pub fn auto_gen_addrs(&self) -> Vec<IpCidr> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::AutoGen(cidr) => Some(*cidr),
                _ => None,
            })
            .collect()
    }
}

impl NdpDispatcher for RecordingDispatcher {
    fn on_duplicate_address_detection_status(&self, _nic: NicId, addr: Ipv6Addr, resolved: bool) {
        self.events.lock().push(Event::Dad { addr, resolved });
    }

    fn on_default_router_discovered(&self, _nic: NicId, addr: Ipv6Addr) -> bool {
        self.events.lock().push(Event::RouterDiscovered(addr));
        true
    }

    fn on_default_router_invalidated(&self, _nic: NicId, addr: Ipv6Addr) {
        self.events.lock().push(Event::RouterInvalidated(addr));
    }

    fn on_on_link_prefix_discovered(&self, _nic: NicId, prefix: Ipv6Cidr) -> bool {
        self.events.lock().push(Event::PrefixDiscovered(prefix));
        true
    }

    fn on_on_link_prefix_invalidated(&self, _nic: NicId, prefix: Ipv6Cidr) {
        self.events.lock().push(Event::PrefixInvalidated(prefix));
    }

    fn on_auto_gen_address(&self, _nic: NicId, addr: IpCidr) -> bool {
        self.events.lock().push(Event::AutoGen(addr));
        true
    }

    fn on_auto_gen_address_deprecated(&self, _nic: NicId, addr: IpCidr) {
        self.events.lock().push(Event::AutoGenDeprecated(addr));
    }

    fn on_auto_gen_address_invalidated(&self, _nic: NicId, addr: IpCidr) {
        self.events.lock().push(Event::AutoGenInvalidated(addr));
    }
}

// ---- Wire builders ----

pub(crate) fn ipv4_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: IpProtocol,
    payload: &[u8],
) -> PacketBuffer {
    let repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: proto,
        payload_len: payload.len(),
        hop_limit: 64,
    };
    let mut buf = vec![0u8; repr.buffer_len() + payload.len()];
    let header_len = repr.buffer_len();
    {
        let mut packet = Ipv4Packet::new_unchecked(&mut buf[..]);
        repr.emit(&mut packet, &ChecksumCapabilities::default());
    }
    buf[header_len..].copy_from_slice(payload);
    PacketBuffer::new(buf)
}

pub(crate) fn ipv6_packet(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: IpProtocol,
    hop_limit: u8,
    payload: &[u8],
) -> PacketBuffer {
    let mut buf = vec![0u8; IPV6_HEADER_LEN + payload.len()];
    {
        let mut packet = Ipv6Packet::new_unchecked(&mut buf[..]);
        Ipv6Repr {
            src_addr: src,
            dst_addr: dst,
            next_header,
            payload_len: payload.len(),
            hop_limit,
        }
        .emit(&mut packet);
    }
    buf[IPV6_HEADER_LEN..].copy_from_slice(payload);
    PacketBuffer::new(buf)
}

pub(crate) fn ndisc_packet(src: Ipv6Addr, dst: Ipv6Addr, repr: NdiscRepr<'_>) -> PacketBuffer {
    let icmp_repr = Icmpv6Repr::Ndisc(repr);
    let mut buf = vec![0u8; IPV6_HEADER_LEN + icmp_repr.buffer_len()];
    {
        let mut packet = Ipv6Packet::new_unchecked(&mut buf[..]);
        Ipv6Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: IpProtocol::Icmpv6,
            payload_len: icmp_repr.buffer_len(),
            hop_limit: 255,
        }
        .emit(&mut packet);
        let mut icmp = Icmpv6Packet::new_unchecked(packet.payload_mut());
        icmp_repr.emit(&src, &dst, &mut icmp, &ChecksumCapabilities::default());
    }
    PacketBuffer::new(buf)
}

/// A neighbor advertisement claiming `target`, sent to all-nodes.
pub(crate) fn neighbor_advert(src: Ipv6Addr, target: Ipv6Addr, lladdr: EthernetAddress) -> PacketBuffer {
    ndisc_packet(
        src,
        crate::ipv6::ALL_NODES_MULTICAST,
        NdiscRepr::NeighborAdvert {
            flags: NdiscNeighborFlags::OVERRIDE,
            target_addr: target,
            lladdr: Some(RawHardwareAddress::from(lladdr)),
        },
    )
}

/// A DAD-style neighbor solicitation (unspecified source) for `target`.
pub(crate) fn dad_neighbor_solicit(target: Ipv6Addr) -> PacketBuffer {
    ndisc_packet(
        Ipv6Addr::UNSPECIFIED,
        crate::ipv6::solicited_node(&target),
        NdiscRepr::NeighborSolicit {
            target_addr: target,
            lladdr: None,
        },
    )
}

pub(crate) struct RaPrefix {
    pub prefix: Ipv6Cidr,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid_secs: u32,
    pub preferred_secs: u32,
}

/// A router advertisement from `src` (must be link-local to be accepted).
pub(crate) fn router_advert(
    src: Ipv6Addr,
    lladdr: EthernetAddress,
    router_lifetime_secs: u16,
    prefix: Option<RaPrefix>,
) -> PacketBuffer {
    let prefix_info = prefix.map(|p| {
        let mut flags = NdiscPrefixInfoFlags::empty();
        if p.on_link {
            flags |= NdiscPrefixInfoFlags::ON_LINK;
        }
        if p.autonomous {
            flags |= NdiscPrefixInfoFlags::ADDRCONF;
        }
        NdiscPrefixInformation {
            prefix_len: p.prefix.prefix_len(),
            flags,
            valid_lifetime: Duration::from_secs(u64::from(p.valid_secs)),
            preferred_lifetime: Duration::from_secs(u64::from(p.preferred_secs)),
            prefix: p.prefix.address(),
        }
    });
    ndisc_packet(
        src,
        crate::ipv6::ALL_NODES_MULTICAST,
        NdiscRepr::RouterAdvert {
            hop_limit: 64,
            flags: NdiscRouterFlags::empty(),
            router_lifetime: Duration::from_secs(u64::from(router_lifetime_secs)),
            reachable_time: Duration::from_millis(0),
            retrans_time: Duration::from_millis(0),
            lladdr: Some(RawHardwareAddress::from(lladdr)),
            mtu: None,
            prefix_info,
        },
    )
}

/// Digest of an NDP packet captured on a channel link.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NdiscSummary {
    NeighborSolicit {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        target: Ipv6Addr,
    },
    NeighborAdvert {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        target: Ipv6Addr,
    },
    RouterSolicit {
        src: Ipv6Addr,
    },
}

pub(crate) fn parse_ndisc(pkt: &PacketBuffer) -> Option<NdiscSummary> {
    let ip = Ipv6Packet::new_checked(pkt.as_slice()).ok()?;
    if ip.next_header() != IpProtocol::Icmpv6 {
        return None;
    }
    let (src, dst) = (ip.src_addr(), ip.dst_addr());
    let icmp = Icmpv6Packet::new_checked(ip.payload()).ok()?;
    match NdiscRepr::parse(&icmp).ok()? {
        NdiscRepr::NeighborSolicit { target_addr, .. } => Some(NdiscSummary::NeighborSolicit {
            src,
            dst,
            target: target_addr,
        }),
        NdiscRepr::NeighborAdvert { target_addr, .. } => Some(NdiscSummary::NeighborAdvert {
            src,
            dst,
            target: target_addr,
        }),
        NdiscRepr::RouterSolicit { .. } => Some(NdiscSummary::RouterSolicit { src }),
        _ => None,
    }
}
