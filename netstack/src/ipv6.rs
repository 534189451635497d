// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The IPv6 network engine.
//!
//! Parses IPv6 headers, owns the per-NIC IPv6 address table, and implements
//! the receive side of Neighbor Discovery (RFC 4861) and the DAD defense of
//! RFC 4862: neighbor solicitations and advertisements feed the NIC's
//! tentative-address tracking and neighbor cache, router advertisements
//! feed router/prefix discovery and SLAAC. It is also the stack's
//! link-address resolver for IPv6, probing with neighbor solicitations.

use crate::addresses::AddressConfigType;
use crate::addresses::AddressKind;
use crate::addresses::AddressProperties;
use crate::addresses::AddressRef;
use crate::addresses::AddressTable;
use crate::addresses::PrimaryEndpointBehavior;
use crate::ndp::NdpTransmit;
use crate::ndp::RaInfo;
use crate::ndp::RaPrefixInfo;
use crate::nic::Nic;
use crate::protocol::GroupAddressableEndpoint;
use crate::protocol::LinkAddressResolver;
use crate::protocol::NetworkEndpoint;
use crate::protocol::NetworkProtocol;
use crate::protocol::ParseResult;
use crate::route::ethernet_multicast;
use crate::route::Route;
use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::Icmpv6Message;
use smoltcp::wire::Icmpv6Packet;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpCidr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv6Cidr;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::NdiscRepr;
use smoltcp::wire::IPV6_HEADER_LEN;
use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::sync::Weak;
use tcpip::buffer::PacketBuffer;
use tcpip::time::Duration;
use tcpip::Error;
use tcpip::NetworkProtocolNumber;
use tcpip::IPV6_PROTOCOL_NUMBER;

/// All-nodes link-local multicast group (ff02::1).
pub const ALL_NODES_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x0001);

/// All-routers link-local multicast group (ff02::2).
pub const ALL_ROUTERS_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x0002);

/// NDP lifetimes of all ones mean "infinite" (RFC 4861 section 4.6.2).
const INFINITE_LIFETIME_SECS: u64 = u32::MAX as u64;

/// True for addresses DAD applies to: unicast, so neither multicast nor
/// unspecified.
pub(crate) fn is_unicast(addr: &Ipv6Addr) -> bool {
    !addr.is_multicast() && !addr.is_unspecified()
}

/// True for fe80::/10 link-local unicast addresses.
pub(crate) fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// The solicited-node multicast group of `addr` (RFC 4291 section 2.7.1).
pub(crate) fn solicited_node(addr: &Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        0x0001,
        0xff00 | u16::from(o[13]),
        (u16::from(o[14]) << 8) | u16::from(o[15]),
    )
}

/// The modified EUI-64 interface identifier of a MAC address
/// (RFC 2464 section 4, RFC 4291 section 2.5.1).
pub(crate) fn eui64_interface_id(mac: EthernetAddress) -> [u8; 8] {
    let m = mac.0;
    [m[0] ^ 0x02, m[1], m[2], 0xff, 0xfe, m[3], m[4], m[5]]
}

/// Combines a /64 prefix with an interface identifier.
pub(crate) fn address_from_iid(prefix: Ipv6Addr, iid: [u8; 8]) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[8..].copy_from_slice(&iid);
    Ipv6Addr::from(octets)
}

/// The fe80::/64 prefix SLAAC uses for link-local generation.
pub(crate) fn link_local_prefix() -> Ipv6Cidr {
    Ipv6Cidr::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 64)
}

/// Maps an NDP wire lifetime to `None` for the infinite sentinel.
pub(crate) fn wire_lifetime(d: Duration) -> Option<Duration> {
    if d.secs() >= INFINITE_LIFETIME_SECS {
        None
    } else {
        Some(d)
    }
}

/// The IPv6 protocol engine.
pub struct Ipv6Protocol;

impl NetworkProtocol for Ipv6Protocol {
    fn number(&self) -> NetworkProtocolNumber {
        IPV6_PROTOCOL_NUMBER
    }

    fn default_prefix_len(&self) -> u8 {
        128
    }

    fn parse_addresses(&self, pkt: &[u8]) -> Option<(IpAddress, IpAddress)> {
        let packet = Ipv6Packet::new_checked(pkt).ok()?;
        Some((
            IpAddress::Ipv6(packet.src_addr()),
            IpAddress::Ipv6(packet.dst_addr()),
        ))
    }

    fn parse(&self, pkt: &mut PacketBuffer) -> ParseResult {
        let Ok(packet) = Ipv6Packet::new_checked(pkt.as_slice()) else {
            return ParseResult {
                transport_protocol: 0,
                has_transport_header: false,
                ok: false,
            };
        };
        let next_header = packet.next_header();
        pkt.mark_network_header(IPV6_HEADER_LEN);
        // Extension headers are not chased; the transport header, if any,
        // immediately follows the fixed header.
        ParseResult {
            transport_protocol: next_header.into(),
            has_transport_header: true,
            ok: true,
        }
    }

    fn new_endpoint(&self, nic: Weak<Nic>) -> Arc<dyn NetworkEndpoint> {
        Arc::new(Ipv6Endpoint {
            nic,
            table: AddressTable::new(),
            joins: Mutex::new(HashMap::new()),
        })
    }
}

/// The per-NIC IPv6 endpoint.
pub struct Ipv6Endpoint {
    nic: Weak<Nic>,
    table: AddressTable,
    joins: Mutex<HashMap<Ipv6Addr, usize>>,
}

impl Ipv6Endpoint {
    fn nic(&self) -> Option<Arc<Nic>> {
        self.nic.upgrade()
    }

    fn join_solicited_node(&self, addr: &Ipv6Addr) {
        let _ = self.join_group(IpAddress::Ipv6(solicited_node(addr)));
    }

    fn leave_solicited_node(&self, addr: &Ipv6Addr) {
        // The membership may already be gone during teardown; that is fine.
        let _ = self.leave_group(IpAddress::Ipv6(solicited_node(addr)), false);
    }

    fn handle_icmpv6(&self, route: &Route, pkt: PacketBuffer) {
        let Some(nic) = self.nic() else { return };
        let Some(header) = pkt.network_header() else {
            return;
        };
        let ip = Ipv6Packet::new_unchecked(header);
        let (src, hop_limit) = (ip.src_addr(), ip.hop_limit());
        let payload = pkt.network_payload();
        let Ok(icmp) = Icmpv6Packet::new_checked(payload) else {
            nic.count_malformed();
            return;
        };
        match icmp.msg_type() {
            Icmpv6Message::NeighborSolicit
            | Icmpv6Message::NeighborAdvert
            | Icmpv6Message::RouterAdvert => {
                // RFC 4861: NDP packets must arrive with an unhopped TTL.
                if hop_limit != 255 {
                    tracing::debug!(nic = %nic.id(), ?src, "dropping NDP packet with hop limit != 255");
                    return;
                }
                let Ok(ndisc) = NdiscRepr::parse(&icmp) else {
                    nic.count_malformed();
                    return;
                };
                self.handle_ndisc(&nic, route, src, ndisc);
            }
            _ => {
                nic.deliver_transport_packet(route, IpProtocol::Icmpv6.into(), pkt);
            }
        }
    }

    fn handle_ndisc(&self, nic: &Arc<Nic>, route: &Route, src: Ipv6Addr, ndisc: NdiscRepr<'_>) {
        match ndisc {
            NdiscRepr::NeighborSolicit { target_addr, lladdr } => {
                if !is_unicast(&target_addr) {
                    return;
                }
                if src.is_unspecified() {
                    // RFC 4861 section 7.1.1: an unspecified source must not
                    // carry a source link-layer option. Such probes are
                    // another node's DAD; if the target is tentative here,
                    // both nodes lose the address.
                    if lladdr.is_some() {
                        return;
                    }
                    if self.is_tentative(&target_addr) {
                        let _ = nic.dup_tentative_addr_detected(target_addr);
                    }
                    return;
                }
                if self.is_tentative(&target_addr) {
                    // Not ours yet; do not defend it.
                    return;
                }
                let Some(target_ref) = self.table.get_assigned(
                    IpAddress::Ipv6(target_addr),
                    false,
                    PrimaryEndpointBehavior::NeverPrimary,
                ) else {
                    return;
                };
                drop(target_ref);
                // Learn the solicitor's link address, then advertise.
                if let Some(lladdr) = lladdr {
                    if let Ok(mac) = lladdr.parse(smoltcp::phy::Medium::Ethernet) {
                        let smoltcp::wire::HardwareAddress::Ethernet(mac) = mac;
                        nic.handle_neighbor_confirmation(IpAddr::V6(src), mac);
                    }
                }
                nic.transmit_ndp(vec![NdpTransmit::NeighborAdvert {
                    src: target_addr,
                    dst: src,
                    dst_link: route.remote_link_address,
                    target: target_addr,
                    solicited: true,
                }]);
            }
            NdiscRepr::NeighborAdvert {
                flags: _,
                target_addr,
                lladdr,
            } => {
                if self.is_tentative(&target_addr) {
                    // Someone owns our tentative address.
                    let _ = nic.dup_tentative_addr_detected(target_addr);
                    return;
                }
                if let Some(lladdr) = lladdr {
                    if let Ok(mac) = lladdr.parse(smoltcp::phy::Medium::Ethernet) {
                        let smoltcp::wire::HardwareAddress::Ethernet(mac) = mac;
                        nic.handle_neighbor_confirmation(IpAddr::V6(target_addr), mac);
                    }
                }
            }
            NdiscRepr::RouterAdvert {
                router_lifetime,
                prefix_info,
                ..
            } => {
                // RFC 4861 section 6.1.2: RAs must come from a link-local
                // source.
                if !is_link_local(&src) {
                    return;
                }
                let prefix = prefix_info.and_then(|pi| {
                    if pi.prefix_len > 128 {
                        return None;
                    }
                    Some(RaPrefixInfo {
                        prefix: Ipv6Cidr::new(pi.prefix, pi.prefix_len),
                        on_link: pi.flags.contains(smoltcp::wire::NdiscPrefixInfoFlags::ON_LINK),
                        autonomous: pi
                            .flags
                            .contains(smoltcp::wire::NdiscPrefixInfoFlags::ADDRCONF),
                        valid: wire_lifetime(pi.valid_lifetime),
                        preferred: wire_lifetime(pi.preferred_lifetime),
                    })
                });
                nic.handle_router_advert(
                    src,
                    RaInfo {
                        router_lifetime,
                        prefix,
                    },
                );
            }
            _ => {}
        }
    }

    fn is_tentative(&self, addr: &Ipv6Addr) -> bool {
        self.table
            .get(IpAddress::Ipv6(*addr))
            .is_some_and(|r| r.kind() == AddressKind::PermanentTentative)
    }
}

impl NetworkEndpoint for Ipv6Endpoint {
    fn enable(&self) {
        let _ = self.join_group(IpAddress::Ipv6(ALL_NODES_MULTICAST));
    }

    fn disable(&self) {
        let _ = self.leave_group(IpAddress::Ipv6(ALL_NODES_MULTICAST), false);
    }

    fn close(&self) {}

    fn add_address(&self, addr: IpCidr, props: AddressProperties) -> Result<AddressRef, Error> {
        let r = self.table.add(addr, props)?;
        if let IpAddress::Ipv6(v6) = addr.address() {
            if is_unicast(&v6) {
                self.join_solicited_node(&v6);
            }
        }
        Ok(r)
    }

    fn remove_address(&self, addr: IpAddress) -> Result<(), Error> {
        self.table.remove(addr)?;
        if let IpAddress::Ipv6(v6) = addr {
            if is_unicast(&v6) {
                self.leave_solicited_node(&v6);
            }
        }
        Ok(())
    }

    fn has_address(&self, addr: IpAddress) -> bool {
        self.table.has(addr)
    }

    fn get_endpoint(&self, addr: IpAddress) -> Option<AddressRef> {
        self.table.get(addr)
    }

    fn get_assigned_endpoint(
        &self,
        addr: IpAddress,
        allow_temp: bool,
        temp_peb: PrimaryEndpointBehavior,
    ) -> Option<AddressRef> {
        self.table.get_assigned(addr, allow_temp, temp_peb)
    }

    fn primary_endpoint(&self, remote: Option<IpAddress>, spoofing: bool) -> Option<AddressRef> {
        self.table.primary(remote, spoofing)
    }

    fn all_addresses(&self) -> Vec<IpCidr> {
        self.table.all()
    }

    fn primary_addresses(&self) -> Vec<IpCidr> {
        self.table.primary_addresses()
    }

    fn handle_packet(&self, route: &Route, pkt: PacketBuffer) {
        let Some(header) = pkt.network_header() else {
            return;
        };
        let next_header = Ipv6Packet::new_unchecked(header).next_header();
        if next_header == IpProtocol::Icmpv6 {
            self.handle_icmpv6(route, pkt);
        } else if let Some(nic) = self.nic() {
            nic.deliver_transport_packet(route, next_header.into(), pkt);
        }
    }

    fn as_group_endpoint(&self) -> Option<&dyn GroupAddressableEndpoint> {
        Some(self)
    }
}

impl GroupAddressableEndpoint for Ipv6Endpoint {
    fn join_group(&self, group: IpAddress) -> Result<bool, Error> {
        let IpAddress::Ipv6(v6) = group else {
            return Err(Error::BadAddress);
        };
        if !v6.is_multicast() {
            return Err(Error::BadAddress);
        }
        let mut joins = self.joins.lock();
        let count = joins.entry(v6).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Ok(false);
        }
        // First join: the group address becomes a directed-lookup match so
        // inbound group traffic is accepted.
        self.table
            .add(
                IpCidr::new(group, 128),
                AddressProperties {
                    peb: PrimaryEndpointBehavior::NeverPrimary,
                    kind: AddressKind::Permanent,
                    config_type: AddressConfigType::Static,
                    deprecated: false,
                },
            )
            .map(|_| true)
    }

    fn leave_group(&self, group: IpAddress, force: bool) -> Result<bool, Error> {
        let IpAddress::Ipv6(v6) = group else {
            return Err(Error::BadAddress);
        };
        let mut joins = self.joins.lock();
        let Some(count) = joins.get_mut(&v6) else {
            return Err(Error::BadLocalAddress);
        };
        if !force && *count > 1 {
            *count -= 1;
            return Ok(false);
        }
        joins.remove(&v6);
        self.table.remove(group)?;
        Ok(true)
    }

    fn leave_all_groups(&self) -> Result<(), Error> {
        let groups: Vec<Ipv6Addr> = self.joins.lock().keys().copied().collect();
        let mut first_err = Ok(());
        for group in groups {
            if let Err(e) = self.leave_group(IpAddress::Ipv6(group), true) {
                if first_err.is_ok() {
                    first_err = Err(e);
                }
            }
        }
        first_err
    }

    fn is_in_group(&self, group: IpAddress) -> bool {
        match group {
            IpAddress::Ipv6(v6) => self.joins.lock().contains_key(&v6),
            IpAddress::Ipv4(_) => false,
        }
    }
}

/// Link-address resolution for IPv6: neighbor solicitation probes.
pub struct Ipv6LinkAddressResolver;

impl LinkAddressResolver for Ipv6LinkAddressResolver {
    fn link_address_request(
        &self,
        target: IpAddress,
        local_addr: Option<IpAddress>,
        nic: &Arc<Nic>,
    ) -> Result<(), Error> {
        let IpAddress::Ipv6(target) = target else {
            return Err(Error::BadAddress);
        };
        let src = match local_addr {
            Some(IpAddress::Ipv6(a)) if !a.is_unspecified() => a,
            _ => nic
                .ipv6_source_for_probe()
                .ok_or(Error::InvalidEndpointState)?,
        };
        nic.transmit_ndp(vec![NdpTransmit::NeighborSolicit {
            src,
            target,
        }]);
        Ok(())
    }

    fn resolve_static_address(&self, addr: IpAddress) -> Option<EthernetAddress> {
        match addr {
            IpAddress::Ipv6(v6) if v6.is_multicast() => ethernet_multicast(&addr),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::address_from_iid;
    use super::eui64_interface_id;
    use super::is_link_local;
    use super::solicited_node;
    use super::wire_lifetime;
    use smoltcp::wire::EthernetAddress;
    use std::net::Ipv6Addr;
    use tcpip::time::Duration;

    #[test]
    fn eui64_flips_universal_bit() {
        // Example from RFC 2464 section 4.
        let mac = EthernetAddress([0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde]);
        assert_eq!(
            eui64_interface_id(mac),
            [0x36, 0x56, 0x78, 0xff, 0xfe, 0x9a, 0xbc, 0xde]
        );
    }

    #[test]
    fn solicited_node_takes_low_24_bits() {
        let addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0x0211, 0x22ff, 0xfe33, 0x4455);
        assert_eq!(
            solicited_node(&addr),
            Ipv6Addr::new(0xff02, 0, 0, 0, 0, 1, 0xff33, 0x4455)
        );
    }

    #[test]
    fn link_local_detection() {
        assert!(is_link_local(&Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)));
        assert!(!is_link_local(&Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)));
    }

    #[test]
    fn infinite_lifetime_sentinel() {
        assert_eq!(wire_lifetime(Duration::from_secs(1800)), Some(Duration::from_secs(1800)));
        assert_eq!(wire_lifetime(Duration::from_secs(u32::MAX as u64)), None);
    }

    #[test]
    fn iid_substitution() {
        let prefix = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0);
        let addr = address_from_iid(prefix, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            addr,
            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0x0102, 0x0304, 0x0506, 0x0708)
        );
    }
}
