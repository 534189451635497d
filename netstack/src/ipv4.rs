// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The IPv4 network engine: header parsing, the per-NIC address table, and
//! group membership. ARP and ICMPv4 generation live outside this crate;
//! inbound ICMPv4 rides the transport delivery path.

use crate::addresses::AddressConfigType;
use crate::addresses::AddressKind;
use crate::addresses::AddressProperties;
use crate::addresses::AddressRef;
use crate::addresses::AddressTable;
use crate::addresses::PrimaryEndpointBehavior;
use crate::nic::Nic;
use crate::protocol::GroupAddressableEndpoint;
use crate::protocol::NetworkEndpoint;
use crate::protocol::NetworkProtocol;
use crate::protocol::ParseResult;
use crate::route::Route;
use parking_lot::Mutex;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpCidr;
use smoltcp::wire::Ipv4Packet;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Weak;
use tcpip::buffer::PacketBuffer;
use tcpip::Error;
use tcpip::NetworkProtocolNumber;
use tcpip::IPV4_PROTOCOL_NUMBER;

/// The IPv4 protocol engine.
pub struct Ipv4Protocol;

impl NetworkProtocol for Ipv4Protocol {
    fn number(&self) -> NetworkProtocolNumber {
        IPV4_PROTOCOL_NUMBER
    }

    fn default_prefix_len(&self) -> u8 {
        32
    }

    fn parse_addresses(&self, pkt: &[u8]) -> Option<(IpAddress, IpAddress)> {
        let packet = Ipv4Packet::new_checked(pkt).ok()?;
        Some((
            IpAddress::Ipv4(packet.src_addr()),
            IpAddress::Ipv4(packet.dst_addr()),
        ))
    }

    fn parse(&self, pkt: &mut PacketBuffer) -> ParseResult {
        let Ok(packet) = Ipv4Packet::new_checked(pkt.as_slice()) else {
            return ParseResult {
                transport_protocol: 0,
                has_transport_header: false,
                ok: false,
            };
        };
        let header_len = usize::from(packet.header_len());
        let next_header = packet.next_header();
        // Only the first fragment carries the transport header.
        let first_fragment = packet.frag_offset() == 0;
        pkt.mark_network_header(header_len);
        ParseResult {
            transport_protocol: next_header.into(),
            has_transport_header: first_fragment,
            ok: true,
        }
    }

    fn new_endpoint(&self, nic: Weak<Nic>) -> Arc<dyn NetworkEndpoint> {
        Arc::new(Ipv4Endpoint {
            nic,
            table: AddressTable::new(),
            joins: Mutex::new(HashMap::new()),
        })
    }
}

/// The per-NIC IPv4 endpoint.
pub struct Ipv4Endpoint {
    nic: Weak<Nic>,
    table: AddressTable,
    joins: Mutex<HashMap<Ipv4Addr, usize>>,
}

impl NetworkEndpoint for Ipv4Endpoint {
    fn enable(&self) {}

    fn disable(&self) {}

    fn close(&self) {}

    fn add_address(&self, addr: IpCidr, props: AddressProperties) -> Result<AddressRef, Error> {
        self.table.add(addr, props)
    }

    fn remove_address(&self, addr: IpAddress) -> Result<(), Error> {
        self.table.remove(addr)
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
        let Some(nic) = self.nic.upgrade() else { return };
        let Some(header) = pkt.network_header() else {
            return;
        };
        let next_header = Ipv4Packet::new_unchecked(header).next_header();
        nic.deliver_transport_packet(route, next_header.into(), pkt);
    }

    fn as_group_endpoint(&self) -> Option<&dyn GroupAddressableEndpoint> {
        Some(self)
    }
}

impl GroupAddressableEndpoint for Ipv4Endpoint {
    fn join_group(&self, group: IpAddress) -> Result<bool, Error> {
        let IpAddress::Ipv4(v4) = group else {
            return Err(Error::BadAddress);
        };
        if !v4.is_multicast() {
            return Err(Error::BadAddress);
        }
        let mut joins = self.joins.lock();
        let count = joins.entry(v4).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Ok(false);
        }
        self.table
            .add(
                IpCidr::new(group, 32),
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
        let IpAddress::Ipv4(v4) = group else {
            return Err(Error::BadAddress);
        };
        let mut joins = self.joins.lock();
        let Some(count) = joins.get_mut(&v4) else {
            return Err(Error::BadLocalAddress);
        };
        if !force && *count > 1 {
            *count -= 1;
            return Ok(false);
        }
        joins.remove(&v4);
        self.table.remove(group)?;
        Ok(true)
    }

    fn leave_all_groups(&self) -> Result<(), Error> {
        let groups: Vec<Ipv4Addr> = self.joins.lock().keys().copied().collect();
        let mut first_err = Ok(());
        for group in groups {
            if let Err(e) = self.leave_group(IpAddress::Ipv4(group), true) {
                if first_err.is_ok() {
                    first_err = Err(e);
                }
            }
        }
        first_err
    }

    fn is_in_group(&self, group: IpAddress) -> bool {
        match group {
            IpAddress::Ipv4(v4) => self.joins.lock().contains_key(&v4),
            IpAddress::Ipv6(_) => false,
        }
    }
}
