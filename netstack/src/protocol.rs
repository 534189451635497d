// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Trait surface between the NIC and the protocol engines it hosts.
//!
//! A network engine is two halves: a [`NetworkProtocol`] (stateless factory
//! and parser, one per stack) and the [`NetworkEndpoint`] it instantiates on
//! each NIC. The endpoint owns the per-NIC address table and handles packets
//! addressed to this interface. Group membership is an optional capability,
//! probed with [`NetworkEndpoint::as_group_endpoint`] rather than a nullable
//! field so absence can never masquerade as presence.

use crate::addresses::AddressProperties;
use crate::addresses::AddressRef;
use crate::addresses::PrimaryEndpointBehavior;
use crate::nic::Nic;
use crate::route::Route;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpCidr;
use std::sync::Arc;
use std::sync::Weak;
use tcpip::buffer::PacketBuffer;
use tcpip::Error;
use tcpip::NetworkProtocolNumber;
use tcpip::NicId;
use tcpip::TransportProtocolNumber;

/// Outcome of asking a network protocol to parse an inbound packet.
#[derive(Debug, Clone, Copy)]
pub struct ParseResult {
    /// The transport protocol the network header says comes next.
    pub transport_protocol: TransportProtocolNumber,
    /// Whether a transport header is present and parseable (e.g. this is not
    /// a non-initial fragment).
    pub has_transport_header: bool,
    /// Whether the network header itself was parseable.
    pub ok: bool,
}

/// A network-layer protocol engine, registered once per stack.
pub trait NetworkProtocol: Send + Sync {
    /// The ethertype this engine handles.
    fn number(&self) -> NetworkProtocolNumber;

    /// Default prefix length for addresses of this protocol.
    fn default_prefix_len(&self) -> u8;

    /// Extracts (source, destination) from a packet starting at the network
    /// header. `None` if the packet is too short.
    fn parse_addresses(&self, pkt: &[u8]) -> Option<(IpAddress, IpAddress)>;

    /// Parses the network header, marking its bounds in `pkt`.
    fn parse(&self, pkt: &mut PacketBuffer) -> ParseResult;

    /// Creates this protocol's endpoint for a NIC under construction.
    fn new_endpoint(&self, nic: Weak<Nic>) -> Arc<dyn NetworkEndpoint>;
}

/// The per-NIC instance of a network protocol.
///
/// Installed at NIC construction, at most one per protocol number, and never
/// replaced for the NIC's lifetime.
pub trait NetworkEndpoint: Send + Sync {
    /// Called when the owning NIC is enabled.
    fn enable(&self);

    /// Called when the owning NIC is disabled.
    fn disable(&self);

    /// Releases endpoint resources; the NIC is being removed.
    fn close(&self);

    /// Assigns an address. See the address-table contract in
    /// [`crate::addresses`].
    fn add_address(&self, addr: IpCidr, props: AddressProperties) -> Result<AddressRef, Error>;

    /// Removes a permanent or tentative address.
    fn remove_address(&self, addr: IpAddress) -> Result<(), Error>;

    /// True if `addr` is assigned as a permanent or tentative address.
    fn has_address(&self, addr: IpAddress) -> bool;

    /// Looks up `addr` without regard to assignment state and without
    /// synthesizing anything.
    fn get_endpoint(&self, addr: IpAddress) -> Option<AddressRef>;

    /// Looks up an assigned endpoint for `addr`; may synthesize a temporary
    /// endpoint when `allow_temp` is set, and matches the IPv4 directed
    /// broadcast of assigned prefixes.
    fn get_assigned_endpoint(
        &self,
        addr: IpAddress,
        allow_temp: bool,
        temp_peb: PrimaryEndpointBehavior,
    ) -> Option<AddressRef>;

    /// The primary endpoint for outgoing traffic toward `remote`.
    fn primary_endpoint(&self, remote: Option<IpAddress>, spoofing: bool) -> Option<AddressRef>;

    /// Every address in the table, including temporary and group entries.
    fn all_addresses(&self) -> Vec<IpCidr>;

    /// Addresses eligible for primary selection, in primacy order.
    fn primary_addresses(&self) -> Vec<IpCidr>;

    /// Handles a packet addressed to this interface. `route.local_address`
    /// is the packet's destination, `route.remote_address` its source.
    fn handle_packet(&self, route: &Route, pkt: PacketBuffer);

    /// The group-membership capability, if this endpoint has one.
    fn as_group_endpoint(&self) -> Option<&dyn GroupAddressableEndpoint> {
        None
    }
}

/// Multicast group membership, maintained with join counts by the endpoint.
pub trait GroupAddressableEndpoint: Send + Sync {
    /// Joins `group`, returning true if this was the first join.
    fn join_group(&self, group: IpAddress) -> Result<bool, Error>;

    /// Leaves `group`, returning true if the membership was released. With
    /// `force`, the join count is ignored and the membership dropped.
    fn leave_group(&self, group: IpAddress, force: bool) -> Result<bool, Error>;

    /// Drops every membership regardless of join counts.
    fn leave_all_groups(&self) -> Result<(), Error>;

    /// True if `group` is currently joined.
    fn is_in_group(&self, group: IpAddress) -> bool;
}

/// Identifies a transport endpoint: the 4-tuple a packet demultiplexes on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportEndpointId {
    /// Destination port of inbound packets.
    pub local_port: u16,
    /// Destination address of inbound packets.
    pub local_address: IpAddress,
    /// Source port of inbound packets; 0 matches any.
    pub remote_port: u16,
    /// Source address of inbound packets; unspecified matches any.
    pub remote_address: IpAddress,
}

/// The kind of condition a transport control (ICMP error) packet reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// Destination port unreachable.
    PortUnreachable,
    /// Destination network unreachable.
    NetworkUnreachable,
    /// Fragmentation needed; `extra` carries the MTU.
    PacketTooBig,
}

/// A transport-layer protocol engine.
pub trait TransportProtocol: Send + Sync {
    /// The IP protocol number this engine handles.
    fn number(&self) -> TransportProtocolNumber;

    /// The smallest valid header for this protocol.
    fn minimum_packet_size(&self) -> usize;

    /// Extracts (source port, destination port) from a transport header.
    fn parse_ports(&self, header: &[u8]) -> Result<(u16, u16), Error>;

    /// Parses the transport header, marking its bounds in `pkt`.
    fn parse(&self, pkt: &mut PacketBuffer) -> bool;

    /// Last-resort handler for packets no endpoint claimed (e.g. emit a
    /// port-unreachable error). True if the packet was consumed.
    fn handle_unknown_destination_packet(
        &self,
        route: &Route,
        id: &TransportEndpointId,
        pkt: &PacketBuffer,
    ) -> bool;
}

/// A bound transport endpoint registered with the demultiplexer.
pub trait TransportEndpoint: Send + Sync {
    /// Delivers a data packet matching this endpoint's id.
    fn handle_packet(&self, id: &TransportEndpointId, pkt: &PacketBuffer);

    /// Delivers a control (ICMP error) notification.
    fn handle_control_packet(
        &self,
        id: &TransportEndpointId,
        typ: ControlType,
        extra: u32,
        pkt: &PacketBuffer,
    ) {
        let _ = (id, typ, extra, pkt);
    }
}

/// A raw-socket observer of one transport protocol; sees every inbound
/// packet of that protocol before demultiplexing.
pub trait RawTransportEndpoint: Send + Sync {
    /// Delivers a packet of the subscribed protocol.
    fn handle_packet(&self, route: &Route, pkt: &PacketBuffer);
}

/// Marks which side of the NIC a packet-socket observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Inbound frame addressed to (or observed by) this host.
    Host,
    /// Frame transmitted by this host.
    Outgoing,
}

/// A packet socket: observes raw frames on a NIC for one ethertype, or for
/// all of them.
pub trait PacketEndpoint: Send + Sync {
    /// Delivers a cloned frame. For [`PacketType::Outgoing`] deliveries the
    /// link-layer header has been synthesized into the clone.
    fn handle_packet(
        &self,
        nic: NicId,
        local_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
        packet_type: PacketType,
    );
}

/// Resolves network addresses to link addresses for one network protocol.
pub trait LinkAddressResolver: Send + Sync {
    /// Sends a resolution probe for `target` out `nic`.
    fn link_address_request(
        &self,
        target: IpAddress,
        local_addr: Option<IpAddress>,
        nic: &Arc<Nic>,
    ) -> Result<(), Error>;

    /// Resolves addresses with a fixed mapping (multicast, broadcast)
    /// without consulting a cache.
    fn resolve_static_address(&self, addr: IpAddress) -> Option<EthernetAddress>;
}
