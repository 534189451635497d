// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Routes: a resolved (or resolving) path from a local address out one NIC.
//!
//! A route returned by lookup holds a live reference to the local address
//! endpoint; dropping the route releases it. On `WouldBlock` from
//! [`Route::resolve`], ownership of the route transfers to the stack
//! forwarder together with the resolution channel.

use crate::neighbor::ResolutionResult;
use crate::nic::LinkResolution;
use crate::nic::Nic;
use futures::channel::oneshot;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::IpAddress;
use std::sync::Arc;
use tcpip::buffer::PacketBuffer;
use tcpip::Error;
use tcpip::NetworkProtocolNumber;
use tcpip::NicId;

use crate::addresses::AddressRef;

/// Outcome of resolving a route's remote link address.
pub enum ResolveOutcome {
    /// The route is ready to use.
    Done,
    /// Resolution is in flight; the channel yields the result.
    WouldBlock(oneshot::Receiver<ResolutionResult>),
}

/// A path toward `remote_address`, bound to one NIC.
pub struct Route {
    /// Network protocol of the addresses.
    pub net_proto: NetworkProtocolNumber,
    /// Source address (destination, for inbound delivery routes).
    pub local_address: IpAddress,
    /// Destination address (source, for inbound delivery routes).
    pub remote_address: IpAddress,
    /// Link address of the bound NIC.
    pub local_link_address: EthernetAddress,
    /// Link address of the remote, once known.
    pub remote_link_address: Option<EthernetAddress>,
    /// Next hop, when the destination is not on-link.
    pub next_hop: Option<IpAddress>,
    nic: Arc<Nic>,
    // Keeps the local address endpoint alive; dropped with the route.
    addr_ref: Option<AddressRef>,
}

impl Route {
    pub(crate) fn new(
        net_proto: NetworkProtocolNumber,
        local_address: IpAddress,
        remote_address: IpAddress,
        next_hop: Option<IpAddress>,
        nic: Arc<Nic>,
        addr_ref: Option<AddressRef>,
    ) -> Self {
        let local_link_address = nic.link_address();
        Self {
            net_proto,
            local_address,
            remote_address,
            local_link_address,
            remote_link_address: None,
            next_hop,
            nic,
            addr_ref,
        }
    }

    // An inbound delivery route: local is the packet's destination, remote
    // its source, and the remote link address is the frame's.
    pub(crate) fn for_local_delivery(
        net_proto: NetworkProtocolNumber,
        dst: IpAddress,
        src: IpAddress,
        remote_link: EthernetAddress,
        nic: Arc<Nic>,
        addr_ref: AddressRef,
    ) -> Self {
        let local_link_address = nic.link_address();
        Self {
            net_proto,
            local_address: dst,
            remote_address: src,
            local_link_address,
            remote_link_address: Some(remote_link),
            next_hop: None,
            nic,
            addr_ref: Some(addr_ref),
        }
    }

    /// The NIC this route egresses (or was received on).
    pub fn nic_id(&self) -> NicId {
        self.nic.id()
    }

    pub(crate) fn nic(&self) -> &Arc<Nic> {
        &self.nic
    }

    /// The address endpoint backing the route's local address, if any.
    pub fn address_ref(&self) -> Option<&AddressRef> {
        self.addr_ref.as_ref()
    }

    /// Whether the link requires a resolved remote link address that this
    /// route does not have yet.
    pub fn is_resolution_required(&self) -> bool {
        self.nic.resolution_required() && self.remote_link_address.is_none()
    }

    /// Resolves the remote link address.
    ///
    /// Multicast and broadcast destinations map statically; unicast
    /// destinations go through the NIC's neighbor cache and may return
    /// [`ResolveOutcome::WouldBlock`] with the resolution channel.
    pub fn resolve(&mut self) -> Result<ResolveOutcome, Error> {
        if !self.is_resolution_required() {
            return Ok(ResolveOutcome::Done);
        }
        let next_hop = self.next_hop.unwrap_or(self.remote_address);
        if let Some(link) = ethernet_multicast(&next_hop) {
            self.remote_link_address = Some(link);
            return Ok(ResolveOutcome::Done);
        }
        match self
            .nic
            .resolve_link_address(self.net_proto, next_hop, Some(self.local_address))?
        {
            LinkResolution::Resolved(link) => {
                self.remote_link_address = Some(link);
                Ok(ResolveOutcome::Done)
            }
            LinkResolution::Pending(rx) => Ok(ResolveOutcome::WouldBlock(rx)),
        }
    }

    /// Writes `pkt` (positioned at its network header, with link headroom
    /// reserved) out this route's NIC. The route must be resolved.
    pub fn write_packet(&self, pkt: PacketBuffer) -> Result<(), Error> {
        if self.is_resolution_required() {
            return Err(Error::WouldBlock);
        }
        let remote_link = self
            .remote_link_address
            .unwrap_or(EthernetAddress([0; 6]));
        self.nic
            .write_link_packet(self.local_link_address, remote_link, self.net_proto, pkt)
    }
}

/// Static link-address mappings: IPv4 multicast and broadcast (RFC 1112),
/// IPv6 multicast (RFC 2464).
pub(crate) fn ethernet_multicast(addr: &IpAddress) -> Option<EthernetAddress> {
    match addr {
        IpAddress::Ipv4(v4) => {
            if v4.is_broadcast() {
                Some(EthernetAddress::BROADCAST)
            } else if v4.is_multicast() {
                let o = v4.octets();
                Some(EthernetAddress([
                    0x01,
                    0x00,
                    0x5e,
                    o[1] & 0x7f,
                    o[2],
                    o[3],
                ]))
            } else {
                None
            }
        }
        IpAddress::Ipv6(v6) => {
            if v6.is_multicast() {
                let o = v6.octets();
                Some(EthernetAddress([0x33, 0x33, o[12], o[13], o[14], o[15]]))
            } else {
                None
            }
        }
    }
}
