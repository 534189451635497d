// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The link-layer trait surface and the in-memory link endpoints.
//!
//! A [`LinkEndpoint`] is the device side of a NIC. The NIC registers itself
//! as the link's [`NetworkDispatcher`] at attach time; the link calls the
//! dispatcher serially for each received frame.

pub mod channel;
pub mod loopback;

use smoltcp::wire::EthernetAddress;
use std::sync::Arc;
use tcpip::buffer::PacketBuffer;
use tcpip::Error;
use tcpip::NetworkProtocolNumber;

/// Capabilities a link advertises to its NIC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCapabilities {
    /// The link loops written packets back to the dispatcher.
    pub loopback: bool,
    /// Remote link addresses must be resolved (via ARP/NDP) before
    /// transmission.
    pub resolution_required: bool,
}

/// Receiver of inbound frames; implemented by the NIC.
pub trait NetworkDispatcher: Send + Sync {
    /// Delivers one inbound frame. `local_link` may be the all-zero address
    /// when the link did not capture it; the NIC substitutes its own.
    fn deliver_network_packet(
        &self,
        remote_link: EthernetAddress,
        local_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    );
}

/// A link-layer device driver.
pub trait LinkEndpoint: Send + Sync {
    /// Maximum transmission unit, in bytes, excluding link headers.
    fn mtu(&self) -> u32;

    /// The link's capabilities.
    fn capabilities(&self) -> LinkCapabilities;

    /// Headroom a packet needs for this link's headers.
    fn max_header_length(&self) -> usize;

    /// The link-layer address of this endpoint.
    fn link_address(&self) -> EthernetAddress;

    /// Attaches (or, with `None`, detaches) the dispatcher inbound frames
    /// are delivered to.
    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>);

    /// True while a dispatcher is attached.
    fn is_attached(&self) -> bool;

    /// Writes a packet out the link. The packet starts at its network
    /// header; link headers are the endpoint's business.
    fn write_packet(
        &self,
        local_link: EthernetAddress,
        remote_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) -> Result<(), Error>;

    /// Synthesizes this link's header onto the front of `pkt`, for
    /// packet-socket observation of outbound frames.
    fn add_header(
        &self,
        local_link: EthernetAddress,
        remote_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: &mut PacketBuffer,
    );
}
