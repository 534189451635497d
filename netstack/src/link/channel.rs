// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A queue-backed link endpoint.
//!
//! Written packets land in a queue the owner drains; inbound frames are
//! injected explicitly. Tests use this as their packet tap, and embedders
//! can bridge it to a real device loop.

use crate::link::LinkCapabilities;
use crate::link::LinkEndpoint;
use crate::link::NetworkDispatcher;
use parking_lot::Mutex;
use parking_lot::RwLock;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::ETHERNET_HEADER_LEN;
use std::collections::VecDeque;
use std::sync::Arc;
use tcpip::buffer::PacketBuffer;
use tcpip::Error;
use tcpip::NetworkProtocolNumber;

/// A packet written out a [`ChannelEndpoint`].
#[derive(Debug)]
pub struct WrittenPacket {
    /// Source link address the NIC chose.
    pub local_link: EthernetAddress,
    /// Destination link address the NIC resolved.
    pub remote_link: EthernetAddress,
    /// Ethertype.
    pub proto: NetworkProtocolNumber,
    /// The packet, starting at its network header.
    pub pkt: PacketBuffer,
}

/// An in-memory link endpoint backed by a write queue.
pub struct ChannelEndpoint {
    mtu: u32,
    link_addr: EthernetAddress,
    capabilities: LinkCapabilities,
    dispatcher: RwLock<Option<Arc<dyn NetworkDispatcher>>>,
    queue: Mutex<VecDeque<WrittenPacket>>,
}

impl ChannelEndpoint {
    /// Creates an endpoint with the given MTU, link address, and
    /// capabilities.
    pub fn new(mtu: u32, link_addr: EthernetAddress, capabilities: LinkCapabilities) -> Arc<Self> {
        Arc::new(Self {
            mtu,
            link_addr,
            capabilities,
            dispatcher: RwLock::new(None),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Pops the oldest written packet, if any.
    pub fn pop(&self) -> Option<WrittenPacket> {
        self.queue.lock().pop_front()
    }

    /// Drains every written packet.
    pub fn drain(&self) -> Vec<WrittenPacket> {
        self.queue.lock().drain(..).collect()
    }

    /// Number of packets waiting in the write queue.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Injects an inbound frame, as if the device had received it.
    pub fn inject(
        &self,
        remote_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) {
        self.inject_with_destination(remote_link, self.link_addr, proto, pkt)
    }

    /// Injects an inbound frame with an explicit destination link address
    /// (e.g. a multicast MAC).
    pub fn inject_with_destination(
        &self,
        remote_link: EthernetAddress,
        local_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) {
        let dispatcher = self.dispatcher.read().clone();
        if let Some(dispatcher) = dispatcher {
            dispatcher.deliver_network_packet(remote_link, local_link, proto, pkt);
        }
    }
}

impl LinkEndpoint for ChannelEndpoint {
    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn capabilities(&self) -> LinkCapabilities {
        self.capabilities
    }

    fn max_header_length(&self) -> usize {
        ETHERNET_HEADER_LEN
    }

    fn link_address(&self) -> EthernetAddress {
        self.link_addr
    }

    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        *self.dispatcher.write() = dispatcher;
    }

    fn is_attached(&self) -> bool {
        self.dispatcher.read().is_some()
    }

    fn write_packet(
        &self,
        local_link: EthernetAddress,
        remote_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) -> Result<(), Error> {
        self.queue.lock().push_back(WrittenPacket {
            local_link,
            remote_link,
            proto,
            pkt,
        });
        Ok(())
    }

    fn add_header(
        &self,
        local_link: EthernetAddress,
        remote_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: &mut PacketBuffer,
    ) {
        let Some(buf) = pkt.prepend(ETHERNET_HEADER_LEN) else {
            return;
        };
        let mut frame = EthernetFrame::new_unchecked(buf);
        EthernetRepr {
            src_addr: local_link,
            dst_addr: remote_link,
            ethertype: EthernetProtocol::from(proto),
        }
        .emit(&mut frame);
    }
}
