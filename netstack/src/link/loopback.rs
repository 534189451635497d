// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The loopback link: written packets are redispatched to the attached NIC
//! on the caller's stack.

use crate::link::LinkCapabilities;
use crate::link::LinkEndpoint;
use crate::link::NetworkDispatcher;
use parking_lot::RwLock;
use smoltcp::wire::EthernetAddress;
use std::sync::Arc;
use tcpip::buffer::PacketBuffer;
use tcpip::Error;
use tcpip::NetworkProtocolNumber;

/// A loopback link endpoint.
pub struct LoopbackEndpoint {
    mtu: u32,
    dispatcher: RwLock<Option<Arc<dyn NetworkDispatcher>>>,
}

impl LoopbackEndpoint {
    /// Creates a loopback endpoint with the given MTU.
    pub fn new(mtu: u32) -> Arc<Self> {
        Arc::new(Self {
            mtu,
            dispatcher: RwLock::new(None),
        })
    }
}

impl LinkEndpoint for LoopbackEndpoint {
    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities {
            loopback: true,
            resolution_required: false,
        }
    }

    fn max_header_length(&self) -> usize {
        0
    }

    fn link_address(&self) -> EthernetAddress {
        EthernetAddress([0; 6])
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
        _remote_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) -> Result<(), Error> {
        let dispatcher = self.dispatcher.read().clone();
        if let Some(dispatcher) = dispatcher {
            dispatcher.deliver_network_packet(local_link, local_link, proto, pkt);
        }
        Ok(())
    }

    fn add_header(
        &self,
        _local_link: EthernetAddress,
        _remote_link: EthernetAddress,
        _proto: NetworkProtocolNumber,
        _pkt: &mut PacketBuffer,
    ) {
    }
}
