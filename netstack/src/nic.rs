// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-interface NIC object.
//!
//! A NIC binds one [`LinkEndpoint`] to the network engines registered on
//! its stack. It owns the interface's addresses (through the per-protocol
//! endpoints), the packet-socket registry, the optional neighbor cache, and
//! the interface's NDP state, and implements the receive pipeline: enable
//! gate, counters, packet-socket fan-out, parse, local delivery or
//! forwarding.
//!
//! Locking: `state` is the single readers-writer lock of the interface.
//! Address tables and the neighbor cache have their own locks, acquired
//! under (never around) the NIC lock. Packets are never written to the link
//! with the NIC lock held.

use crate::addresses::AddressKind;
use crate::addresses::AddressProperties;
use crate::addresses::AddressRef;
use crate::addresses::PrimaryEndpointBehavior;
use crate::ipv6::is_link_local;
use crate::ipv6::is_unicast;
use crate::link::LinkEndpoint;
use crate::link::NetworkDispatcher;
use crate::ndp::Ndp;
use crate::ndp::NdpDispatcher;
use crate::neighbor::NeighborCache;
use crate::neighbor::NeighborEntry;
use crate::neighbor::ProbeTimeout;
use crate::neighbor::ResolutionResult;
use crate::neighbor::ResolveResult;
use crate::neighbor::NEIGHBOR_CACHE_SIZE;
use crate::neighbor::PROBE_RETRANSMIT_INTERVAL;
use crate::protocol::ControlType;
use crate::protocol::NetworkEndpoint;
use crate::protocol::PacketEndpoint;
use crate::protocol::PacketType;
use crate::protocol::TransportEndpointId;
use crate::route::ResolveOutcome;
use crate::route::Route;
use crate::stack::Stack;
use futures::channel::oneshot;
use parking_lot::RwLock;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpCidr;
use std::any::Any;
use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::sync::Weak;
use std::task::Waker;
use tcpip::buffer::PacketBuffer;
use tcpip::stats::NicStats;
use tcpip::time::Duration;
use tcpip::time::TimerHandle;
use tcpip::Error;
use tcpip::NetworkProtocolNumber;
use tcpip::NicId;
use tcpip::TransportProtocolNumber;
use tcpip::ETHERNET_PROTOCOL_ALL;
use tcpip::IPV4_PROTOCOL_NUMBER;
use tcpip::IPV6_PROTOCOL_NUMBER;

const ICMPV4_PROTOCOL_NUMBER: TransportProtocolNumber = 1;
const ICMPV6_PROTOCOL_NUMBER: TransportProtocolNumber = 58;

/// Mutable interface state guarded by the NIC lock.
pub(crate) struct NicState {
    pub(crate) enabled: bool,
    pub(crate) promiscuous: bool,
    pub(crate) spoofing: bool,
    pub(crate) packet_eps: HashMap<NetworkProtocolNumber, Vec<Arc<dyn PacketEndpoint>>>,
    pub(crate) ndp: Ndp,
}

/// Outcome of a link-address resolution request.
pub(crate) enum LinkResolution {
    Resolved(EthernetAddress),
    Pending(oneshot::Receiver<ResolutionResult>),
}

/// A network interface.
pub struct Nic {
    id: NicId,
    name: String,
    stack: Weak<Stack>,
    self_ref: Weak<Nic>,
    link: Arc<dyn LinkEndpoint>,
    context: Option<Box<dyn Any + Send + Sync>>,
    // Installed at construction, at most one endpoint per protocol, never
    // mutated afterwards.
    network_endpoints: HashMap<NetworkProtocolNumber, Arc<dyn NetworkEndpoint>>,
    neighbor: Option<NeighborCache>,
    stats: NicStats,
    pub(crate) state: RwLock<NicState>,
}

impl Nic {
    pub(crate) fn new(
        stack: &Arc<Stack>,
        id: NicId,
        name: String,
        link: Arc<dyn LinkEndpoint>,
        context: Option<Box<dyn Any + Send + Sync>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref: &Weak<Nic>| {
            let mut network_endpoints = HashMap::new();
            let mut packet_eps = HashMap::new();
            packet_eps.insert(ETHERNET_PROTOCOL_ALL, Vec::new());
            for proto in stack.network_protocols() {
                network_endpoints.insert(proto.number(), proto.new_endpoint(self_ref.clone()));
                packet_eps.insert(proto.number(), Vec::new());
            }
            let neighbor = (link.capabilities().resolution_required
                && stack.use_neighbor_cache()
                && stack.has_link_address_resolvers())
                .then(|| NeighborCache::new(NEIGHBOR_CACHE_SIZE));
            Nic {
                id,
                name,
                stack: Arc::downgrade(stack),
                self_ref: self_ref.clone(),
                link,
                context,
                network_endpoints,
                neighbor,
                stats: NicStats::default(),
                state: RwLock::new(NicState {
                    enabled: false,
                    promiscuous: false,
                    spoofing: false,
                    packet_eps,
                    ndp: Ndp::default(),
                }),
            }
        })
    }

    /// The interface id.
    pub fn id(&self) -> NicId {
        self.id
    }

    /// The interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The opaque context supplied at creation.
    pub fn context(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.context.as_deref()
    }

    /// Receive/transmit counters.
    pub fn stats(&self) -> &NicStats {
        &self.stats
    }

    /// Whether the interface is enabled.
    pub fn enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub(crate) fn stack(&self) -> Option<Arc<Stack>> {
        self.stack.upgrade()
    }

    pub(crate) fn link_address(&self) -> EthernetAddress {
        self.link.link_address()
    }

    pub(crate) fn max_header_length(&self) -> usize {
        self.link.max_header_length()
    }

    pub(crate) fn is_loopback(&self) -> bool {
        self.link.capabilities().loopback
    }

    pub(crate) fn resolution_required(&self) -> bool {
        self.link.capabilities().resolution_required
    }

    pub(crate) fn endpoint(
        &self,
        proto: NetworkProtocolNumber,
    ) -> Option<Arc<dyn NetworkEndpoint>> {
        self.network_endpoints.get(&proto).cloned()
    }

    pub(crate) fn ipv6_endpoint(&self) -> Option<Arc<dyn NetworkEndpoint>> {
        self.endpoint(IPV6_PROTOCOL_NUMBER)
    }

    pub(crate) fn attach_link(self: &Arc<Self>) {
        self.link
            .attach(Some(self.clone() as Arc<dyn NetworkDispatcher>));
    }

    pub(crate) fn ndp_dispatcher(&self) -> Option<Arc<dyn NdpDispatcher>> {
        self.stack().and_then(|s| s.ndp_dispatcher())
    }

    pub(crate) fn count_malformed(&self) {
        if let Some(stack) = self.stack() {
            stack.stats().malformed_rcvd_packets.increment();
        }
    }

    // Schedules `f` against this NIC on the stack's timer queue. The
    // callback runs with no NIC lock held.
    pub(crate) fn schedule_nic_timer(
        self: &Arc<Self>,
        delay: Duration,
        f: impl FnOnce(Arc<Nic>) + Send + 'static,
    ) -> Option<TimerHandle> {
        let stack = self.stack()?;
        let weak = Arc::downgrade(self);
        Some(stack.schedule_timer(delay, move || {
            if let Some(nic) = weak.upgrade() {
                f(nic);
            }
        }))
    }

    // A permanent link-local IPv6 source, for router solicitations and NDP
    // probes.
    pub(crate) fn ipv6_link_local_source(&self) -> Option<Ipv6Addr> {
        let ep = self.ipv6_endpoint()?;
        for cidr in ep.all_addresses() {
            let IpAddress::Ipv6(addr) = cidr.address() else {
                continue;
            };
            if !is_link_local(&addr) {
                continue;
            }
            if let Some(r) = ep.get_endpoint(cidr.address()) {
                if r.kind() == AddressKind::Permanent {
                    return Some(addr);
                }
            }
        }
        None
    }

    // A usable IPv6 source address for resolution probes: link-local
    // preferred, then any primary.
    pub(crate) fn ipv6_source_for_probe(&self) -> Option<Ipv6Addr> {
        if let Some(addr) = self.ipv6_link_local_source() {
            return Some(addr);
        }
        let ep = self.ipv6_endpoint()?;
        let r = ep.primary_endpoint(None, false)?;
        match r.address() {
            IpAddress::Ipv6(addr) => Some(addr),
            IpAddress::Ipv4(_) => None,
        }
    }

    // ---- Lifecycle: Disabled -> Enabled -> Disabled -> Removed ----

    /// Enables the interface: network endpoints come up, tentative IPv6
    /// addresses (re)start DAD, the link-local address is auto-generated,
    /// and router solicitation begins in host mode. Idempotent.
    pub fn enable(self: &Arc<Self>) -> Result<(), Error> {
        let Some(stack) = self.stack() else {
            return Err(Error::InvalidEndpointState);
        };
        let mut out = Vec::new();
        {
            let mut state = self.state.write();
            if state.enabled {
                return Ok(());
            }
            state.enabled = true;
            for ep in self.network_endpoints.values() {
                ep.enable();
            }
            if let Some(ep) = self.ipv6_endpoint() {
                for cidr in ep.all_addresses() {
                    let IpAddress::Ipv6(addr) = cidr.address() else {
                        continue;
                    };
                    if !is_unicast(&addr) {
                        continue;
                    }
                    let Some(r) = ep.get_endpoint(cidr.address()) else {
                        continue;
                    };
                    match r.kind() {
                        AddressKind::Permanent | AddressKind::PermanentTentative => {
                            r.set_kind(AddressKind::PermanentTentative);
                            drop(r);
                            self.start_dad_locked(&mut state, addr, &mut out);
                        }
                        _ => {}
                    }
                }
                if stack.auto_gen_ipv6_link_local() && !self.is_loopback() {
                    self.do_link_local_slaac_locked(&mut state, &mut out);
                }
                if !stack.forwarding() {
                    self.start_soliciting_routers_locked(&mut state);
                }
            }
        }
        self.transmit_ndp(out);
        Ok(())
    }

    /// Disables the interface, cancelling router solicitation and DAD and
    /// invalidating discovered NDP state. Idempotent.
    pub fn disable(self: &Arc<Self>) {
        let mut state = self.state.write();
        self.disable_locked(&mut state);
    }

    fn disable_locked(self: &Arc<Self>, state: &mut NicState) {
        if !state.enabled {
            return;
        }
        if self.ipv6_endpoint().is_some() {
            self.stop_soliciting_routers_locked(state);
            self.cleanup_ndp_state_locked(state, false);
        }
        for ep in self.network_endpoints.values() {
            ep.disable();
        }
        state.enabled = false;
    }

    /// Tears the interface down: disable, leave every group, remove every
    /// address, close endpoints, and detach from the link. The first error
    /// is reported but teardown always runs to completion.
    pub(crate) fn remove(self: &Arc<Self>) -> Result<(), Error> {
        self.disable();
        let mut first_err = Ok(());
        let mut record = |res: Result<(), Error>| {
            if let Err(e) = res {
                if first_err.is_ok() {
                    first_err = Err(e);
                }
            }
        };
        for ep in self.network_endpoints.values() {
            if let Some(group_ep) = ep.as_group_endpoint() {
                record(group_ep.leave_all_groups());
            }
        }
        {
            let mut state = self.state.write();
            let mut out = Vec::new();
            for ep in self.network_endpoints.values() {
                for cidr in ep.all_addresses() {
                    let Some(r) = ep.get_endpoint(cidr.address()) else {
                        continue;
                    };
                    let removable = matches!(
                        r.kind(),
                        AddressKind::Permanent | AddressKind::PermanentTentative
                    );
                    drop(r);
                    if !removable {
                        continue;
                    }
                    match cidr.address() {
                        IpAddress::Ipv6(addr) if is_unicast(&addr) => {
                            record(self.remove_permanent_ipv6_address_locked(
                                &mut state, addr, false, &mut out,
                            ));
                        }
                        addr => record(ep.remove_address(addr)),
                    }
                }
            }
            // The interface is disabled; nothing is emitted.
            drop(out);
        }
        for ep in self.network_endpoints.values() {
            ep.close();
        }
        self.link.attach(None);
        first_err
    }

    // ---- Addresses ----

    pub(crate) fn add_address(
        self: &Arc<Self>,
        proto: NetworkProtocolNumber,
        addr: IpCidr,
        peb: PrimaryEndpointBehavior,
    ) -> Result<(), Error> {
        let ep = self
            .network_endpoints
            .get(&proto)
            .ok_or(Error::UnknownProtocol)?;
        let mut out = Vec::new();
        {
            let mut state = self.state.write();
            let v6_unicast = match addr.address() {
                IpAddress::Ipv6(a) if is_unicast(&a) => Some(a),
                _ => None,
            };
            // IPv6 unicast addresses are tentative until DAD passes.
            let kind = if v6_unicast.is_some() {
                AddressKind::PermanentTentative
            } else {
                AddressKind::Permanent
            };
            let r = ep.add_address(
                addr,
                AddressProperties {
                    peb,
                    kind,
                    ..Default::default()
                },
            )?;
            drop(r);
            if let Some(a) = v6_unicast {
                if state.enabled {
                    self.start_dad_locked(&mut state, a, &mut out);
                }
            }
        }
        self.transmit_ndp(out);
        Ok(())
    }

    pub(crate) fn remove_address(self: &Arc<Self>, addr: IpAddress) -> Result<(), Error> {
        let mut out = Vec::new();
        let res = {
            let mut state = self.state.write();
            match addr {
                IpAddress::Ipv6(a) if is_unicast(&a) && self.ipv6_endpoint().is_some() => {
                    self.remove_permanent_ipv6_address_locked(&mut state, a, false, &mut out)
                }
                addr => {
                    let mut res = Err(Error::BadLocalAddress);
                    for ep in self.network_endpoints.values() {
                        if ep.get_endpoint(addr).is_some() {
                            res = ep.remove_address(addr);
                            break;
                        }
                    }
                    res
                }
            }
        };
        self.transmit_ndp(out);
        res
    }

    /// Every address assigned on this interface, keyed by protocol.
    pub fn all_addresses(&self) -> Vec<(NetworkProtocolNumber, IpCidr)> {
        let mut addrs = Vec::new();
        for (proto, ep) in &self.network_endpoints {
            addrs.extend(ep.all_addresses().into_iter().map(|c| (*proto, c)));
        }
        addrs
    }

    /// The primary address for `proto`, if one is assigned and usable.
    pub fn primary_address(&self, proto: NetworkProtocolNumber) -> Option<IpCidr> {
        self.network_endpoints
            .get(&proto)?
            .primary_endpoint(None, false)
            .map(|r| r.address_with_prefix())
    }

    pub(crate) fn set_promiscuous(&self, enable: bool) {
        self.state.write().promiscuous = enable;
    }

    pub(crate) fn set_spoofing(&self, enable: bool) {
        self.state.write().spoofing = enable;
    }

    /// Whether `r` may source outgoing traffic from this NIC right now.
    pub(crate) fn is_valid_for_outgoing(&self, r: &AddressRef) -> bool {
        let state = self.state.read();
        state.enabled && r.is_assigned(state.spoofing)
    }

    pub(crate) fn primary_endpoint_for(
        &self,
        proto: NetworkProtocolNumber,
        remote: Option<IpAddress>,
    ) -> Option<AddressRef> {
        let spoofing = self.state.read().spoofing;
        self.network_endpoints
            .get(&proto)?
            .primary_endpoint(remote, spoofing)
    }

    pub(crate) fn get_assigned_for_outgoing(
        &self,
        proto: NetworkProtocolNumber,
        addr: IpAddress,
    ) -> Option<AddressRef> {
        let spoofing = self.state.read().spoofing;
        self.network_endpoints.get(&proto)?.get_assigned_endpoint(
            addr,
            spoofing,
            PrimaryEndpointBehavior::CanBePrimary,
        )
    }

    // ---- Groups ----

    pub(crate) fn join_group(
        &self,
        proto: NetworkProtocolNumber,
        addr: IpAddress,
    ) -> Result<(), Error> {
        let ep = self
            .network_endpoints
            .get(&proto)
            .ok_or(Error::UnknownProtocol)?;
        let group_ep = ep.as_group_endpoint().ok_or(Error::NotSupported)?;
        group_ep.join_group(addr).map(|_| ())
    }

    pub(crate) fn leave_group(
        &self,
        proto: NetworkProtocolNumber,
        addr: IpAddress,
    ) -> Result<(), Error> {
        let ep = self
            .network_endpoints
            .get(&proto)
            .ok_or(Error::UnknownProtocol)?;
        let group_ep = ep.as_group_endpoint().ok_or(Error::NotSupported)?;
        group_ep.leave_group(addr, false).map(|_| ())
    }

    pub(crate) fn is_in_group(&self, addr: IpAddress) -> bool {
        self.network_endpoints.values().any(|ep| {
            ep.as_group_endpoint()
                .is_some_and(|g| g.is_in_group(addr))
        })
    }

    // ---- Packet sockets ----

    pub(crate) fn register_packet_endpoint(
        &self,
        proto: NetworkProtocolNumber,
        ep: Arc<dyn PacketEndpoint>,
    ) -> Result<(), Error> {
        let mut state = self.state.write();
        let list = state.packet_eps.get_mut(&proto).ok_or(Error::NotSupported)?;
        list.push(ep);
        Ok(())
    }

    /// Unregistration is idempotent; unknown endpoints are ignored.
    pub(crate) fn unregister_packet_endpoint(
        &self,
        proto: NetworkProtocolNumber,
        ep: &Arc<dyn PacketEndpoint>,
    ) {
        let mut state = self.state.write();
        if let Some(list) = state.packet_eps.get_mut(&proto) {
            list.retain(|e| !Arc::ptr_eq(e, ep));
        }
    }

    // ---- Neighbors ----

    fn neighbor_cache(&self) -> Result<&NeighborCache, Error> {
        self.neighbor.as_ref().ok_or(Error::NotSupported)
    }

    /// Snapshots the neighbor table.
    pub fn neighbors(&self) -> Result<Vec<NeighborEntry>, Error> {
        Ok(self.neighbor_cache()?.entries())
    }

    /// Installs a static neighbor entry, completing any pending resolution
    /// for that address.
    pub fn add_static_neighbor(&self, addr: IpAddr, link: EthernetAddress) -> Result<(), Error> {
        let completion = self.neighbor_cache()?.add_static_entry(addr, link);
        completion.complete(Ok(link));
        if let Some(stack) = self.stack() {
            stack.process_forwarder();
        }
        Ok(())
    }

    /// Removes a neighbor entry; pending waiters observe a failure.
    pub fn remove_neighbor(&self, addr: IpAddr) -> Result<(), Error> {
        let completion = self.neighbor_cache()?.remove_entry(addr)?;
        completion.complete(Err(Error::BadAddress));
        if let Some(stack) = self.stack() {
            stack.process_forwarder();
        }
        Ok(())
    }

    /// Clears the neighbor table.
    pub fn clear_neighbors(&self) -> Result<(), Error> {
        for completion in self.neighbor_cache()?.clear() {
            completion.complete(Err(Error::BadAddress));
        }
        if let Some(stack) = self.stack() {
            stack.process_forwarder();
        }
        Ok(())
    }

    /// Registers a waker for resolution of `addr`.
    pub fn add_neighbor_waker(&self, addr: IpAddr, waker: &Waker) -> Result<(), Error> {
        self.neighbor_cache()?.add_waker(addr, waker);
        Ok(())
    }

    /// Drops a previously registered waker.
    pub fn remove_neighbor_waker(&self, addr: IpAddr, waker: &Waker) -> Result<(), Error> {
        self.neighbor_cache()?.remove_waker(addr, waker);
        Ok(())
    }

    pub(crate) fn resolve_link_address(
        self: &Arc<Self>,
        proto: NetworkProtocolNumber,
        target: IpAddress,
        local: Option<IpAddress>,
    ) -> Result<LinkResolution, Error> {
        let stack = self.stack().ok_or(Error::InvalidEndpointState)?;
        let resolver = stack
            .link_address_resolver(proto)
            .ok_or(Error::NotSupported)?;
        if let Some(link) = resolver.resolve_static_address(target) {
            return Ok(LinkResolution::Resolved(link));
        }
        let cache = self.neighbor_cache()?;
        match cache.resolve(ip_key(&target)) {
            ResolveResult::Ready(link) => Ok(LinkResolution::Resolved(link)),
            ResolveResult::Pending { rx, new_probe } => {
                if new_probe {
                    if let Err(err) = resolver.link_address_request(target, local, self) {
                        tracing::debug!(nic = %self.id, %target, error = %err, "link address probe failed");
                    }
                    self.arm_neighbor_probe_timer(proto, target, local);
                }
                Ok(LinkResolution::Pending(rx))
            }
        }
    }

    fn arm_neighbor_probe_timer(
        self: &Arc<Self>,
        proto: NetworkProtocolNumber,
        target: IpAddress,
        local: Option<IpAddress>,
    ) {
        let Some(cache) = self.neighbor.as_ref() else {
            return;
        };
        let timer = self.schedule_nic_timer(PROBE_RETRANSMIT_INTERVAL, move |nic| {
            nic.neighbor_probe_timeout(proto, target, local)
        });
        if let Some(timer) = timer {
            cache.set_probe_timer(ip_key(&target), timer);
        }
    }

    fn neighbor_probe_timeout(
        self: Arc<Self>,
        proto: NetworkProtocolNumber,
        target: IpAddress,
        local: Option<IpAddress>,
    ) {
        let Some(cache) = self.neighbor.as_ref() else {
            return;
        };
        match cache.probe_timeout(ip_key(&target)) {
            Some(ProbeTimeout::Retransmit) => {
                if let Some(stack) = self.stack() {
                    if let Some(resolver) = stack.link_address_resolver(proto) {
                        let _ = resolver.link_address_request(target, local, &self);
                    }
                }
                self.arm_neighbor_probe_timer(proto, target, local);
            }
            Some(ProbeTimeout::Failed(completion)) => {
                tracing::debug!(nic = %self.id, %target, "link address resolution failed");
                completion.complete(Err(Error::BadAddress));
                if let Some(stack) = self.stack() {
                    stack.process_forwarder();
                }
            }
            None => {}
        }
    }

    /// Feeds a confirmed (network, link) address pair into the neighbor
    /// cache and lets the forwarder retry anything that was waiting on it.
    pub(crate) fn handle_neighbor_confirmation(&self, addr: IpAddr, link: EthernetAddress) {
        let Some(cache) = &self.neighbor else { return };
        let completion = cache.handle_confirmation(addr, link);
        completion.complete(Ok(link));
        if let Some(stack) = self.stack() {
            stack.process_forwarder();
        }
    }

    // ---- Egress ----

    /// Copies a routed packet into fresh headroom and writes it out the
    /// link, counting errors against the stack's IP stats.
    ///
    /// TTL/hop-limit decrement is the network endpoint's obligation on the
    /// forwarded route; it does not happen here.
    pub(crate) fn forward_packet(
        &self,
        route: &Route,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) {
        let out = PacketBuffer::with_headroom(self.max_header_length(), pkt.as_slice());
        let remote = route
            .remote_link_address
            .unwrap_or(EthernetAddress([0; 6]));
        if self
            .write_link_packet(route.local_link_address, remote, proto, out)
            .is_err()
        {
            if let Some(stack) = self.stack() {
                stack.stats().ip.outgoing_packet_errors.increment();
            }
        }
    }

    /// Writes one packet out the link, after outbound packet-socket
    /// fan-out, and maintains transmit counters.
    pub(crate) fn write_link_packet(
        &self,
        local_link: EthernetAddress,
        remote_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) -> Result<(), Error> {
        self.deliver_outbound_packet(local_link, remote_link, proto, &pkt);
        let len = pkt.len() as u64;
        self.link.write_packet(local_link, remote_link, proto, pkt)?;
        self.stats.tx.packets.increment();
        self.stats.tx.bytes.add(len);
        if proto == IPV4_PROTOCOL_NUMBER || proto == IPV6_PROTOCOL_NUMBER {
            if let Some(stack) = self.stack() {
                stack.stats().ip.packets_sent.increment();
            }
        }
        Ok(())
    }

    // Outbound packet sockets: only "all" subscribers see egress, with the
    // link header synthesized into their clone.
    fn deliver_outbound_packet(
        &self,
        local_link: EthernetAddress,
        remote_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        pkt: &PacketBuffer,
    ) {
        let eps = {
            let state = self.state.read();
            state
                .packet_eps
                .get(&ETHERNET_PROTOCOL_ALL)
                .cloned()
                .unwrap_or_default()
        };
        for ep in eps {
            let mut clone = pkt.clone();
            self.link.add_header(local_link, remote_link, proto, &mut clone);
            ep.handle_packet(self.id, local_link, proto, clone, PacketType::Outgoing);
        }
    }

    // ---- Transport delivery ----

    /// Delivers a parsed network packet to its transport protocol: raw
    /// sockets first, then the demultiplexer, the per-stack default
    /// handler, and the protocol's unknown-destination handler.
    pub(crate) fn deliver_transport_packet(
        &self,
        route: &Route,
        protocol: TransportProtocolNumber,
        mut pkt: PacketBuffer,
    ) {
        let Some(stack) = self.stack() else { return };
        let Some(transport) = stack.transport_protocol(protocol) else {
            stack.stats().unknown_protocol_rcvd_packets.increment();
            return;
        };
        stack.demux().deliver_raw_packet(protocol, route, &pkt);
        if !pkt.has_transport_header() {
            if protocol == ICMPV4_PROTOCOL_NUMBER || protocol == ICMPV6_PROTOCOL_NUMBER {
                // ICMP error payloads do not have a conventional header;
                // consume the fixed minimum.
                pkt.mark_transport_header(transport.minimum_packet_size());
            } else if !transport.parse(&mut pkt) {
                stack.stats().malformed_rcvd_packets.increment();
                return;
            }
        }
        let Some(header) = pkt.transport_header() else {
            stack.stats().malformed_rcvd_packets.increment();
            return;
        };
        if header.len() < transport.minimum_packet_size() {
            stack.stats().malformed_rcvd_packets.increment();
            return;
        }
        let Ok((src_port, dst_port)) = transport.parse_ports(header) else {
            stack.stats().malformed_rcvd_packets.increment();
            return;
        };
        let id = TransportEndpointId {
            local_port: dst_port,
            local_address: route.local_address,
            remote_port: src_port,
            remote_address: route.remote_address,
        };
        if stack.demux().deliver_packet(protocol, &id, route, &pkt) {
            return;
        }
        if let Some(handler) = stack.transport_default_handler(protocol) {
            if handler(&id, route, &pkt) {
                return;
            }
        }
        if transport.handle_unknown_destination_packet(route, &id, &pkt) {
            return;
        }
        stack.stats().malformed_rcvd_packets.increment();
    }

    /// Delivers a transport control (ICMP error) notification to the
    /// endpoint that sent the offending packet.
    pub(crate) fn deliver_transport_control_packet(
        &self,
        local: IpAddress,
        remote: IpAddress,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        typ: ControlType,
        extra: u32,
        pkt: &PacketBuffer,
    ) {
        let Some(stack) = self.stack() else { return };
        let Some(transport) = stack.transport_protocol(trans) else {
            return;
        };
        // The embedded payload's first eight bytes carry the ports
        // (guaranteed present by the ICMP minimum payload rules).
        let payload = pkt.as_slice();
        if payload.len() < 8 {
            return;
        }
        let Ok((src_port, dst_port)) = transport.parse_ports(&payload[..8]) else {
            return;
        };
        // The embedded packet is one we sent: its source is our local end.
        let id = TransportEndpointId {
            local_port: src_port,
            local_address: local,
            remote_port: dst_port,
            remote_address: remote,
        };
        stack
            .demux()
            .deliver_control_packet(net, trans, &id, typ, extra, pkt);
    }

    // ---- Forwarding ----

    fn forward_with_route(
        &self,
        stack: &Arc<Stack>,
        proto: NetworkProtocolNumber,
        src: IpAddress,
        dst: IpAddress,
        remote_link: EthernetAddress,
        pkt: PacketBuffer,
    ) {
        let Ok(mut route) = stack.find_route(None, None, dst, proto) else {
            stack
                .stats()
                .ip
                .invalid_destination_addresses_received
                .increment();
            return;
        };
        let target = route.nic().clone();
        // The destination may be an address assigned on the target NIC;
        // deliver it there instead of emitting.
        if let Some(ep) = target.endpoint(proto) {
            if let Some(r) =
                ep.get_assigned_endpoint(dst, false, PrimaryEndpointBehavior::NeverPrimary)
            {
                if target.is_valid_for_outgoing(&r) {
                    drop(route);
                    let delivery =
                        Route::for_local_delivery(proto, dst, src, remote_link, target, r);
                    ep.handle_packet(&delivery, pkt);
                    return;
                }
            }
        }
        match route.resolve() {
            Ok(ResolveOutcome::Done) => target.forward_packet(&route, proto, pkt),
            Ok(ResolveOutcome::WouldBlock(rx)) => {
                // Ownership of the route transfers to the forwarder, which
                // emits or drops once the channel signals.
                stack.enqueue_forward(rx, self.id, route, proto, pkt);
            }
            Err(_) => {
                // Unable to resolve; silently drop.
                stack.stats().dropped_packets.increment();
            }
        }
    }
}

impl NetworkDispatcher for Nic {
    fn deliver_network_packet(
        &self,
        remote_link: EthernetAddress,
        local_link: EthernetAddress,
        proto: NetworkProtocolNumber,
        mut pkt: PacketBuffer,
    ) {
        // Enable gate and packet-socket snapshot under one read lock.
        let (packet_eps, promiscuous) = {
            let state = self.state.read();
            if !state.enabled {
                self.stats.disabled_rx.packets.increment();
                self.stats.disabled_rx.bytes.add(pkt.len() as u64);
                return;
            }
            self.stats.rx.packets.increment();
            self.stats.rx.bytes.add(pkt.len() as u64);
            let mut eps: Vec<Arc<dyn PacketEndpoint>> = Vec::new();
            if let Some(list) = state.packet_eps.get(&proto) {
                eps.extend(list.iter().cloned());
            }
            if proto != ETHERNET_PROTOCOL_ALL {
                if let Some(list) = state.packet_eps.get(&ETHERNET_PROTOCOL_ALL) {
                    eps.extend(list.iter().cloned());
                }
            }
            (eps, state.promiscuous)
        };
        let Some(stack) = self.stack() else { return };
        let Some(this) = self.self_ref.upgrade() else { return };
        let Some(netproto) = stack.network_protocol(proto) else {
            stack.stats().unknown_protocol_rcvd_packets.increment();
            return;
        };
        let local_link = if local_link == EthernetAddress([0; 6]) {
            self.link.link_address()
        } else {
            local_link
        };
        let had_packet_sockets = !packet_eps.is_empty();
        for ep in &packet_eps {
            ep.handle_packet(self.id, local_link, proto, pkt.clone(), PacketType::Host);
        }
        if proto == IPV4_PROTOCOL_NUMBER || proto == IPV6_PROTOCOL_NUMBER {
            stack.stats().ip.packets_received.increment();
        }
        let parse = netproto.parse(&mut pkt);
        if !parse.ok {
            stack.stats().malformed_rcvd_packets.increment();
            return;
        }
        if parse.has_transport_header {
            // Best effort; the transport delivery path re-checks.
            if let Some(tp) = stack.transport_protocol(parse.transport_protocol) {
                let _ = tp.parse(&mut pkt);
            }
        }
        let Some((src, dst)) = netproto.parse_addresses(pkt.as_slice()) else {
            stack.stats().malformed_rcvd_packets.increment();
            return;
        };
        if stack.handle_local() && !self.is_loopback() && !src.is_unspecified() {
            if let Some(ep) = self.network_endpoints.get(&proto) {
                if ep.has_address(src) {
                    stack
                        .stats()
                        .ip
                        .invalid_source_addresses_received
                        .increment();
                    return;
                }
            }
        }
        // The filter hook is IPv4-only at this layer.
        if proto == IPV4_PROTOCOL_NUMBER && !self.is_loopback() {
            let preroute = self.primary_address(proto).map(|c| c.address());
            if !stack
                .filter()
                .check_prerouting(&mut pkt, preroute, &self.name)
            {
                return;
            }
        }
        if let Some(ep) = self.network_endpoints.get(&proto) {
            if let Some(r) =
                ep.get_assigned_endpoint(dst, promiscuous, PrimaryEndpointBehavior::CanBePrimary)
            {
                let route = Route::for_local_delivery(proto, dst, src, remote_link, this, r);
                ep.handle_packet(&route, pkt);
                return;
            }
        }
        if stack.forwarding() {
            self.forward_with_route(&stack, proto, src, dst, remote_link, pkt);
            return;
        }
        if !had_packet_sockets {
            stack
                .stats()
                .ip
                .invalid_destination_addresses_received
                .increment();
        }
    }
}

fn ip_key(addr: &IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(a) => IpAddr::V4(*a),
        IpAddress::Ipv6(a) => IpAddr::V6(*a),
    }
}

#[cfg(test)]
mod tests {
    use crate::addresses::AddressKind;
    use crate::addresses::PrimaryEndpointBehavior;
    use crate::link::loopback::LoopbackEndpoint;
    use crate::protocol::ControlType;
    use crate::protocol::PacketEndpoint;
    use crate::protocol::PacketType;
    use crate::protocol::TransportEndpointId;
    use crate::testutil::eth_link;
    use crate::testutil::ipv4_packet;
    use crate::testutil::mac;
    use crate::testutil::test_stack;
    use crate::testutil::RecordingPacketEndpoint;
    use crate::testutil::RecordingRawEndpoint;
    use crate::testutil::RecordingTransportEndpoint;
    use crate::testutil::FAKE_TRANSPORT_NUMBER;
    use smoltcp::wire::IpAddress;
    use smoltcp::wire::IpCidr;
    use smoltcp::wire::IpProtocol;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tcpip::Error;
    use tcpip::NicId;
    use tcpip::ETHERNET_PROTOCOL_ALL;
    use tcpip::IPV4_PROTOCOL_NUMBER;
    use tcpip::IPV6_PROTOCOL_NUMBER;

    const NIC: NicId = NicId(1);

    fn v4(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    fn v4cidr(addr: Ipv4Addr, len: u8) -> IpCidr {
        IpCidr::new(IpAddress::Ipv4(addr), len)
    }

    // An 8-byte fake-transport header: src port 7, dst port 9.
    fn transport_payload() -> Vec<u8> {
        vec![0, 7, 0, 9, 0, 0, 0, 0, 0xaa, 0xbb]
    }

    #[test]
    fn disabled_nic_only_counts() {
        let t = test_stack(|_| {});
        let link = eth_link(0x01);
        t.stack
            .create_nic_with_options(
                NIC,
                link.clone(),
                crate::stack::NicOptions {
                    name: "eth0".to_string(),
                    disabled: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let observer = Arc::new(RecordingPacketEndpoint::default());
        t.stack
            .register_packet_endpoint(
                NIC,
                ETHERNET_PROTOCOL_ALL,
                observer.clone() as Arc<dyn PacketEndpoint>,
            )
            .unwrap();
        let pkt = ipv4_packet(v4(10, 0, 0, 2), v4(10, 0, 0, 1), IpProtocol::Udp, &[]);
        let len = pkt.len() as u64;
        link.inject(mac(0x02), IPV4_PROTOCOL_NUMBER, pkt);
        let nic = t.stack.nic(NIC).unwrap();
        assert_eq!(nic.stats().disabled_rx.packets.get(), 1);
        assert_eq!(nic.stats().disabled_rx.bytes.get(), len);
        assert_eq!(nic.stats().rx.packets.get(), 0);
        assert!(observer.received.lock().is_empty());
    }

    #[test]
    fn packet_socket_fan_out_and_idempotent_unregister() {
        let t = test_stack(|_| {});
        let link = eth_link(0x01);
        t.stack.create_nic(NIC, link.clone()).unwrap();
        let on_ipv4 = Arc::new(RecordingPacketEndpoint::default());
        let on_all = Arc::new(RecordingPacketEndpoint::default());
        t.stack
            .register_packet_endpoint(
                NIC,
                IPV4_PROTOCOL_NUMBER,
                on_ipv4.clone() as Arc<dyn PacketEndpoint>,
            )
            .unwrap();
        t.stack
            .register_packet_endpoint(
                NIC,
                ETHERNET_PROTOCOL_ALL,
                on_all.clone() as Arc<dyn PacketEndpoint>,
            )
            .unwrap();
        // Ethertypes outside the advertised set are refused.
        assert_eq!(
            t.stack.register_packet_endpoint(
                NIC,
                0x1234,
                on_all.clone() as Arc<dyn PacketEndpoint>,
            ),
            Err(Error::NotSupported)
        );
        let pkt = ipv4_packet(v4(10, 0, 0, 2), v4(10, 0, 0, 9), IpProtocol::Udp, &[1, 2, 3]);
        let raw = pkt.as_slice().to_vec();
        link.inject(mac(0x02), IPV4_PROTOCOL_NUMBER, pkt);
        {
            let got = on_ipv4.received.lock();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].packet_type, PacketType::Host);
            assert_eq!(got[0].proto, IPV4_PROTOCOL_NUMBER);
            assert_eq!(got[0].data, raw);
        }
        assert_eq!(on_all.received.lock().len(), 1);
        let as_dyn = on_ipv4.clone() as Arc<dyn PacketEndpoint>;
        t.stack
            .unregister_packet_endpoint(NIC, IPV4_PROTOCOL_NUMBER, &as_dyn)
            .unwrap();
        // Unregistering again is a silent no-op.
        t.stack
            .unregister_packet_endpoint(NIC, IPV4_PROTOCOL_NUMBER, &as_dyn)
            .unwrap();
        link.inject(
            mac(0x02),
            IPV4_PROTOCOL_NUMBER,
            ipv4_packet(v4(10, 0, 0, 2), v4(10, 0, 0, 9), IpProtocol::Udp, &[]),
        );
        assert_eq!(on_ipv4.received.lock().len(), 1);
        assert_eq!(on_all.received.lock().len(), 2);
    }

    #[test]
    fn promiscuous_mode_synthesizes_temporary_endpoint() {
        let t = test_stack(|_| {});
        let link = eth_link(0x01);
        t.stack.create_nic(NIC, link.clone()).unwrap();
        t.stack
            .add_address(NIC, IPV4_PROTOCOL_NUMBER, v4cidr(v4(10, 0, 0, 1), 24))
            .unwrap();
        let endpoint = Arc::new(RecordingTransportEndpoint::default());
        t.stack
            .demux()
            .register_endpoint(
                FAKE_TRANSPORT_NUMBER,
                TransportEndpointId {
                    local_port: 9,
                    local_address: IpAddress::Ipv4(Ipv4Addr::UNSPECIFIED),
                    remote_port: 0,
                    remote_address: IpAddress::Ipv4(Ipv4Addr::UNSPECIFIED),
                },
                endpoint.clone(),
            )
            .unwrap();
        let nic = t.stack.nic(NIC).unwrap();
        // IPv4 assignment is immediately primary; no detection gate.
        assert_eq!(
            nic.primary_address(IPV4_PROTOCOL_NUMBER),
            Some(v4cidr(v4(10, 0, 0, 1), 24))
        );
        // Without promiscuous mode the unknown destination is not local.
        link.inject(
            mac(0x02),
            IPV4_PROTOCOL_NUMBER,
            ipv4_packet(
                v4(10, 0, 0, 2),
                v4(10, 0, 0, 99),
                IpProtocol::Udp,
                &transport_payload(),
            ),
        );
        assert!(endpoint.received.lock().is_empty());
        assert_eq!(
            t.stack
                .stats()
                .ip
                .invalid_destination_addresses_received
                .get(),
            1
        );
        t.stack.set_promiscuous_mode(NIC, true).unwrap();
        link.inject(
            mac(0x02),
            IPV4_PROTOCOL_NUMBER,
            ipv4_packet(
                v4(10, 0, 0, 2),
                v4(10, 0, 0, 99),
                IpProtocol::Udp,
                &transport_payload(),
            ),
        );
        {
            let got = endpoint.received.lock();
            assert_eq!(got.len(), 1);
            let (id, payload) = &got[0];
            assert_eq!(id.local_port, 9);
            assert_eq!(id.remote_port, 7);
            assert_eq!(id.local_address, IpAddress::Ipv4(v4(10, 0, 0, 99)));
            assert_eq!(payload.as_slice(), &[0xaa, 0xbb]);
        }
        assert_eq!(nic.stats().rx.packets.get(), 2);
        // The temporary endpoint died with the delivery; the table holds
        // only the assigned address again.
        let ep = nic.endpoint(IPV4_PROTOCOL_NUMBER).unwrap();
        assert_eq!(ep.all_addresses().len(), 1);
    }

    #[test]
    fn delivery_reference_survives_concurrent_removal() {
        let t = test_stack(|_| {});
        let link = eth_link(0x01);
        t.stack.create_nic(NIC, link).unwrap();
        let addr = v4(10, 0, 0, 1);
        t.stack
            .add_address(NIC, IPV4_PROTOCOL_NUMBER, v4cidr(addr, 24))
            .unwrap();
        let nic = t.stack.nic(NIC).unwrap();
        let ep = nic.endpoint(IPV4_PROTOCOL_NUMBER).unwrap();
        let held = ep
            .get_assigned_endpoint(
                IpAddress::Ipv4(addr),
                false,
                PrimaryEndpointBehavior::NeverPrimary,
            )
            .unwrap();
        t.stack.remove_address(NIC, IpAddress::Ipv4(addr)).unwrap();
        // The held reference remains usable after removal.
        assert_eq!(held.kind(), AddressKind::PermanentExpired);
        assert_eq!(held.ref_count(), 1);
        drop(held);
        assert!(ep
            .get_assigned_endpoint(
                IpAddress::Ipv4(addr),
                false,
                PrimaryEndpointBehavior::NeverPrimary
            )
            .is_none());
        // And the address can be assigned again.
        t.stack
            .add_address(NIC, IPV4_PROTOCOL_NUMBER, v4cidr(addr, 24))
            .unwrap();
    }

    #[test]
    fn handle_local_rejects_own_source_address() {
        let t = test_stack(|opts| {
            opts.handle_local = true;
        });
        let link = eth_link(0x01);
        t.stack.create_nic(NIC, link.clone()).unwrap();
        t.stack
            .add_address(NIC, IPV4_PROTOCOL_NUMBER, v4cidr(v4(10, 0, 0, 1), 24))
            .unwrap();
        link.inject(
            mac(0x02),
            IPV4_PROTOCOL_NUMBER,
            ipv4_packet(
                v4(10, 0, 0, 1),
                v4(10, 0, 0, 1),
                IpProtocol::Udp,
                &transport_payload(),
            ),
        );
        assert_eq!(
            t.stack.stats().ip.invalid_source_addresses_received.get(),
            1
        );
    }

    #[test]
    fn unknown_ethertype_is_counted() {
        let t = test_stack(|_| {});
        let link = eth_link(0x01);
        t.stack.create_nic(NIC, link.clone()).unwrap();
        link.inject(
            mac(0x02),
            0x1234,
            ipv4_packet(v4(10, 0, 0, 2), v4(10, 0, 0, 1), IpProtocol::Udp, &[]),
        );
        assert_eq!(t.stack.stats().unknown_protocol_rcvd_packets.get(), 1);
    }

    #[test]
    fn raw_endpoints_see_every_packet() {
        let t = test_stack(|_| {});
        let link = eth_link(0x01);
        t.stack.create_nic(NIC, link.clone()).unwrap();
        t.stack
            .add_address(NIC, IPV4_PROTOCOL_NUMBER, v4cidr(v4(10, 0, 0, 1), 24))
            .unwrap();
        let raw = Arc::new(RecordingRawEndpoint::default());
        t.stack
            .demux()
            .register_raw_endpoint(FAKE_TRANSPORT_NUMBER, raw.clone());
        link.inject(
            mac(0x02),
            IPV4_PROTOCOL_NUMBER,
            ipv4_packet(
                v4(10, 0, 0, 2),
                v4(10, 0, 0, 1),
                IpProtocol::Udp,
                &transport_payload(),
            ),
        );
        assert_eq!(raw.received.lock().len(), 1);
        // No bound endpoint consumed it and the fake transport has no
        // unknown-destination handling.
        assert_eq!(t.stack.stats().malformed_rcvd_packets.get(), 1);
    }

    #[test]
    fn transport_control_packets_reach_the_sender() {
        let t = test_stack(|_| {});
        let link = eth_link(0x01);
        t.stack.create_nic(NIC, link).unwrap();
        let endpoint = Arc::new(RecordingTransportEndpoint::default());
        let id = TransportEndpointId {
            local_port: 7,
            local_address: IpAddress::Ipv4(v4(10, 0, 0, 1)),
            remote_port: 9,
            remote_address: IpAddress::Ipv4(v4(192, 0, 2, 1)),
        };
        t.stack
            .demux()
            .register_endpoint(FAKE_TRANSPORT_NUMBER, id.clone(), endpoint.clone())
            .unwrap();
        let nic = t.stack.nic(NIC).unwrap();
        // The embedded (originally sent) packet: src port 7, dst port 9.
        let embedded = tcpip::buffer::PacketBuffer::new(transport_payload());
        nic.deliver_transport_control_packet(
            IpAddress::Ipv4(v4(10, 0, 0, 1)),
            IpAddress::Ipv4(v4(192, 0, 2, 1)),
            IPV4_PROTOCOL_NUMBER,
            FAKE_TRANSPORT_NUMBER,
            ControlType::PortUnreachable,
            0,
            &embedded,
        );
        let control = endpoint.control.lock();
        assert_eq!(control.len(), 1);
        assert_eq!(control[0].0, id);
        assert_eq!(control[0].1, ControlType::PortUnreachable);
    }

    #[test]
    fn neighbor_operations_require_resolution_capability() {
        let t = test_stack(|_| {});
        let loopback = LoopbackEndpoint::new(65536);
        t.stack.create_nic(NIC, loopback).unwrap();
        let nic = t.stack.nic(NIC).unwrap();
        assert_eq!(nic.neighbors().err(), Some(Error::NotSupported));
        assert_eq!(
            nic.add_static_neighbor(std::net::IpAddr::V4(v4(10, 0, 0, 2)), mac(2))
                .err(),
            Some(Error::NotSupported)
        );
        assert_eq!(nic.clear_neighbors().err(), Some(Error::NotSupported));
    }

    #[test]
    fn outbound_packets_fan_out_with_link_header() {
        let t = test_stack(|opts| {
            opts.ndp_configs.dup_addr_detect_transmits = 1;
        });
        let link = eth_link(0x01);
        t.stack.create_nic(NIC, link.clone()).unwrap();
        let observer = Arc::new(RecordingPacketEndpoint::default());
        t.stack
            .register_packet_endpoint(
                NIC,
                ETHERNET_PROTOCOL_ALL,
                observer.clone() as Arc<dyn PacketEndpoint>,
            )
            .unwrap();
        // Adding a tentative IPv6 address emits a DAD solicitation, which
        // outbound observers see with the synthesized ethernet header.
        t.stack
            .add_address(
                NIC,
                IPV6_PROTOCOL_NUMBER,
                IpCidr::new(
                    IpAddress::Ipv6(std::net::Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
                    64,
                ),
            )
            .unwrap();
        let written = link.drain();
        assert_eq!(written.len(), 1);
        let got = observer.received.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].packet_type, PacketType::Outgoing);
        assert_eq!(got[0].proto, IPV6_PROTOCOL_NUMBER);
        // 14 bytes of ethernet header precede the IPv6 packet.
        assert_eq!(got[0].data.len(), written[0].pkt.len() + 14);
        assert_eq!(&got[0].data[14..], written[0].pkt.as_slice());
    }

    #[test]
    fn groups_are_orchestrated_through_endpoints() {
        let t = test_stack(|_| {});
        let link = eth_link(0x01);
        t.stack.create_nic(NIC, link).unwrap();
        let group = IpAddress::Ipv4(v4(224, 0, 0, 251));
        assert!(!t.stack.is_in_group(NIC, group).unwrap());
        t.stack.join_group(NIC, IPV4_PROTOCOL_NUMBER, group).unwrap();
        assert!(t.stack.is_in_group(NIC, group).unwrap());
        // Two joins need two leaves.
        t.stack.join_group(NIC, IPV4_PROTOCOL_NUMBER, group).unwrap();
        t.stack
            .leave_group(NIC, IPV4_PROTOCOL_NUMBER, group)
            .unwrap();
        assert!(t.stack.is_in_group(NIC, group).unwrap());
        t.stack
            .leave_group(NIC, IPV4_PROTOCOL_NUMBER, group)
            .unwrap();
        assert!(!t.stack.is_in_group(NIC, group).unwrap());
        assert_eq!(
            t.stack.leave_group(NIC, IPV4_PROTOCOL_NUMBER, group).err(),
            Some(Error::BadLocalAddress)
        );
        // Non-multicast addresses are refused.
        assert_eq!(
            t.stack
                .join_group(NIC, IPV4_PROTOCOL_NUMBER, IpAddress::Ipv4(v4(10, 0, 0, 1)))
                .err(),
            Some(Error::BadAddress)
        );
    }
}
