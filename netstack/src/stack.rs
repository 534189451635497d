// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The stack: protocol registries, the NIC table, routing, the forwarder
//! queue, the transport demultiplexer, and global options and statistics.
//!
//! The stack is deliberately thin; the interesting machinery lives in
//! [`crate::nic`]. It exists so NICs have a home for shared state: the
//! clock and timer queue, the packet filter, NDP configuration, and the
//! queue of packets waiting on link-address resolution.

use crate::ipv6::Ipv6LinkAddressResolver;
use crate::link::LinkEndpoint;
use crate::ndp::NdpConfigs;
use crate::ndp::NdpDispatcher;
use crate::neighbor::ResolutionResult;
use crate::nic::Nic;
use crate::protocol::ControlType;
use crate::protocol::LinkAddressResolver;
use crate::protocol::NetworkProtocol;
use crate::protocol::RawTransportEndpoint;
use crate::protocol::TransportEndpoint;
use crate::protocol::TransportEndpointId;
use crate::protocol::TransportProtocol;
use crate::route::Route;
use futures::channel::oneshot;
use parking_lot::Mutex;
use parking_lot::RwLock;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpCidr;
use std::any::Any;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::sync::Arc;
use tcpip::buffer::PacketBuffer;
use tcpip::stats::StackStats;
use tcpip::time::Clock;
use tcpip::time::Duration;
use tcpip::time::Instant;
use tcpip::time::StdClock;
use tcpip::time::TimerHandle;
use tcpip::time::TimerQueue;
use tcpip::Error;
use tcpip::NetworkProtocolNumber;
use tcpip::NicId;
use tcpip::TransportProtocolNumber;
use tcpip::IPV6_PROTOCOL_NUMBER;

/// One entry of the routing table. Entries are scanned in order; the first
/// match wins.
#[derive(Clone)]
pub struct RouteEntry {
    /// Destinations this entry covers.
    pub destination: IpCidr,
    /// Next hop, when the destination is not directly on-link.
    pub gateway: Option<IpAddress>,
    /// The NIC to send through.
    pub nic: NicId,
}

/// The packet-filter hook consulted on the receive path (IPv4 prerouting).
pub trait PacketFilter: Send + Sync {
    /// Returns false to drop the packet. `preroute_addr` is the receiving
    /// NIC's primary address for the packet's protocol.
    fn check_prerouting(
        &self,
        pkt: &mut PacketBuffer,
        preroute_addr: Option<IpAddress>,
        nic_name: &str,
    ) -> bool {
        let _ = (pkt, preroute_addr, nic_name);
        true
    }
}

struct AcceptAll;

impl PacketFilter for AcceptAll {}

/// Fallback handler consulted after the demultiplexer and before the
/// protocol's unknown-destination handling.
pub type DefaultTransportHandler =
    Arc<dyn Fn(&TransportEndpointId, &Route, &PacketBuffer) -> bool + Send + Sync>;

/// Options for [`Stack::new`].
pub struct StackOptions {
    /// Network engines to register.
    pub network_protocols: Vec<Arc<dyn NetworkProtocol>>,
    /// Transport engines to register.
    pub transport_protocols: Vec<Arc<dyn TransportProtocol>>,
    /// Clock; defaults to the OS monotonic clock.
    pub clock: Option<Arc<dyn Clock>>,
    /// Drop inbound packets whose source is one of the receiving NIC's own
    /// addresses (loopback excepted).
    pub handle_local: bool,
    /// Auto-generate an IPv6 link-local address when a NIC is enabled.
    pub auto_gen_ipv6_link_local: bool,
    /// Give resolution-capable NICs a neighbor cache.
    pub use_neighbor_cache: bool,
    /// NDP tunables shared by every NIC.
    pub ndp_configs: NdpConfigs,
    /// Observer of NDP events.
    pub ndp_dispatcher: Option<Arc<dyn NdpDispatcher>>,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            network_protocols: Vec::new(),
            transport_protocols: Vec::new(),
            clock: None,
            handle_local: false,
            auto_gen_ipv6_link_local: false,
            use_neighbor_cache: true,
            ndp_configs: NdpConfigs::default(),
            ndp_dispatcher: None,
        }
    }
}

/// Options for [`Stack::create_nic_with_options`].
#[derive(Default)]
pub struct NicOptions {
    /// Human-readable interface name.
    pub name: String,
    /// Opaque per-interface context, retrievable via
    /// [`Nic::context`].
    pub context: Option<Box<dyn Any + Send + Sync>>,
    /// Leave the NIC disabled after creation.
    pub disabled: bool,
}

/// A userspace network stack.
pub struct Stack {
    clock: Arc<dyn Clock>,
    timers: TimerQueue,
    network_protocols: HashMap<NetworkProtocolNumber, Arc<dyn NetworkProtocol>>,
    transport_protocols: HashMap<TransportProtocolNumber, Arc<dyn TransportProtocol>>,
    link_addr_resolvers: RwLock<HashMap<NetworkProtocolNumber, Arc<dyn LinkAddressResolver>>>,
    transport_default_handlers: RwLock<HashMap<TransportProtocolNumber, DefaultTransportHandler>>,
    demux: TransportDemux,
    filter: RwLock<Arc<dyn PacketFilter>>,
    forwarder: Forwarder,
    nics: RwLock<HashMap<NicId, Arc<Nic>>>,
    route_table: RwLock<Vec<RouteEntry>>,
    forwarding: RwLock<bool>,
    handle_local: bool,
    auto_gen_ipv6_link_local: bool,
    use_neighbor_cache: bool,
    ndp_configs: NdpConfigs,
    ndp_dispatcher: Option<Arc<dyn NdpDispatcher>>,
    stats: StackStats,
}

impl Stack {
    /// Creates a stack with the given options.
    pub fn new(opts: StackOptions) -> Arc<Self> {
        let network_protocols: HashMap<_, _> = opts
            .network_protocols
            .into_iter()
            .map(|p| (p.number(), p))
            .collect();
        let transport_protocols: HashMap<_, _> = opts
            .transport_protocols
            .into_iter()
            .map(|p| (p.number(), p))
            .collect();
        let mut link_addr_resolvers: HashMap<
            NetworkProtocolNumber,
            Arc<dyn LinkAddressResolver>,
        > = HashMap::new();
        if network_protocols.contains_key(&IPV6_PROTOCOL_NUMBER) {
            link_addr_resolvers
                .insert(IPV6_PROTOCOL_NUMBER, Arc::new(Ipv6LinkAddressResolver));
        }
        Arc::new(Self {
            clock: opts.clock.unwrap_or_else(|| Arc::new(StdClock::new())),
            timers: TimerQueue::new(),
            network_protocols,
            transport_protocols,
            link_addr_resolvers: RwLock::new(link_addr_resolvers),
            transport_default_handlers: RwLock::new(HashMap::new()),
            demux: TransportDemux::default(),
            filter: RwLock::new(Arc::new(AcceptAll)),
            forwarder: Forwarder::default(),
            nics: RwLock::new(HashMap::new()),
            route_table: RwLock::new(Vec::new()),
            forwarding: RwLock::new(false),
            handle_local: opts.handle_local,
            auto_gen_ipv6_link_local: opts.auto_gen_ipv6_link_local,
            use_neighbor_cache: opts.use_neighbor_cache,
            ndp_configs: opts.ndp_configs,
            ndp_dispatcher: opts.ndp_dispatcher,
            stats: StackStats::default(),
        })
    }

    // ---- Time ----

    /// The current instant on the stack's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Runs every timer due at or before now. The embedder calls this when
    /// [`Stack::poll_at`] comes due; tests call it after advancing a manual
    /// clock.
    pub fn handle_timers(&self) -> usize {
        self.timers.poll(self.clock.now())
    }

    /// The earliest pending timer deadline.
    pub fn poll_at(&self) -> Option<Instant> {
        self.timers.poll_at()
    }

    pub(crate) fn schedule_timer(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        self.timers.schedule_at(self.clock.now() + delay, f)
    }

    // ---- Registries ----

    pub(crate) fn network_protocol(
        &self,
        proto: NetworkProtocolNumber,
    ) -> Option<Arc<dyn NetworkProtocol>> {
        self.network_protocols.get(&proto).cloned()
    }

    pub(crate) fn network_protocols(&self) -> impl Iterator<Item = &Arc<dyn NetworkProtocol>> {
        self.network_protocols.values()
    }

    pub(crate) fn transport_protocol(
        &self,
        proto: TransportProtocolNumber,
    ) -> Option<Arc<dyn TransportProtocol>> {
        self.transport_protocols.get(&proto).cloned()
    }

    /// Registers (or replaces) the link-address resolver for a network
    /// protocol.
    pub fn register_link_address_resolver(
        &self,
        proto: NetworkProtocolNumber,
        resolver: Arc<dyn LinkAddressResolver>,
    ) {
        self.link_addr_resolvers.write().insert(proto, resolver);
    }

    pub(crate) fn link_address_resolver(
        &self,
        proto: NetworkProtocolNumber,
    ) -> Option<Arc<dyn LinkAddressResolver>> {
        self.link_addr_resolvers.read().get(&proto).cloned()
    }

    pub(crate) fn has_link_address_resolvers(&self) -> bool {
        !self.link_addr_resolvers.read().is_empty()
    }

    /// Registers a fallback handler for one transport protocol, consulted
    /// when no endpoint matches a packet.
    pub fn register_transport_default_handler(
        &self,
        proto: TransportProtocolNumber,
        handler: DefaultTransportHandler,
    ) {
        self.transport_default_handlers.write().insert(proto, handler);
    }

    pub(crate) fn transport_default_handler(
        &self,
        proto: TransportProtocolNumber,
    ) -> Option<DefaultTransportHandler> {
        self.transport_default_handlers.read().get(&proto).cloned()
    }

    /// The transport demultiplexer.
    pub fn demux(&self) -> &TransportDemux {
        &self.demux
    }

    /// The packet filter.
    pub fn filter(&self) -> Arc<dyn PacketFilter> {
        self.filter.read().clone()
    }

    /// Installs a packet filter.
    pub fn set_filter(&self, filter: Arc<dyn PacketFilter>) {
        *self.filter.write() = filter;
    }

    // ---- Options & stats ----

    /// Stack-wide counters.
    pub fn stats(&self) -> &StackStats {
        &self.stats
    }

    pub(crate) fn handle_local(&self) -> bool {
        self.handle_local
    }

    pub(crate) fn auto_gen_ipv6_link_local(&self) -> bool {
        self.auto_gen_ipv6_link_local
    }

    pub(crate) fn use_neighbor_cache(&self) -> bool {
        self.use_neighbor_cache
    }

    pub(crate) fn ndp_configs(&self) -> &NdpConfigs {
        &self.ndp_configs
    }

    pub(crate) fn ndp_dispatcher(&self) -> Option<Arc<dyn NdpDispatcher>> {
        self.ndp_dispatcher.clone()
    }

    /// Whether packet forwarding between NICs is enabled.
    pub fn forwarding(&self) -> bool {
        *self.forwarding.read()
    }

    /// Enables or disables forwarding. Every NIC transitions between
    /// router and host mode; the post-state depends only on the final
    /// value.
    pub fn set_forwarding(&self, enable: bool) {
        {
            let mut forwarding = self.forwarding.write();
            if *forwarding == enable {
                return;
            }
            *forwarding = enable;
        }
        let nics: Vec<Arc<Nic>> = self.nics.read().values().cloned().collect();
        for nic in nics {
            nic.on_forwarding_changed(enable);
        }
    }

    // ---- NICs ----

    /// Creates and enables a NIC with default options.
    pub fn create_nic(
        self: &Arc<Self>,
        id: NicId,
        link: Arc<dyn LinkEndpoint>,
    ) -> Result<(), Error> {
        self.create_nic_with_options(
            id,
            link,
            NicOptions {
                name: format!("nic{id}"),
                ..Default::default()
            },
        )
    }

    /// Creates a NIC. Unless `opts.disabled`, the NIC is enabled
    /// immediately.
    pub fn create_nic_with_options(
        self: &Arc<Self>,
        id: NicId,
        link: Arc<dyn LinkEndpoint>,
        opts: NicOptions,
    ) -> Result<(), Error> {
        let nic = {
            let mut nics = self.nics.write();
            if nics.contains_key(&id) {
                return Err(Error::DuplicateNicId);
            }
            let nic = Nic::new(self, id, opts.name, link, opts.context);
            nics.insert(id, nic.clone());
            nic
        };
        nic.attach_link();
        if !opts.disabled {
            nic.enable()?;
        }
        Ok(())
    }

    /// Looks up a NIC.
    pub fn nic(&self, id: NicId) -> Option<Arc<Nic>> {
        self.nics.read().get(&id).cloned()
    }

    fn nic_or_err(&self, id: NicId) -> Result<Arc<Nic>, Error> {
        self.nic(id).ok_or(Error::UnknownNic)
    }

    /// Enables a NIC.
    pub fn enable_nic(&self, id: NicId) -> Result<(), Error> {
        self.nic_or_err(id)?.enable()
    }

    /// Disables a NIC.
    pub fn disable_nic(&self, id: NicId) -> Result<(), Error> {
        self.nic_or_err(id)?.disable();
        Ok(())
    }

    /// Removes a NIC. After return no packet crosses the interface in
    /// either direction.
    pub fn remove_nic(&self, id: NicId) -> Result<(), Error> {
        let nic = {
            let mut nics = self.nics.write();
            nics.remove(&id).ok_or(Error::UnknownNic)?
        };
        nic.remove()
    }

    // ---- Addresses & groups ----

    /// Assigns an address to a NIC.
    pub fn add_address(
        &self,
        id: NicId,
        proto: NetworkProtocolNumber,
        addr: IpCidr,
    ) -> Result<(), Error> {
        self.add_address_with_behavior(
            id,
            proto,
            addr,
            crate::addresses::PrimaryEndpointBehavior::CanBePrimary,
        )
    }

    /// Assigns an address with an explicit primary-selection class.
    pub fn add_address_with_behavior(
        &self,
        id: NicId,
        proto: NetworkProtocolNumber,
        addr: IpCidr,
        peb: crate::addresses::PrimaryEndpointBehavior,
    ) -> Result<(), Error> {
        self.nic_or_err(id)?.add_address(proto, addr, peb)
    }

    /// Removes an address from a NIC.
    pub fn remove_address(&self, id: NicId, addr: IpAddress) -> Result<(), Error> {
        self.nic_or_err(id)?.remove_address(addr)
    }

    /// Enables or disables promiscuous mode (inbound-permissive) on a NIC.
    pub fn set_promiscuous_mode(&self, id: NicId, enable: bool) -> Result<(), Error> {
        self.nic_or_err(id)?.set_promiscuous(enable);
        Ok(())
    }

    /// Enables or disables spoofing (outbound-permissive) on a NIC.
    pub fn set_spoofing(&self, id: NicId, enable: bool) -> Result<(), Error> {
        self.nic_or_err(id)?.set_spoofing(enable);
        Ok(())
    }

    /// Joins a multicast group on a NIC.
    pub fn join_group(
        &self,
        id: NicId,
        proto: NetworkProtocolNumber,
        addr: IpAddress,
    ) -> Result<(), Error> {
        self.nic_or_err(id)?.join_group(proto, addr)
    }

    /// Leaves a multicast group on a NIC.
    pub fn leave_group(
        &self,
        id: NicId,
        proto: NetworkProtocolNumber,
        addr: IpAddress,
    ) -> Result<(), Error> {
        self.nic_or_err(id)?.leave_group(proto, addr)
    }

    /// Whether any endpoint on the NIC is a member of `addr`.
    pub fn is_in_group(&self, id: NicId, addr: IpAddress) -> Result<bool, Error> {
        Ok(self.nic_or_err(id)?.is_in_group(addr))
    }

    /// Registers a packet socket on a NIC for `proto` (or the all-
    /// ethertypes key).
    pub fn register_packet_endpoint(
        &self,
        id: NicId,
        proto: NetworkProtocolNumber,
        ep: Arc<dyn crate::protocol::PacketEndpoint>,
    ) -> Result<(), Error> {
        self.nic_or_err(id)?.register_packet_endpoint(proto, ep)
    }

    /// Unregisters a packet socket; unknown registrations are ignored.
    pub fn unregister_packet_endpoint(
        &self,
        id: NicId,
        proto: NetworkProtocolNumber,
        ep: &Arc<dyn crate::protocol::PacketEndpoint>,
    ) -> Result<(), Error> {
        self.nic_or_err(id)?.unregister_packet_endpoint(proto, ep);
        Ok(())
    }

    // ---- Routing & forwarding ----

    /// Replaces the routing table.
    pub fn set_route_table(&self, table: Vec<RouteEntry>) {
        *self.route_table.write() = table;
    }

    /// Finds a route toward `remote`, optionally pinned to a NIC and/or a
    /// local address.
    pub fn find_route(
        &self,
        nic: Option<NicId>,
        local: Option<IpAddress>,
        remote: IpAddress,
        proto: NetworkProtocolNumber,
    ) -> Result<Route, Error> {
        let table = self.route_table.read().clone();
        for entry in &table {
            if !entry.destination.contains_addr(&remote) {
                continue;
            }
            if let Some(want) = nic {
                if entry.nic != want {
                    continue;
                }
            }
            let Some(target) = self.nic(entry.nic) else {
                continue;
            };
            if !target.enabled() {
                continue;
            }
            let addr_ref = match local {
                Some(local) => target.get_assigned_for_outgoing(proto, local),
                None => target.primary_endpoint_for(proto, Some(remote)),
            };
            let Some(addr_ref) = addr_ref else { continue };
            let local_address = addr_ref.address();
            return Ok(Route::new(
                proto,
                local_address,
                remote,
                entry.gateway,
                target,
                Some(addr_ref),
            ));
        }
        Err(Error::NoRoute)
    }

    pub(crate) fn enqueue_forward(
        &self,
        rx: oneshot::Receiver<ResolutionResult>,
        source_nic: NicId,
        route: Route,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) {
        self.forwarder.enqueue(rx, source_nic, route, proto, pkt);
    }

    /// Packets parked in the forwarder awaiting link-address resolution.
    pub fn forwarder_pending(&self) -> usize {
        self.forwarder.pending()
    }

    /// Re-examines parked packets; emits those whose resolution completed
    /// and drops those whose resolution failed. Called whenever a neighbor
    /// resolution completes.
    pub fn process_forwarder(&self) {
        self.forwarder.process(&self.stats);
    }
}

struct PendingPacket {
    rx: oneshot::Receiver<ResolutionResult>,
    // Recorded for diagnostics; the route stays bound to the target NIC.
    source_nic: NicId,
    route: Route,
    proto: NetworkProtocolNumber,
    pkt: PacketBuffer,
}

/// Packets waiting for link-address resolution, with the channel that
/// reports the outcome.
#[derive(Default)]
struct Forwarder {
    pending: Mutex<Vec<PendingPacket>>,
}

impl Forwarder {
    fn enqueue(
        &self,
        rx: oneshot::Receiver<ResolutionResult>,
        source_nic: NicId,
        route: Route,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) {
        self.pending.lock().push(PendingPacket {
            rx,
            source_nic,
            route,
            proto,
            pkt,
        });
    }

    fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn process(&self, stats: &StackStats) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut ready = Vec::new();
        let mut keep = Vec::new();
        for mut p in pending {
            match p.rx.try_recv() {
                Ok(Some(Ok(link))) => {
                    p.route.remote_link_address = Some(link);
                    ready.push(p);
                }
                Ok(None) => keep.push(p),
                Ok(Some(Err(_))) | Err(_) => {
                    tracing::debug!(
                        source_nic = %p.source_nic,
                        remote = %p.route.remote_address,
                        "dropping packet, link address resolution failed"
                    );
                    stats.dropped_packets.increment();
                }
            }
        }
        self.pending.lock().extend(keep);
        for p in ready {
            let nic = p.route.nic().clone();
            nic.forward_packet(&p.route, p.proto, p.pkt);
        }
    }
}

/// The transport demultiplexer: maps inbound packets to registered
/// transport endpoints, with raw-socket fan-out.
#[derive(Default)]
pub struct TransportDemux {
    endpoints: RwLock<
        HashMap<(TransportProtocolNumber, TransportEndpointId), Arc<dyn TransportEndpoint>>,
    >,
    raw: RwLock<HashMap<TransportProtocolNumber, Vec<Arc<dyn RawTransportEndpoint>>>>,
}

impl TransportDemux {
    /// Registers an endpoint for an id; at most one endpoint per id.
    pub fn register_endpoint(
        &self,
        proto: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: Arc<dyn TransportEndpoint>,
    ) -> Result<(), Error> {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&(proto, id.clone())) {
            return Err(Error::DuplicateAddress);
        }
        endpoints.insert((proto, id), ep);
        Ok(())
    }

    /// Unregisters an endpoint; unknown registrations are ignored.
    pub fn unregister_endpoint(&self, proto: TransportProtocolNumber, id: &TransportEndpointId) {
        self.endpoints.write().remove(&(proto, id.clone()));
    }

    /// Subscribes a raw endpoint to every packet of one protocol.
    pub fn register_raw_endpoint(
        &self,
        proto: TransportProtocolNumber,
        ep: Arc<dyn RawTransportEndpoint>,
    ) {
        self.raw.write().entry(proto).or_default().push(ep);
    }

    pub(crate) fn deliver_raw_packet(
        &self,
        proto: TransportProtocolNumber,
        route: &Route,
        pkt: &PacketBuffer,
    ) {
        let eps = self.raw.read().get(&proto).cloned().unwrap_or_default();
        for ep in eps {
            ep.handle_packet(route, pkt);
        }
    }

    pub(crate) fn deliver_packet(
        &self,
        proto: TransportProtocolNumber,
        id: &TransportEndpointId,
        _route: &Route,
        pkt: &PacketBuffer,
    ) -> bool {
        for candidate in match_candidates(id) {
            let ep = self.endpoints.read().get(&(proto, candidate)).cloned();
            if let Some(ep) = ep {
                ep.handle_packet(id, pkt);
                return true;
            }
        }
        false
    }

    pub(crate) fn deliver_control_packet(
        &self,
        _net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        id: &TransportEndpointId,
        typ: ControlType,
        extra: u32,
        pkt: &PacketBuffer,
    ) {
        for candidate in match_candidates(id) {
            let ep = self.endpoints.read().get(&(trans, candidate)).cloned();
            if let Some(ep) = ep {
                ep.handle_control_packet(id, typ, extra, pkt);
                return;
            }
        }
    }
}

// Most-specific first: exact 4-tuple, then any-remote, then any-local.
fn match_candidates(id: &TransportEndpointId) -> Vec<TransportEndpointId> {
    let unspecified = match id.local_address {
        IpAddress::Ipv4(_) => IpAddress::Ipv4(Ipv4Addr::UNSPECIFIED),
        IpAddress::Ipv6(_) => IpAddress::Ipv6(Ipv6Addr::UNSPECIFIED),
    };
    vec![
        id.clone(),
        TransportEndpointId {
            local_port: id.local_port,
            local_address: id.local_address,
            remote_port: 0,
            remote_address: unspecified,
        },
        TransportEndpointId {
            local_port: id.local_port,
            local_address: unspecified,
            remote_port: 0,
            remote_address: unspecified,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::RouteEntry;
    use crate::link::LinkEndpoint;
    use crate::testutil::eth_link;
    use crate::testutil::ipv6_packet;
    use crate::testutil::mac;
    use crate::testutil::neighbor_advert;
    use crate::testutil::parse_ndisc;
    use crate::testutil::test_stack;
    use crate::testutil::NdiscSummary;
    use crate::testutil::TestSetup;
    use crate::link::channel::ChannelEndpoint;
    use smoltcp::wire::IpAddress;
    use smoltcp::wire::IpCidr;
    use smoltcp::wire::IpProtocol;
    use std::net::Ipv6Addr;
    use std::sync::Arc;
    use tcpip::time::Duration;
    use tcpip::Error;
    use tcpip::NicId;
    use tcpip::IPV6_PROTOCOL_NUMBER;

    const NIC_A: NicId = NicId(1);
    const NIC_B: NicId = NicId(2);

    fn subnet_a(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0x2001, 0xdb8, 0xa, 0, 0, 0, 0, n)
    }

    fn subnet_b(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0x2001, 0xdb8, 0xb, 0, 0, 0, 0, n)
    }

    fn v6cidr(a: Ipv6Addr, len: u8) -> IpCidr {
        IpCidr::new(IpAddress::Ipv6(a), len)
    }

    // Two NICs, addresses in different subnets, a route for subnet B, and
    // forwarding on.
    fn forwarding_setup() -> (TestSetup, Arc<ChannelEndpoint>, Arc<ChannelEndpoint>) {
        let t = test_stack(|opts| {
            opts.ndp_configs.dup_addr_detect_transmits = 0;
        });
        let link_a = eth_link(0xa);
        let link_b = eth_link(0xb);
        t.stack.create_nic(NIC_A, link_a.clone()).unwrap();
        t.stack.create_nic(NIC_B, link_b.clone()).unwrap();
        t.stack
            .add_address(NIC_A, IPV6_PROTOCOL_NUMBER, v6cidr(subnet_a(1), 64))
            .unwrap();
        t.stack
            .add_address(NIC_B, IPV6_PROTOCOL_NUMBER, v6cidr(subnet_b(1), 64))
            .unwrap();
        t.stack.set_route_table(vec![RouteEntry {
            destination: v6cidr(subnet_b(0), 64),
            gateway: None,
            nic: NIC_B,
        }]);
        t.stack.set_forwarding(true);
        (t, link_a, link_b)
    }

    #[test]
    fn find_route_selects_primary_source() {
        let (t, _link_a, _link_b) = forwarding_setup();
        let route = t
            .stack
            .find_route(None, None, IpAddress::Ipv6(subnet_b(0x99)), IPV6_PROTOCOL_NUMBER)
            .unwrap();
        assert_eq!(route.nic_id(), NIC_B);
        assert_eq!(route.local_address, IpAddress::Ipv6(subnet_b(1)));
        assert_eq!(route.remote_address, IpAddress::Ipv6(subnet_b(0x99)));
        assert!(route.is_resolution_required());
        assert_eq!(
            t.stack
                .find_route(
                    None,
                    None,
                    IpAddress::Ipv6(Ipv6Addr::new(0x2001, 0xdb8, 0xc, 0, 0, 0, 0, 1)),
                    IPV6_PROTOCOL_NUMBER
                )
                .err(),
            Some(Error::NoRoute)
        );
    }

    #[test]
    fn forwarding_defers_to_async_resolution() {
        let (t, link_a, link_b) = forwarding_setup();
        let dst = subnet_b(0x99);
        let payload = [0u8, 7, 0, 9, 0, 0, 0, 0];
        let pkt = ipv6_packet(subnet_a(2), dst, IpProtocol::Udp, 64, &payload);
        let original = pkt.as_slice().to_vec();
        link_a.inject(mac(0x02), IPV6_PROTOCOL_NUMBER, pkt);
        // The packet is parked; the only emission is B's neighbor probe.
        assert_eq!(t.stack.forwarder_pending(), 1);
        assert_eq!(link_a.queued(), 0);
        let probes = link_b.drain();
        assert_eq!(probes.len(), 1);
        assert_eq!(
            parse_ndisc(&probes[0].pkt),
            Some(NdiscSummary::NeighborSolicit {
                src: subnet_b(1),
                dst: crate::ipv6::solicited_node(&dst),
                target: dst,
            })
        );
        // The neighbor answers; the forwarder emits through B.
        link_b.inject(
            mac(0x99),
            IPV6_PROTOCOL_NUMBER,
            neighbor_advert(dst, dst, mac(0x99)),
        );
        assert_eq!(t.stack.forwarder_pending(), 0);
        let written = link_b.drain();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].remote_link, mac(0x99));
        assert_eq!(written[0].local_link, mac(0xb));
        assert_eq!(written[0].proto, IPV6_PROTOCOL_NUMBER);
        // Forwarded unmodified (hop limit handling is not this layer's
        // job).
        assert_eq!(written[0].pkt.as_slice(), original.as_slice());
    }

    #[test]
    fn forwarding_drops_when_resolution_fails() {
        let (t, link_a, link_b) = forwarding_setup();
        let dst = subnet_b(0x99);
        link_a.inject(
            mac(0x02),
            IPV6_PROTOCOL_NUMBER,
            ipv6_packet(subnet_a(2), dst, IpProtocol::Udp, 64, &[0; 8]),
        );
        assert_eq!(t.stack.forwarder_pending(), 1);
        assert_eq!(link_b.drain().len(), 1);
        // Let every probe retransmit time out.
        for _ in 0..4 {
            t.advance(Duration::from_secs(1));
        }
        assert_eq!(t.stack.forwarder_pending(), 0);
        assert_eq!(t.stack.stats().dropped_packets.get(), 1);
        // Three retransmitted probes went out before giving up.
        assert_eq!(link_b.drain().len(), 3);
        assert_eq!(link_a.queued(), 0);
    }

    #[test]
    fn forwarding_uses_cached_neighbor_synchronously() {
        let (t, link_a, link_b) = forwarding_setup();
        let dst = subnet_b(0x99);
        t.stack
            .nic(NIC_B)
            .unwrap()
            .add_static_neighbor(std::net::IpAddr::V6(dst), mac(0x77))
            .unwrap();
        link_a.inject(
            mac(0x02),
            IPV6_PROTOCOL_NUMBER,
            ipv6_packet(subnet_a(2), dst, IpProtocol::Udp, 64, &[0; 8]),
        );
        assert_eq!(t.stack.forwarder_pending(), 0);
        let written = link_b.drain();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].remote_link, mac(0x77));
    }

    #[test]
    fn forwarding_delivers_to_target_nic_address() {
        let (t, link_a, link_b) = forwarding_setup();
        // Destination is B's own address: the packet is delivered on B,
        // not emitted.
        let dst = subnet_b(1);
        link_a.inject(
            mac(0x02),
            IPV6_PROTOCOL_NUMBER,
            ipv6_packet(subnet_a(2), dst, IpProtocol::Udp, 64, &[0, 7, 0, 9, 0, 0, 0, 0]),
        );
        assert_eq!(t.stack.forwarder_pending(), 0);
        assert_eq!(link_b.queued(), 0);
        // It went up B's transport path (and died unclaimed there).
        assert_eq!(t.stack.stats().malformed_rcvd_packets.get(), 1);
    }

    #[test]
    fn multicast_routes_resolve_statically() {
        let (t, _link_a, link_b) = forwarding_setup();
        t.stack.set_route_table(vec![RouteEntry {
            destination: v6cidr(Ipv6Addr::new(0xff0e, 0, 0, 0, 0, 0, 0, 0), 16),
            gateway: None,
            nic: NIC_B,
        }]);
        let group = Ipv6Addr::new(0xff0e, 0, 0, 0, 0, 0, 0, 0x42);
        let mut route = t
            .stack
            .find_route(None, None, IpAddress::Ipv6(group), IPV6_PROTOCOL_NUMBER)
            .unwrap();
        match route.resolve() {
            Ok(crate::route::ResolveOutcome::Done) => {}
            _ => panic!("multicast resolution should not block"),
        }
        assert_eq!(
            route.remote_link_address,
            Some(smoltcp::wire::EthernetAddress([0x33, 0x33, 0, 0, 0, 0x42]))
        );
        drop(link_b);
    }

    #[test]
    fn duplicate_nic_ids_are_rejected() {
        let t = test_stack(|_| {});
        t.stack.create_nic(NIC_A, eth_link(1)).unwrap();
        assert_eq!(
            t.stack.create_nic(NIC_A, eth_link(2)).err(),
            Some(Error::DuplicateNicId)
        );
    }

    #[test]
    fn remove_nic_tears_everything_down() {
        let t = test_stack(|opts| {
            opts.ndp_configs.dup_addr_detect_transmits = 0;
        });
        let link = eth_link(0x01);
        t.stack.create_nic(NIC_A, link.clone()).unwrap();
        t.stack
            .add_address(NIC_A, IPV6_PROTOCOL_NUMBER, v6cidr(subnet_a(1), 64))
            .unwrap();
        t.stack
            .join_group(
                NIC_A,
                IPV6_PROTOCOL_NUMBER,
                IpAddress::Ipv6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x42)),
            )
            .unwrap();
        let nic = t.stack.nic(NIC_A).unwrap();
        let ep = nic.ipv6_endpoint().unwrap();
        let held = ep
            .get_assigned_endpoint(
                IpAddress::Ipv6(subnet_a(1)),
                false,
                crate::addresses::PrimaryEndpointBehavior::NeverPrimary,
            )
            .unwrap();
        assert!(link.is_attached());
        t.stack.remove_nic(NIC_A).unwrap();
        assert!(t.stack.nic(NIC_A).is_none());
        assert!(!link.is_attached());
        assert!(!nic.enabled());
        // Every address (groups included) is gone; the held reference is
        // the only thing keeping its endpoint alive.
        assert!(ep.all_addresses().is_empty());
        assert_eq!(held.ref_count(), 1);
        drop(held);
        // Injecting after removal reaches nobody.
        link.inject(
            mac(0x02),
            IPV6_PROTOCOL_NUMBER,
            ipv6_packet(subnet_a(2), subnet_a(1), IpProtocol::Udp, 64, &[0; 8]),
        );
        assert_eq!(nic.stats().rx.packets.get(), 0);
        assert_eq!(nic.stats().disabled_rx.packets.get(), 0);
    }

    #[test]
    fn spoofing_permits_unassigned_sources() {
        let t = test_stack(|opts| {
            opts.ndp_configs.dup_addr_detect_transmits = 0;
        });
        let link = eth_link(0x01);
        t.stack.create_nic(NIC_A, link).unwrap();
        t.stack
            .add_address(NIC_A, IPV6_PROTOCOL_NUMBER, v6cidr(subnet_a(1), 64))
            .unwrap();
        t.stack.set_route_table(vec![RouteEntry {
            destination: v6cidr(Ipv6Addr::UNSPECIFIED, 0),
            gateway: None,
            nic: NIC_A,
        }]);
        let spoofed = IpAddress::Ipv6(subnet_b(7));
        assert_eq!(
            t.stack
                .find_route(
                    None,
                    Some(spoofed),
                    IpAddress::Ipv6(subnet_a(9)),
                    IPV6_PROTOCOL_NUMBER
                )
                .err(),
            Some(Error::NoRoute)
        );
        t.stack.set_spoofing(NIC_A, true).unwrap();
        let route = t
            .stack
            .find_route(
                None,
                Some(spoofed),
                IpAddress::Ipv6(subnet_a(9)),
                IPV6_PROTOCOL_NUMBER,
            )
            .unwrap();
        assert_eq!(route.local_address, spoofed);
    }
}
