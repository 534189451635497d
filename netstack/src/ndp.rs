// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-interface IPv6 Neighbor Discovery state: Duplicate Address Detection
//! (RFC 4862 section 5.4), router solicitation, router advertisement
//! processing with default-router and on-link prefix discovery (RFC 4861),
//! and SLAAC with stable and temporary addresses (RFC 4862).
//!
//! The state lives inside the NIC's lock; every mutating operation here runs
//! with that lock held in exclusive mode. Packets are never written under
//! the lock — operations collect [`NdpTransmit`] actions that the caller
//! flushes after unlocking, and timers re-enter through
//! [`crate::nic::Nic`] methods that take the lock themselves.

use crate::addresses::AddressConfigType;
use crate::addresses::AddressKind;
use crate::addresses::AddressProperties;
use crate::addresses::PrimaryEndpointBehavior;
use crate::ipv6::address_from_iid;
use crate::ipv6::eui64_interface_id;
use crate::ipv6::is_link_local;
use crate::ipv6::is_unicast;
use crate::ipv6::link_local_prefix;
use crate::ipv6::solicited_node;
use crate::ipv6::ALL_ROUTERS_MULTICAST;
use crate::nic::Nic;
use crate::nic::NicState;
use crate::route::ethernet_multicast;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::EthernetAddress;
use smoltcp::wire::Icmpv6Packet;
use smoltcp::wire::Icmpv6Repr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpCidr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv6Cidr;
use smoltcp::wire::Ipv6Packet;
use smoltcp::wire::Ipv6Repr;
use smoltcp::wire::NdiscNeighborFlags;
use smoltcp::wire::NdiscRepr;
use smoltcp::wire::RawHardwareAddress;
use smoltcp::wire::IPV6_HEADER_LEN;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::sync::Arc;
use tcpip::buffer::PacketBuffer;
use tcpip::time::Duration;
use tcpip::time::Instant;
use tcpip::time::TimerHandle;
use tcpip::Error;
use tcpip::NicId;
use tcpip::IPV6_PROTOCOL_NUMBER;

/// Upper bound on remembered default routers (RFC 4861 section 6.3.4 allows
/// an implementation cap).
const MAX_DISCOVERED_DEFAULT_ROUTERS: usize = 10;

/// SLAAC regeneration attempts after DAD conflicts before giving up.
const MAX_SLAAC_ADDR_LOCAL_REGEN_ATTEMPTS: u8 = 10;

/// Received valid lifetimes below this neither extend nor shorten an
/// existing SLAAC prefix (RFC 4862 section 5.5.3.e, simplified).
const MIN_PREFIX_VALID_LIFETIME_FOR_UPDATE: Duration = Duration::from_secs(2 * 60);

/// Prefix length SLAAC can generate addresses for.
const SLAAC_PREFIX_LEN: u8 = 64;

const ZERO: Duration = Duration::from_millis(0);

/// Tunables for this stack's NDP behavior, shared by every NIC.
#[derive(Debug, Clone)]
pub struct NdpConfigs {
    /// Neighbor solicitations sent per Duplicate Address Detection run;
    /// zero disables DAD.
    pub dup_addr_detect_transmits: u8,
    /// Interval between DAD solicitations (RetransTimer).
    pub retransmit_timer: Duration,
    /// Whether router advertisements are processed at all.
    pub handle_ras: bool,
    /// Whether default routers are discovered from RAs.
    pub discover_default_routers: bool,
    /// Whether on-link prefixes are discovered from RAs.
    pub discover_on_link_prefixes: bool,
    /// Whether SLAAC generates global addresses from RA prefixes.
    pub auto_gen_global_addresses: bool,
    /// Whether SLAAC also generates temporary (privacy) addresses.
    pub auto_gen_temp_global_addresses: bool,
    /// Router solicitations sent when becoming a host; zero disables
    /// solicitation.
    pub max_rtr_solicitations: u8,
    /// Interval between router solicitations.
    pub rtr_solicitation_interval: Duration,
    /// Upper bound on the random delay before the first solicitation.
    pub max_rtr_solicitation_delay: Duration,
}

impl Default for NdpConfigs {
    fn default() -> Self {
        Self {
            dup_addr_detect_transmits: 1,
            retransmit_timer: Duration::from_secs(1),
            handle_ras: true,
            discover_default_routers: true,
            discover_on_link_prefixes: true,
            auto_gen_global_addresses: false,
            auto_gen_temp_global_addresses: false,
            max_rtr_solicitations: 3,
            rtr_solicitation_interval: Duration::from_secs(4),
            max_rtr_solicitation_delay: Duration::from_secs(1),
        }
    }
}

/// Observer of NDP state transitions.
///
/// Invoked synchronously from the stack, sometimes with the NIC lock held;
/// implementations must not call back into the stack from these methods.
pub trait NdpDispatcher: Send + Sync {
    /// DAD finished for `addr`: resolved (now permanent) or not (duplicate
    /// detected, or detection aborted).
    fn on_duplicate_address_detection_status(&self, nic: NicId, addr: Ipv6Addr, resolved: bool) {
        let _ = (nic, addr, resolved);
    }

    /// A default router was learned; return false to ignore it.
    fn on_default_router_discovered(&self, nic: NicId, addr: Ipv6Addr) -> bool {
        let _ = (nic, addr);
        true
    }

    /// A remembered default router expired or was withdrawn.
    fn on_default_router_invalidated(&self, nic: NicId, addr: Ipv6Addr) {
        let _ = (nic, addr);
    }

    /// An on-link prefix was learned; return false to ignore it.
    fn on_on_link_prefix_discovered(&self, nic: NicId, prefix: Ipv6Cidr) -> bool {
        let _ = (nic, prefix);
        true
    }

    /// An on-link prefix expired or was withdrawn.
    fn on_on_link_prefix_invalidated(&self, nic: NicId, prefix: Ipv6Cidr) {
        let _ = (nic, prefix);
    }

    /// SLAAC wants to assign `addr`; return false to veto it.
    fn on_auto_gen_address(&self, nic: NicId, addr: IpCidr) -> bool {
        let _ = (nic, addr);
        true
    }

    /// A SLAAC address passed its preferred lifetime.
    fn on_auto_gen_address_deprecated(&self, nic: NicId, addr: IpCidr) {
        let _ = (nic, addr);
    }

    /// A SLAAC address was removed.
    fn on_auto_gen_address_invalidated(&self, nic: NicId, addr: IpCidr) {
        let _ = (nic, addr);
    }
}

/// Router-advertisement fields the NDP state consumes.
pub(crate) struct RaInfo {
    pub router_lifetime: Duration,
    pub prefix: Option<RaPrefixInfo>,
}

/// Prefix-information option fields. Lifetimes of `None` are infinite.
pub(crate) struct RaPrefixInfo {
    pub prefix: Ipv6Cidr,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid: Option<Duration>,
    pub preferred: Option<Duration>,
}

/// A packet for the NIC to emit once its lock is released.
pub(crate) enum NdpTransmit {
    NeighborSolicit {
        src: Ipv6Addr,
        target: Ipv6Addr,
    },
    NeighborAdvert {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        dst_link: Option<EthernetAddress>,
        target: Ipv6Addr,
        solicited: bool,
    },
    RouterSolicit {
        src: Ipv6Addr,
    },
}

struct DadState {
    remaining: u8,
    // Dropping the handle cancels the pending solicitation.
    _timer: Option<TimerHandle>,
}

struct DefaultRouterState {
    _timer: Option<TimerHandle>,
}

struct OnLinkPrefixState {
    _timer: Option<TimerHandle>,
}

struct SlaacPrefixState {
    _deprecation_timer: Option<TimerHandle>,
    _invalidation_timer: Option<TimerHandle>,
    valid_until: Option<Instant>,
    stable_addr: Option<Ipv6Addr>,
    generation_attempts: u8,
    temp_addrs: HashSet<Ipv6Addr>,
    temp_generation_attempts: u8,
}

struct RtrSolicitState {
    remaining: u8,
    _timer: Option<TimerHandle>,
}

type PrefixKey = (Ipv6Addr, u8);

/// Per-interface NDP state. Owned by the NIC, mutated under its lock.
#[derive(Default)]
pub(crate) struct Ndp {
    dad: HashMap<Ipv6Addr, DadState>,
    default_routers: HashMap<Ipv6Addr, DefaultRouterState>,
    on_link_prefixes: HashMap<PrefixKey, OnLinkPrefixState>,
    slaac_prefixes: HashMap<PrefixKey, SlaacPrefixState>,
    rtr_solicit: Option<RtrSolicitState>,
}

impl Ndp {
    #[cfg(test)]
    pub(crate) fn dad_in_progress(&self, addr: &Ipv6Addr) -> bool {
        self.dad.contains_key(addr)
    }

    #[cfg(test)]
    pub(crate) fn default_router_count(&self) -> usize {
        self.default_routers.len()
    }

    #[cfg(test)]
    pub(crate) fn has_on_link_prefix(&self, prefix: &Ipv6Cidr) -> bool {
        self.on_link_prefixes
            .contains_key(&(mask_prefix(prefix.address(), prefix.prefix_len()), prefix.prefix_len()))
    }
}

impl Nic {
    /// Starts Duplicate Address Detection for a tentative unicast address.
    /// With detection disabled the address resolves immediately.
    pub(crate) fn start_dad_locked(
        self: &Arc<Self>,
        state: &mut NicState,
        addr: Ipv6Addr,
        out: &mut Vec<NdpTransmit>,
    ) {
        debug_assert!(is_unicast(&addr));
        let Some(stack) = self.stack() else { return };
        let configs = stack.ndp_configs();
        if configs.dup_addr_detect_transmits == 0 {
            self.resolve_dad(addr);
            return;
        }
        tracing::debug!(nic = %self.id(), %addr, "starting duplicate address detection");
        out.push(NdpTransmit::NeighborSolicit {
            src: Ipv6Addr::UNSPECIFIED,
            target: addr,
        });
        let timer =
            self.schedule_nic_timer(configs.retransmit_timer, move |nic| nic.dad_timer_fired(addr));
        state.ndp.dad.insert(
            addr,
            DadState {
                remaining: configs.dup_addr_detect_transmits - 1,
                _timer: timer,
            },
        );
    }

    // Flips the address to permanent and reports success.
    fn resolve_dad(self: &Arc<Self>, addr: Ipv6Addr) {
        if let Some(ep) = self.ipv6_endpoint() {
            if let Some(r) = ep.get_endpoint(IpAddress::Ipv6(addr)) {
                if r.kind() == AddressKind::PermanentTentative {
                    r.set_kind(AddressKind::Permanent);
                }
            }
        }
        tracing::debug!(nic = %self.id(), %addr, "duplicate address detection resolved");
        if let Some(d) = self.ndp_dispatcher() {
            d.on_duplicate_address_detection_status(self.id(), addr, true);
        }
    }

    fn dad_timer_fired(self: Arc<Self>, addr: Ipv6Addr) {
        let mut out = Vec::new();
        let mut resolved = false;
        {
            let mut state = self.state.write();
            if !state.enabled {
                state.ndp.dad.remove(&addr);
                return;
            }
            let Some(stack) = self.stack() else { return };
            let Some(dad) = state.ndp.dad.get_mut(&addr) else {
                return;
            };
            if dad.remaining == 0 {
                state.ndp.dad.remove(&addr);
                resolved = true;
            } else {
                dad.remaining -= 1;
                out.push(NdpTransmit::NeighborSolicit {
                    src: Ipv6Addr::UNSPECIFIED,
                    target: addr,
                });
                dad._timer = self.schedule_nic_timer(
                    stack.ndp_configs().retransmit_timer,
                    move |nic| nic.dad_timer_fired(addr),
                );
            }
        }
        if resolved {
            self.resolve_dad(addr);
        }
        self.transmit_ndp(out);
    }

    // Cancels DAD for `addr` if it is running, reporting an unresolved
    // completion.
    fn stop_dad_locked(&self, state: &mut NicState, addr: Ipv6Addr) {
        if state.ndp.dad.remove(&addr).is_some() {
            if let Some(d) = self.ndp_dispatcher() {
                d.on_duplicate_address_detection_status(self.id(), addr, false);
            }
        }
    }

    /// A conflicting claim for a tentative address was observed: remove the
    /// address, regenerating it when it came from SLAAC.
    pub(crate) fn dup_tentative_addr_detected(self: &Arc<Self>, addr: Ipv6Addr) -> Result<(), Error> {
        let mut out = Vec::new();
        let res = {
            let mut state = self.state.write();
            let Some(ep) = self.ipv6_endpoint() else {
                return Err(Error::UnknownProtocol);
            };
            let Some(r) = ep.get_endpoint(IpAddress::Ipv6(addr)) else {
                return Err(Error::BadAddress);
            };
            let tentative = r.kind() == AddressKind::PermanentTentative;
            drop(r);
            if !tentative {
                return Err(Error::InvalidEndpointState);
            }
            tracing::info!(nic = %self.id(), %addr, "tentative address is a duplicate, removing");
            self.remove_permanent_ipv6_address_locked(&mut state, addr, true, &mut out)
        };
        self.transmit_ndp(out);
        res
    }

    /// Removes a permanent (or tentative) IPv6 address, stopping DAD and
    /// performing the teardown its configuration source requires.
    /// `dad_failed` selects SLAAC regeneration.
    pub(crate) fn remove_permanent_ipv6_address_locked(
        self: &Arc<Self>,
        state: &mut NicState,
        addr: Ipv6Addr,
        dad_failed: bool,
        out: &mut Vec<NdpTransmit>,
    ) -> Result<(), Error> {
        let Some(ep) = self.ipv6_endpoint() else {
            return Err(Error::UnknownProtocol);
        };
        let Some(r) = ep.get_endpoint(IpAddress::Ipv6(addr)) else {
            return Err(Error::BadLocalAddress);
        };
        let kind = r.kind();
        let config = r.config_type();
        drop(r);
        if !matches!(
            kind,
            AddressKind::Permanent | AddressKind::PermanentTentative
        ) {
            return Err(Error::BadLocalAddress);
        }
        match config {
            AddressConfigType::Static => {
                self.stop_dad_locked(state, addr);
                ep.remove_address(IpAddress::Ipv6(addr))
            }
            AddressConfigType::Slaac => {
                self.cleanup_slaac_addr_locked(state, addr, dad_failed, out);
                Ok(())
            }
            AddressConfigType::SlaacTemp => {
                self.cleanup_temp_slaac_addr_locked(state, addr, dad_failed, out);
                Ok(())
            }
        }
    }

    // Removes one SLAAC-generated address: stops DAD, drops it from the
    // table, and reports the invalidation.
    fn remove_slaac_bound_addr_locked(&self, state: &mut NicState, addr: Ipv6Addr) {
        self.stop_dad_locked(state, addr);
        if let Some(ep) = self.ipv6_endpoint() {
            let _ = ep.remove_address(IpAddress::Ipv6(addr));
        }
        if let Some(d) = self.ndp_dispatcher() {
            d.on_auto_gen_address_invalidated(
                self.id(),
                IpCidr::new(IpAddress::Ipv6(addr), SLAAC_PREFIX_LEN),
            );
        }
    }

    /// Cleans up a stable SLAAC address, optionally regenerating a
    /// replacement for its prefix.
    pub(crate) fn cleanup_slaac_addr_locked(
        self: &Arc<Self>,
        state: &mut NicState,
        addr: Ipv6Addr,
        regen: bool,
        out: &mut Vec<NdpTransmit>,
    ) {
        let key = state
            .ndp
            .slaac_prefixes
            .iter()
            .find(|(_, p)| p.stable_addr == Some(addr))
            .map(|(k, _)| *k);
        self.remove_slaac_bound_addr_locked(state, addr);
        let Some(key) = key else {
            // Not prefix-tracked (e.g. the auto-generated link-local); no
            // regeneration.
            return;
        };
        let mut regen_addr = None;
        if let Some(pst) = state.ndp.slaac_prefixes.get_mut(&key) {
            pst.stable_addr = None;
            if regen && pst.generation_attempts < MAX_SLAAC_ADDR_LOCAL_REGEN_ATTEMPTS {
                pst.generation_attempts += 1;
                // EUI-64 would collide again; retry with a random
                // identifier.
                regen_addr = Some(address_from_iid(key.0, random_iid()));
            }
        }
        if let Some(new_addr) = regen_addr {
            if self.add_slaac_addr_locked(state, new_addr, AddressConfigType::Slaac, false, out) {
                if let Some(pst) = state.ndp.slaac_prefixes.get_mut(&key) {
                    pst.stable_addr = Some(new_addr);
                }
            }
        }
    }

    /// Cleans up a temporary SLAAC address. Regeneration keeps the
    /// per-prefix attempt counter: repeated conflicts eventually stop
    /// regeneration rather than looping forever.
    pub(crate) fn cleanup_temp_slaac_addr_locked(
        self: &Arc<Self>,
        state: &mut NicState,
        addr: Ipv6Addr,
        regen: bool,
        out: &mut Vec<NdpTransmit>,
    ) {
        let key = state
            .ndp
            .slaac_prefixes
            .iter()
            .find(|(_, p)| p.temp_addrs.contains(&addr))
            .map(|(k, _)| *k);
        self.remove_slaac_bound_addr_locked(state, addr);
        let Some(key) = key else { return };
        let mut regen_addr = None;
        if let Some(pst) = state.ndp.slaac_prefixes.get_mut(&key) {
            pst.temp_addrs.remove(&addr);
            if regen && pst.temp_generation_attempts < MAX_SLAAC_ADDR_LOCAL_REGEN_ATTEMPTS {
                pst.temp_generation_attempts += 1;
                regen_addr = Some(address_from_iid(key.0, random_iid()));
            }
        }
        if let Some(new_addr) = regen_addr {
            if self.add_slaac_addr_locked(state, new_addr, AddressConfigType::SlaacTemp, false, out)
            {
                if let Some(pst) = state.ndp.slaac_prefixes.get_mut(&key) {
                    pst.temp_addrs.insert(new_addr);
                }
            }
        }
    }

    // Adds a SLAAC address in tentative state and starts DAD for it.
    // Returns false if the dispatcher vetoed it or assignment failed.
    fn add_slaac_addr_locked(
        self: &Arc<Self>,
        state: &mut NicState,
        addr: Ipv6Addr,
        config: AddressConfigType,
        deprecated: bool,
        out: &mut Vec<NdpTransmit>,
    ) -> bool {
        let cidr = IpCidr::new(IpAddress::Ipv6(addr), SLAAC_PREFIX_LEN);
        if let Some(d) = self.ndp_dispatcher() {
            if !d.on_auto_gen_address(self.id(), cidr) {
                return false;
            }
        }
        let Some(ep) = self.ipv6_endpoint() else {
            return false;
        };
        match ep.add_address(
            cidr,
            AddressProperties {
                peb: PrimaryEndpointBehavior::CanBePrimary,
                kind: AddressKind::PermanentTentative,
                config_type: config,
                deprecated,
            },
        ) {
            Ok(r) => drop(r),
            Err(err) => {
                tracing::debug!(nic = %self.id(), %addr, error = %err, "SLAAC address assignment failed");
                return false;
            }
        }
        self.start_dad_locked(state, addr, out);
        true
    }

    /// Auto-generates the link-local address at enable time (SLAAC over
    /// fe80::/64 with infinite lifetimes, EUI-64 from the link address).
    pub(crate) fn do_link_local_slaac_locked(
        self: &Arc<Self>,
        state: &mut NicState,
        out: &mut Vec<NdpTransmit>,
    ) {
        let addr = address_from_iid(
            link_local_prefix().address(),
            eui64_interface_id(self.link_address()),
        );
        let Some(ep) = self.ipv6_endpoint() else { return };
        if ep.has_address(IpAddress::Ipv6(addr)) {
            return;
        }
        self.add_slaac_addr_locked(state, addr, AddressConfigType::Slaac, false, out);
    }

    /// Processes a validated router advertisement from `src`.
    pub(crate) fn handle_router_advert(self: &Arc<Self>, src: Ipv6Addr, ra: RaInfo) {
        let Some(stack) = self.stack() else { return };
        // Hosts discover routers; routers do not.
        if stack.forwarding() {
            return;
        }
        let configs = stack.ndp_configs().clone();
        if !configs.handle_ras {
            return;
        }
        let mut out = Vec::new();
        {
            let mut state = self.state.write();
            if !state.enabled {
                return;
            }
            if configs.discover_default_routers {
                self.handle_default_router_locked(&mut state, src, ra.router_lifetime);
            }
            if let Some(pi) = &ra.prefix {
                if configs.discover_on_link_prefixes && pi.on_link {
                    self.handle_on_link_prefix_locked(&mut state, pi);
                }
                if pi.autonomous && configs.auto_gen_global_addresses {
                    self.do_slaac_locked(&mut state, &configs, pi, &mut out);
                }
            }
        }
        self.transmit_ndp(out);
    }

    fn handle_default_router_locked(
        self: &Arc<Self>,
        state: &mut NicState,
        router: Ipv6Addr,
        lifetime: Duration,
    ) {
        let dispatcher = self.ndp_dispatcher();
        if state.ndp.default_routers.contains_key(&router) {
            if lifetime == ZERO {
                state.ndp.default_routers.remove(&router);
                if let Some(d) = &dispatcher {
                    d.on_default_router_invalidated(self.id(), router);
                }
            } else {
                let timer = self
                    .schedule_nic_timer(lifetime, move |nic| nic.default_router_expired(router));
                if let Some(r) = state.ndp.default_routers.get_mut(&router) {
                    r._timer = timer;
                }
            }
            return;
        }
        if lifetime == ZERO
            || state.ndp.default_routers.len() >= MAX_DISCOVERED_DEFAULT_ROUTERS
        {
            return;
        }
        if let Some(d) = &dispatcher {
            if !d.on_default_router_discovered(self.id(), router) {
                return;
            }
        }
        tracing::debug!(nic = %self.id(), %router, lifetime = %lifetime, "discovered default router");
        let timer =
            self.schedule_nic_timer(lifetime, move |nic| nic.default_router_expired(router));
        state
            .ndp
            .default_routers
            .insert(router, DefaultRouterState { _timer: timer });
    }

    fn default_router_expired(self: Arc<Self>, router: Ipv6Addr) {
        let mut state = self.state.write();
        if state.ndp.default_routers.remove(&router).is_some() {
            if let Some(d) = self.ndp_dispatcher() {
                d.on_default_router_invalidated(self.id(), router);
            }
        }
    }

    fn handle_on_link_prefix_locked(self: &Arc<Self>, state: &mut NicState, pi: &RaPrefixInfo) {
        let len = pi.prefix.prefix_len();
        let network = mask_prefix(pi.prefix.address(), len);
        if is_link_local(&network) {
            return;
        }
        let key = (network, len);
        let cidr = Ipv6Cidr::new(network, len);
        let dispatcher = self.ndp_dispatcher();
        if state.ndp.on_link_prefixes.contains_key(&key) {
            match pi.valid {
                Some(d) if d == ZERO => {
                    state.ndp.on_link_prefixes.remove(&key);
                    if let Some(disp) = &dispatcher {
                        disp.on_on_link_prefix_invalidated(self.id(), cidr);
                    }
                }
                Some(d) => {
                    let timer =
                        self.schedule_nic_timer(d, move |nic| nic.on_link_prefix_expired(key));
                    if let Some(p) = state.ndp.on_link_prefixes.get_mut(&key) {
                        p._timer = timer;
                    }
                }
                None => {
                    if let Some(p) = state.ndp.on_link_prefixes.get_mut(&key) {
                        p._timer = None;
                    }
                }
            }
            return;
        }
        if matches!(pi.valid, Some(d) if d == ZERO) {
            return;
        }
        if let Some(disp) = &dispatcher {
            if !disp.on_on_link_prefix_discovered(self.id(), cidr) {
                return;
            }
        }
        let timer = pi
            .valid
            .and_then(|d| self.schedule_nic_timer(d, move |nic| nic.on_link_prefix_expired(key)));
        state
            .ndp
            .on_link_prefixes
            .insert(key, OnLinkPrefixState { _timer: timer });
    }

    fn on_link_prefix_expired(self: Arc<Self>, key: PrefixKey) {
        let mut state = self.state.write();
        if state.ndp.on_link_prefixes.remove(&key).is_some() {
            if let Some(d) = self.ndp_dispatcher() {
                d.on_on_link_prefix_invalidated(self.id(), Ipv6Cidr::new(key.0, key.1));
            }
        }
    }

    // Creates or refreshes SLAAC state for an autonomous prefix.
    fn do_slaac_locked(
        self: &Arc<Self>,
        state: &mut NicState,
        configs: &NdpConfigs,
        pi: &RaPrefixInfo,
        out: &mut Vec<NdpTransmit>,
    ) {
        let Some(stack) = self.stack() else { return };
        if pi.prefix.prefix_len() != SLAAC_PREFIX_LEN {
            return;
        }
        let network = mask_prefix(pi.prefix.address(), SLAAC_PREFIX_LEN);
        if is_link_local(&network) || network.is_unspecified() {
            return;
        }
        // RFC 4862 section 5.5.3.c: preferred must not exceed valid.
        if let (Some(p), Some(v)) = (pi.preferred, pi.valid) {
            if p > v {
                return;
            }
        }
        let key = (network, SLAAC_PREFIX_LEN);
        let now = stack.now();

        if state.ndp.slaac_prefixes.contains_key(&key) {
            self.refresh_slaac_prefix_locked(state, key, pi, now);
            return;
        }

        // New prefix: a zero valid lifetime generates nothing.
        if matches!(pi.valid, Some(d) if d == ZERO) {
            return;
        }
        let stable = address_from_iid(network, eui64_interface_id(self.link_address()));
        let deprecated = matches!(pi.preferred, Some(d) if d == ZERO);
        let invalidation_timer = pi
            .valid
            .and_then(|d| self.schedule_nic_timer(d, move |nic| nic.slaac_prefix_invalidated(key)));
        let deprecation_timer = match pi.preferred {
            Some(d) if d > ZERO => {
                self.schedule_nic_timer(d, move |nic| nic.slaac_prefix_deprecated(key))
            }
            _ => None,
        };
        state.ndp.slaac_prefixes.insert(
            key,
            SlaacPrefixState {
                _deprecation_timer: deprecation_timer,
                _invalidation_timer: invalidation_timer,
                valid_until: pi.valid.map(|d| now + d),
                stable_addr: None,
                generation_attempts: 0,
                temp_addrs: HashSet::new(),
                temp_generation_attempts: 0,
            },
        );
        if self.add_slaac_addr_locked(state, stable, AddressConfigType::Slaac, deprecated, out) {
            if let Some(pst) = state.ndp.slaac_prefixes.get_mut(&key) {
                pst.stable_addr = Some(stable);
            }
            if configs.auto_gen_temp_global_addresses && !deprecated {
                let temp = address_from_iid(network, random_iid());
                if self.add_slaac_addr_locked(state, temp, AddressConfigType::SlaacTemp, false, out)
                {
                    if let Some(pst) = state.ndp.slaac_prefixes.get_mut(&key) {
                        pst.temp_addrs.insert(temp);
                    }
                }
            }
        }
    }

    fn refresh_slaac_prefix_locked(
        self: &Arc<Self>,
        state: &mut NicState,
        key: PrefixKey,
        pi: &RaPrefixInfo,
        now: Instant,
    ) {
        let mut deprecate_now = false;
        let mut undeprecate = false;
        {
            let Some(pst) = state.ndp.slaac_prefixes.get_mut(&key) else {
                return;
            };
            match pi.valid {
                None => {
                    pst.valid_until = None;
                    pst._invalidation_timer = None;
                }
                Some(v) => {
                    let remaining = pst.valid_until.map(|t| {
                        if t > now {
                            t - now
                        } else {
                            ZERO
                        }
                    });
                    // Short advertised lifetimes never shrink the prefix;
                    // they only extend a shorter remaining lifetime.
                    let update = v >= MIN_PREFIX_VALID_LIFETIME_FOR_UPDATE
                        || remaining.is_some_and(|rem| v > rem);
                    if update {
                        pst.valid_until = Some(now + v);
                        pst._invalidation_timer = self
                            .schedule_nic_timer(v, move |nic| nic.slaac_prefix_invalidated(key));
                    }
                }
            }
            match pi.preferred {
                None => {
                    pst._deprecation_timer = None;
                    undeprecate = true;
                }
                Some(d) if d == ZERO => {
                    pst._deprecation_timer = None;
                    deprecate_now = true;
                }
                Some(d) => {
                    pst._deprecation_timer =
                        self.schedule_nic_timer(d, move |nic| nic.slaac_prefix_deprecated(key));
                    undeprecate = true;
                }
            }
        }
        if deprecate_now {
            self.set_slaac_deprecated_locked(state, key, true);
        } else if undeprecate {
            self.set_slaac_deprecated_locked(state, key, false);
        }
    }

    fn slaac_prefix_deprecated(self: Arc<Self>, key: PrefixKey) {
        let mut state = self.state.write();
        self.set_slaac_deprecated_locked(&mut state, key, true);
    }

    fn set_slaac_deprecated_locked(&self, state: &mut NicState, key: PrefixKey, deprecated: bool) {
        let Some(pst) = state.ndp.slaac_prefixes.get(&key) else {
            return;
        };
        let mut addrs: Vec<Ipv6Addr> = pst.temp_addrs.iter().copied().collect();
        if let Some(stable) = pst.stable_addr {
            addrs.push(stable);
        }
        let Some(ep) = self.ipv6_endpoint() else { return };
        for addr in addrs {
            if let Some(r) = ep.get_endpoint(IpAddress::Ipv6(addr)) {
                if r.deprecated() != deprecated {
                    r.set_deprecated(deprecated);
                    if deprecated {
                        if let Some(d) = self.ndp_dispatcher() {
                            d.on_auto_gen_address_deprecated(
                                self.id(),
                                IpCidr::new(IpAddress::Ipv6(addr), SLAAC_PREFIX_LEN),
                            );
                        }
                    }
                }
            }
        }
    }

    fn slaac_prefix_invalidated(self: Arc<Self>, key: PrefixKey) {
        let mut state = self.state.write();
        self.invalidate_slaac_prefix_locked(&mut state, key);
    }

    fn invalidate_slaac_prefix_locked(&self, state: &mut NicState, key: PrefixKey) {
        let Some(pst) = state.ndp.slaac_prefixes.remove(&key) else {
            return;
        };
        let mut addrs: Vec<Ipv6Addr> = pst.temp_addrs.iter().copied().collect();
        if let Some(stable) = pst.stable_addr {
            addrs.push(stable);
        }
        for addr in addrs {
            self.remove_slaac_bound_addr_locked(state, addr);
        }
    }

    /// Begins router solicitation; a no-op while already soliciting or when
    /// solicitation is disabled.
    pub(crate) fn start_soliciting_routers_locked(self: &Arc<Self>, state: &mut NicState) {
        let Some(stack) = self.stack() else { return };
        let configs = stack.ndp_configs();
        if state.ndp.rtr_solicit.is_some() || configs.max_rtr_solicitations == 0 {
            return;
        }
        let delay = random_delay(configs.max_rtr_solicitation_delay);
        let timer = self.schedule_nic_timer(delay, |nic| nic.rtr_solicit_timer_fired());
        state.ndp.rtr_solicit = Some(RtrSolicitState {
            remaining: configs.max_rtr_solicitations,
            _timer: timer,
        });
    }

    /// Stops router solicitation, cancelling any pending transmission.
    pub(crate) fn stop_soliciting_routers_locked(&self, state: &mut NicState) {
        state.ndp.rtr_solicit = None;
    }

    fn rtr_solicit_timer_fired(self: Arc<Self>) {
        let mut out = Vec::new();
        {
            let mut state = self.state.write();
            if !state.enabled {
                state.ndp.rtr_solicit = None;
                return;
            }
            let Some(stack) = self.stack() else { return };
            let src = self
                .ipv6_link_local_source()
                .unwrap_or(Ipv6Addr::UNSPECIFIED);
            let Some(rs) = &mut state.ndp.rtr_solicit else {
                return;
            };
            rs.remaining -= 1;
            out.push(NdpTransmit::RouterSolicit { src });
            if rs.remaining > 0 {
                rs._timer = self
                    .schedule_nic_timer(stack.ndp_configs().rtr_solicitation_interval, |nic| {
                        nic.rtr_solicit_timer_fired()
                    });
            } else {
                state.ndp.rtr_solicit = None;
            }
        }
        self.transmit_ndp(out);
    }

    /// Invalidates discovered NDP state: default routers, on-link prefixes,
    /// and SLAAC prefixes with their addresses. With `host_only` false
    /// (full cleanup, used on disable) in-progress DAD is aborted too.
    pub(crate) fn cleanup_ndp_state_locked(self: &Arc<Self>, state: &mut NicState, host_only: bool) {
        let slaac_keys: Vec<PrefixKey> = state.ndp.slaac_prefixes.keys().copied().collect();
        for key in slaac_keys {
            self.invalidate_slaac_prefix_locked(state, key);
        }
        let dispatcher = self.ndp_dispatcher();
        for (prefix, _) in state.ndp.on_link_prefixes.drain() {
            if let Some(d) = &dispatcher {
                d.on_on_link_prefix_invalidated(self.id(), Ipv6Cidr::new(prefix.0, prefix.1));
            }
        }
        for (router, _) in state.ndp.default_routers.drain() {
            if let Some(d) = &dispatcher {
                d.on_default_router_invalidated(self.id(), router);
            }
        }
        if !host_only {
            let addrs: Vec<Ipv6Addr> = state.ndp.dad.keys().copied().collect();
            for addr in addrs {
                self.stop_dad_locked(state, addr);
            }
        }
    }

    /// Router/host mode transition, driven by the stack's forwarding flag.
    /// Becoming a router stops soliciting and drops host-learned state;
    /// becoming a host starts soliciting (only while enabled).
    pub(crate) fn on_forwarding_changed(self: &Arc<Self>, forwarding: bool) {
        let mut state = self.state.write();
        if !state.enabled || self.ipv6_endpoint().is_none() {
            return;
        }
        if forwarding {
            self.stop_soliciting_routers_locked(&mut state);
            self.cleanup_ndp_state_locked(&mut state, true);
        } else {
            self.start_soliciting_routers_locked(&mut state);
        }
    }

    /// Emits collected NDP packets. Must be called with the NIC lock
    /// released.
    pub(crate) fn transmit_ndp(&self, items: Vec<NdpTransmit>) {
        for item in items {
            match item {
                NdpTransmit::NeighborSolicit { src, target } => {
                    let lladdr = (!src.is_unspecified())
                        .then(|| RawHardwareAddress::from(self.link_address()));
                    self.send_ndisc(
                        src,
                        solicited_node(&target),
                        None,
                        NdiscRepr::NeighborSolicit {
                            target_addr: target,
                            lladdr,
                        },
                    );
                }
                NdpTransmit::NeighborAdvert {
                    src,
                    dst,
                    dst_link,
                    target,
                    solicited,
                } => {
                    let mut flags = NdiscNeighborFlags::OVERRIDE;
                    if solicited {
                        flags |= NdiscNeighborFlags::SOLICITED;
                    }
                    if self.stack().is_some_and(|s| s.forwarding()) {
                        flags |= NdiscNeighborFlags::ROUTER;
                    }
                    self.send_ndisc(
                        src,
                        dst,
                        dst_link,
                        NdiscRepr::NeighborAdvert {
                            flags,
                            target_addr: target,
                            lladdr: Some(RawHardwareAddress::from(self.link_address())),
                        },
                    );
                }
                NdpTransmit::RouterSolicit { src } => {
                    let lladdr = (!src.is_unspecified())
                        .then(|| RawHardwareAddress::from(self.link_address()));
                    self.send_ndisc(
                        src,
                        ALL_ROUTERS_MULTICAST,
                        None,
                        NdiscRepr::RouterSolicit { lladdr },
                    );
                }
            }
        }
    }

    // Builds and writes one NDP packet. NDP always goes out with hop limit
    // 255 (RFC 4861 section 3).
    fn send_ndisc(
        &self,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        remote_link: Option<EthernetAddress>,
        repr: NdiscRepr<'_>,
    ) {
        let Some(remote_link) =
            remote_link.or_else(|| ethernet_multicast(&IpAddress::Ipv6(dst)))
        else {
            return;
        };
        let icmp_repr = Icmpv6Repr::Ndisc(repr);
        let mut buf = vec![0u8; IPV6_HEADER_LEN + icmp_repr.buffer_len()];
        let ip_repr = Ipv6Repr {
            src_addr: src,
            dst_addr: dst,
            next_header: IpProtocol::Icmpv6,
            payload_len: icmp_repr.buffer_len(),
            hop_limit: 255,
        };
        let mut ip_packet = Ipv6Packet::new_unchecked(&mut buf);
        ip_repr.emit(&mut ip_packet);
        let mut icmp_packet = Icmpv6Packet::new_unchecked(ip_packet.payload_mut());
        icmp_repr.emit(&src, &dst, &mut icmp_packet, &ChecksumCapabilities::default());
        let mut pkt = PacketBuffer::with_headroom(self.max_header_length(), &buf);
        pkt.mark_network_header(IPV6_HEADER_LEN);
        if let Err(err) =
            self.write_link_packet(self.link_address(), remote_link, IPV6_PROTOCOL_NUMBER, pkt)
        {
            tracing::debug!(nic = %self.id(), %dst, error = %err, "failed to write NDP packet");
        }
    }
}

// Masks `addr` down to its first `len` bits.
pub(crate) fn mask_prefix(addr: Ipv6Addr, len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let masked = if len == 0 {
        0
    } else if len >= 128 {
        bits
    } else {
        bits & (!0u128 << (128 - u32::from(len)))
    };
    Ipv6Addr::from(masked.to_be_bytes())
}

fn random_iid() -> [u8; 8] {
    let mut iid = [0u8; 8];
    getrandom::fill(&mut iid).expect("platform RNG");
    iid
}

fn random_delay(max: Duration) -> Duration {
    let max_millis = max.total_millis();
    if max_millis == 0 {
        return ZERO;
    }
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes).expect("platform RNG");
    Duration::from_millis(u64::from_le_bytes(bytes) % (max_millis + 1))
}
