// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-protocol address tables and reference-counted address endpoints.
//!
//! Each network endpoint embeds an [`AddressTable`]. Lookups return an
//! [`AddressRef`], a handle that keeps the underlying [`AddressEntry`] alive
//! independently of table membership: removing an address expires it and
//! drops the table's reference, but outstanding handles stay usable until
//! each is dropped. Resurrection is forbidden — once an entry's count hits
//! zero it can never be referenced again.

use parking_lot::Mutex;
use parking_lot::RwLock;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpCidr;
use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::ops::Deref;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use tcpip::Error;

/// Assignment state of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// Administratively assigned and fully usable.
    Permanent,
    /// Assigned, but Duplicate Address Detection has not finished; must not
    /// be used as a source address and must not be answered for.
    PermanentTentative,
    /// Logically removed from the table but still referenced.
    PermanentExpired,
    /// Synthesized on the fly for a spoofing or promiscuous lookup.
    Temporary,
}

/// How an address came to be assigned, which determines its teardown
/// obligations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressConfigType {
    /// Explicitly configured.
    Static,
    /// Generated by stateless autoconfiguration.
    Slaac,
    /// A temporary (privacy) stateless autoconfiguration address.
    SlaacTemp,
}

/// Eligibility of an address for primary (source) selection. Within each
/// class, most recently added wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryEndpointBehavior {
    /// Wins over every CanBePrimary address.
    FirstPrimary,
    /// Eligible in addition order.
    CanBePrimary,
    /// Never selected as primary, but still matched by directed lookups.
    NeverPrimary,
}

/// Properties supplied when assigning an address.
#[derive(Debug, Clone, Copy)]
pub struct AddressProperties {
    /// Primary-selection class.
    pub peb: PrimaryEndpointBehavior,
    /// Initial assignment state.
    pub kind: AddressKind,
    /// Configuration source.
    pub config_type: AddressConfigType,
    /// Whether the address starts out deprecated.
    pub deprecated: bool,
}

impl Default for AddressProperties {
    fn default() -> Self {
        Self {
            peb: PrimaryEndpointBehavior::CanBePrimary,
            kind: AddressKind::Permanent,
            config_type: AddressConfigType::Static,
            deprecated: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryState {
    kind: AddressKind,
    config_type: AddressConfigType,
    deprecated: bool,
}

/// One assigned (or referenced-but-expired) address.
#[derive(Debug)]
pub struct AddressEntry {
    addr: IpCidr,
    refs: AtomicUsize,
    state: Mutex<EntryState>,
    table: Weak<TableInner>,
}

impl AddressEntry {
    /// The address with its prefix.
    pub fn address_with_prefix(&self) -> IpCidr {
        self.addr
    }

    /// The address itself.
    pub fn address(&self) -> IpAddress {
        self.addr.address()
    }

    /// Current assignment state.
    pub fn kind(&self) -> AddressKind {
        self.state.lock().kind
    }

    /// Changes the assignment state (e.g. tentative to permanent when DAD
    /// completes).
    pub fn set_kind(&self, kind: AddressKind) {
        self.state.lock().kind = kind;
    }

    /// How this address was configured.
    pub fn config_type(&self) -> AddressConfigType {
        self.state.lock().config_type
    }

    /// Whether the address is deprecated for new connections.
    pub fn deprecated(&self) -> bool {
        self.state.lock().deprecated
    }

    /// Sets or clears deprecation.
    pub fn set_deprecated(&self, deprecated: bool) {
        self.state.lock().deprecated = deprecated;
    }

    /// Whether the address may be used: permanent and temporary addresses
    /// always; tentative and expired ones only when `allow_unassigned`
    /// (the spoofing/promiscuous bit of the requesting lookup) is set.
    pub fn is_assigned(&self, allow_unassigned: bool) -> bool {
        match self.kind() {
            AddressKind::Permanent | AddressKind::Temporary => true,
            AddressKind::PermanentTentative | AddressKind::PermanentExpired => allow_unassigned,
        }
    }

    /// The current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Takes a reference unless the count has already reached zero.
    fn try_inc_ref(&self) -> bool {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self
                .refs
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn dec_ref(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev - 1
    }
}

/// A live reference to an [`AddressEntry`]. Dropping it releases the
/// reference; the entry is freed once the table and every holder are done
/// with it.
#[derive(Debug)]
pub struct AddressRef {
    entry: Arc<AddressEntry>,
}

impl AddressRef {
    /// Wraps `entry`, whose count has already been incremented on the
    /// caller's behalf.
    fn adopt(entry: Arc<AddressEntry>) -> Self {
        Self { entry }
    }

    /// The referenced entry.
    pub fn entry(&self) -> &Arc<AddressEntry> {
        &self.entry
    }
}

impl Deref for AddressRef {
    type Target = AddressEntry;

    fn deref(&self) -> &AddressEntry {
        &self.entry
    }
}

impl Clone for AddressRef {
    fn clone(&self) -> Self {
        self.entry.inc_ref();
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl Drop for AddressRef {
    fn drop(&mut self) {
        if self.entry.dec_ref() == 0 {
            // Last reference to a temporary (or expired) entry; if the table
            // still indexes it, unlink it. try_inc_ref can no longer
            // succeed, so the unlink cannot race with a resurrection.
            if let Some(table) = self.entry.table.upgrade() {
                table.unlink_if_dead(&self.entry);
            }
        }
    }
}

#[derive(Default)]
struct Lists {
    // Both lists are LIFO: newest at index 0.
    first_primary: Vec<Arc<AddressEntry>>,
    can_be_primary: Vec<Arc<AddressEntry>>,
}

impl Lists {
    fn insert(&mut self, entry: Arc<AddressEntry>, peb: PrimaryEndpointBehavior) {
        match peb {
            PrimaryEndpointBehavior::FirstPrimary => self.first_primary.insert(0, entry),
            PrimaryEndpointBehavior::CanBePrimary => self.can_be_primary.insert(0, entry),
            PrimaryEndpointBehavior::NeverPrimary => {}
        }
    }

    fn remove(&mut self, entry: &Arc<AddressEntry>) {
        self.first_primary.retain(|e| !Arc::ptr_eq(e, entry));
        self.can_be_primary.retain(|e| !Arc::ptr_eq(e, entry));
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<AddressEntry>> {
        self.first_primary.iter().chain(self.can_be_primary.iter())
    }
}

#[derive(Default)]
struct TableState {
    entries: HashMap<IpAddr, Arc<AddressEntry>>,
    lists: Lists,
}

struct TableInner {
    state: RwLock<TableState>,
}

impl TableInner {
    fn unlink_if_dead(&self, entry: &Arc<AddressEntry>) {
        let mut state = self.state.write();
        let key = ip_key(&entry.address());
        if let Some(current) = state.entries.get(&key) {
            if Arc::ptr_eq(current, entry) && entry.ref_count() == 0 {
                state.entries.remove(&key);
                state.lists.remove(entry);
            }
        }
    }
}

/// The set of addresses assigned for one protocol on one NIC.
pub struct AddressTable {
    inner: Arc<TableInner>,
}

impl AddressTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                state: RwLock::new(TableState::default()),
            }),
        }
    }

    /// Assigns `addr`. Fails with [`Error::DuplicateAddress`] if the address
    /// is already permanently assigned; an existing temporary entry is
    /// promoted in place, overwriting its properties.
    pub fn add(&self, addr: IpCidr, props: AddressProperties) -> Result<AddressRef, Error> {
        let key = ip_key(&addr.address());
        let mut state = self.inner.state.write();
        if let Some(existing) = state.entries.get(&key).cloned() {
            match existing.kind() {
                AddressKind::Temporary if props.kind != AddressKind::Temporary => {
                    // Promote: the table now owns a reference it did not
                    // hold for the temporary entry.
                    existing.inc_ref();
                    *existing.state.lock() = EntryState {
                        kind: props.kind,
                        config_type: props.config_type,
                        deprecated: props.deprecated,
                    };
                    state.lists.remove(&existing);
                    state.lists.insert(existing.clone(), props.peb);
                    existing.inc_ref();
                    return Ok(AddressRef::adopt(existing));
                }
                _ => return Err(Error::DuplicateAddress),
            }
        }

        let entry = Arc::new(AddressEntry {
            addr,
            // One reference for the table (unless temporary), one for the
            // returned handle.
            refs: AtomicUsize::new(if props.kind == AddressKind::Temporary {
                1
            } else {
                2
            }),
            state: Mutex::new(EntryState {
                kind: props.kind,
                config_type: props.config_type,
                deprecated: props.deprecated,
            }),
            table: Arc::downgrade(&self.inner),
        });
        state.entries.insert(key, entry.clone());
        state.lists.insert(entry.clone(), props.peb);
        Ok(AddressRef::adopt(entry))
    }

    /// Removes a permanent or tentative address, expiring it. Fails with
    /// [`Error::BadLocalAddress`] if the address is absent or not in a
    /// removable kind.
    pub fn remove(&self, addr: IpAddress) -> Result<(), Error> {
        let key = ip_key(&addr);
        let entry = {
            let mut state = self.inner.state.write();
            let entry = state
                .entries
                .get(&key)
                .cloned()
                .ok_or(Error::BadLocalAddress)?;
            match entry.kind() {
                AddressKind::Permanent | AddressKind::PermanentTentative => {}
                _ => return Err(Error::BadLocalAddress),
            }
            state.entries.remove(&key);
            state.lists.remove(&entry);
            entry
        };
        entry.set_kind(AddressKind::PermanentExpired);
        // Drop the table's reference outside the table lock.
        entry.dec_ref();
        Ok(())
    }

    /// True if `addr` is assigned as a permanent or tentative address.
    pub fn has(&self, addr: IpAddress) -> bool {
        let state = self.inner.state.read();
        state
            .entries
            .get(&ip_key(&addr))
            .is_some_and(|e| {
                matches!(
                    e.kind(),
                    AddressKind::Permanent | AddressKind::PermanentTentative
                )
            })
    }

    /// Looks up `addr` without regard to assignment state.
    pub fn get(&self, addr: IpAddress) -> Option<AddressRef> {
        let state = self.inner.state.read();
        let entry = state.entries.get(&ip_key(&addr))?;
        entry
            .try_inc_ref()
            .then(|| AddressRef::adopt(entry.clone()))
    }

    /// Looks up an assigned endpoint for `addr`.
    ///
    /// Falls back to the IPv4 directed broadcast of any assigned prefix and
    /// the all-ones broadcast, and synthesizes a temporary entry when
    /// `allow_temp` is set (the spoofing/promiscuous bit also widens what
    /// counts as assigned).
    pub fn get_assigned(
        &self,
        addr: IpAddress,
        allow_temp: bool,
        temp_peb: PrimaryEndpointBehavior,
    ) -> Option<AddressRef> {
        {
            let state = self.inner.state.read();
            if let Some(entry) = state.entries.get(&ip_key(&addr)) {
                if entry.is_assigned(allow_temp) && entry.try_inc_ref() {
                    return Some(AddressRef::adopt(entry.clone()));
                }
            }
            if let IpAddress::Ipv4(v4) = addr {
                if let Some(entry) = lookup_ipv4_broadcast(&state, v4) {
                    if entry.try_inc_ref() {
                        return Some(AddressRef::adopt(entry));
                    }
                }
            }
        }
        if !allow_temp {
            return None;
        }
        // Spoofing or promiscuous lookup that missed: synthesize a
        // temporary endpoint for the address.
        let prefix_len = match addr {
            IpAddress::Ipv4(_) => 32,
            IpAddress::Ipv6(_) => 128,
        };
        match self.add(
            IpCidr::new(addr, prefix_len),
            AddressProperties {
                peb: temp_peb,
                kind: AddressKind::Temporary,
                config_type: AddressConfigType::Static,
                deprecated: false,
            },
        ) {
            Ok(r) => Some(r),
            // Lost a race with a concurrent insert; retry the direct hit.
            Err(_) => self.get(addr),
        }
    }

    /// Selects the primary endpoint for traffic toward `remote`.
    ///
    /// IPv6 selection follows the RFC 6724 section 5 rules this table can
    /// evaluate (prefer same address, then matching scope, then
    /// non-deprecated); other lookups prefer the first non-deprecated
    /// candidate, falling back to the first deprecated one.
    pub fn primary(&self, remote: Option<IpAddress>, spoofing: bool) -> Option<AddressRef> {
        let candidates: Vec<Arc<AddressEntry>> = {
            let state = self.inner.state.read();
            state.lists.iter().cloned().collect()
        };
        let mut ranked: Vec<(u32, Arc<AddressEntry>)> = candidates
            .into_iter()
            .filter(|e| e.is_assigned(spoofing))
            .map(|e| (sas_rank(&e, remote.as_ref()), e))
            .collect();
        ranked.sort_by_key(|(rank, _)| *rank);
        for (_, entry) in ranked {
            if entry.try_inc_ref() {
                return Some(AddressRef::adopt(entry));
            }
        }
        None
    }

    /// Every address in the table.
    pub fn all(&self) -> Vec<IpCidr> {
        let state = self.inner.state.read();
        state.entries.values().map(|e| e.addr).collect()
    }

    /// Addresses eligible for primary selection, in primacy order.
    pub fn primary_addresses(&self) -> Vec<IpCidr> {
        let state = self.inner.state.read();
        state.lists.iter().map(|e| e.addr).collect()
    }
}

impl Default for AddressTable {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup_ipv4_broadcast(state: &TableState, addr: Ipv4Addr) -> Option<Arc<AddressEntry>> {
    if addr.is_broadcast() {
        // All-ones broadcast: attribute to the first assigned primary
        // endpoint.
        return state
            .lists
            .iter()
            .find(|e| {
                matches!(e.address(), IpAddress::Ipv4(_)) && e.is_assigned(false)
            })
            .cloned();
    }
    let addr = u32::from(addr);
    state
        .entries
        .values()
        .find(|e| {
            let IpAddress::Ipv4(assigned) = e.address() else {
                return false;
            };
            let prefix_len = e.addr.prefix_len();
            if prefix_len >= 31 || !e.is_assigned(false) {
                return false;
            }
            let mask = !0u32 << (32 - u32::from(prefix_len));
            let network = u32::from(assigned) & mask;
            addr == network | !mask
        })
        .cloned()
}

// Lower ranks win. Stable sort preserves primacy order among equals.
fn sas_rank(entry: &AddressEntry, remote: Option<&IpAddress>) -> u32 {
    let mut rank = 0;
    if entry.deprecated() {
        rank += 1;
    }
    if let (IpAddress::Ipv6(local), Some(IpAddress::Ipv6(remote))) = (entry.address(), remote) {
        // Rule 2: prefer appropriate scope.
        if ipv6_scope(&local) != ipv6_scope(remote) {
            rank += 2;
        }
        // Rule 1: prefer same address.
        if local != *remote {
            rank += 4;
        }
    }
    rank
}

// Address scope per RFC 4007 / RFC 6724 section 3.1, collapsed to the
// distinctions source selection needs.
fn ipv6_scope(addr: &Ipv6Addr) -> u8 {
    if addr.is_multicast() {
        addr.octets()[1] & 0x0f
    } else if addr.is_loopback() || (addr.segments()[0] & 0xffc0) == 0xfe80 {
        // Link-local scope.
        0x02
    } else {
        // Global (unique-local addresses count as global scope).
        0x0e
    }
}

fn ip_key(addr: &IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(a) => IpAddr::V4(*a),
        IpAddress::Ipv6(a) => IpAddr::V6(*a),
    }
}
