// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The neighbor cache: link-address resolution state for one NIC.
//!
//! Entries move Incomplete → Reachable as confirmations (neighbor
//! advertisements, ARP replies) arrive, or Incomplete → Failed after the
//! probe retransmit budget runs out. Waiters attach either a oneshot sender
//! (the forwarder's resolution channel) or a task waker.
//!
//! Methods mutate under the cache lock and hand any completions back to the
//! caller as a [`Completion`], to be fired with no lock held.

use futures::channel::oneshot;
use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::net::IpAddr;
use std::task::Waker;
use parking_lot::Mutex;
use tcpip::time::Duration;
use tcpip::time::TimerHandle;
use tcpip::Error;

/// Upper bound on cache entries per NIC.
pub const NEIGHBOR_CACHE_SIZE: usize = 512;

/// Probe retransmits before a resolution attempt fails
/// (MAX_MULTICAST_SOLICIT, RFC 4861 section 10).
pub const MAX_PROBE_RETRANSMITS: u8 = 3;

/// Interval between probe retransmits (RetransTimer default, RFC 4861).
pub const PROBE_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Result delivered on a resolution channel.
pub type ResolutionResult = Result<EthernetAddress, Error>;

/// Reachability state of a neighbor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    /// Resolution in progress.
    Incomplete,
    /// A confirmation supplied the link address.
    Reachable,
    /// Administratively configured; never ages out.
    Static,
    /// Resolution failed.
    Failed,
}

/// A snapshot of one neighbor entry.
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    /// The neighbor's network address.
    pub addr: IpAddr,
    /// The link address, once known.
    pub link_addr: Option<EthernetAddress>,
    /// Current state.
    pub state: NeighborState,
}

struct Entry {
    state: NeighborState,
    link_addr: Option<EthernetAddress>,
    senders: Vec<oneshot::Sender<ResolutionResult>>,
    wakers: Vec<Waker>,
    retries_left: u8,
    timer: Option<TimerHandle>,
    order: u64,
}

impl Entry {
    fn take_waiters(&mut self) -> (Vec<oneshot::Sender<ResolutionResult>>, Vec<Waker>) {
        (
            std::mem::take(&mut self.senders),
            std::mem::take(&mut self.wakers),
        )
    }
}

/// Waiters detached from an entry, to be notified outside the cache lock.
#[derive(Default)]
pub(crate) struct Completion {
    senders: Vec<oneshot::Sender<ResolutionResult>>,
    wakers: Vec<Waker>,
}

impl Completion {
    fn from_entry(entry: &mut Entry) -> Self {
        let (senders, wakers) = entry.take_waiters();
        Self { senders, wakers }
    }

    /// True if nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty() && self.wakers.is_empty()
    }

    /// Delivers `result` to every waiter.
    pub fn complete(self, result: ResolutionResult) {
        for sender in self.senders {
            let _ = sender.send(result);
        }
        for waker in self.wakers {
            waker.wake();
        }
    }
}

pub(crate) enum ResolveResult {
    /// The link address is known.
    Ready(EthernetAddress),
    /// Resolution is pending; `new_probe` asks the caller to transmit a
    /// probe and arm the retransmit timer.
    Pending {
        rx: oneshot::Receiver<ResolutionResult>,
        new_probe: bool,
    },
}

pub(crate) enum ProbeTimeout {
    /// Send another probe and re-arm the timer.
    Retransmit,
    /// Out of retries; the entry is now Failed.
    Failed(Completion),
}

#[derive(Default)]
struct Inner {
    entries: HashMap<IpAddr, Entry>,
    seq: u64,
}

/// A bounded per-NIC neighbor cache.
pub struct NeighborCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl NeighborCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    /// Snapshots every entry.
    pub fn entries(&self) -> Vec<NeighborEntry> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(addr, e)| NeighborEntry {
                addr: *addr,
                link_addr: e.link_addr,
                state: e.state,
            })
            .collect()
    }

    pub(crate) fn add_static_entry(&self, addr: IpAddr, link_addr: EthernetAddress) -> Completion {
        let mut inner = self.inner.lock();
        let seq = Self::next_order(&mut inner);
        Self::make_room(&mut inner, addr, self.capacity);
        let entry = inner.entries.entry(addr).or_insert_with(|| Entry {
            state: NeighborState::Static,
            link_addr: None,
            senders: Vec::new(),
            wakers: Vec::new(),
            retries_left: 0,
            timer: None,
            order: seq,
        });
        entry.state = NeighborState::Static;
        entry.link_addr = Some(link_addr);
        entry.timer = None;
        Completion::from_entry(entry)
    }

    pub(crate) fn remove_entry(&self, addr: IpAddr) -> Result<Completion, Error> {
        let mut inner = self.inner.lock();
        let mut entry = inner.entries.remove(&addr).ok_or(Error::BadAddress)?;
        Ok(Completion::from_entry(&mut entry))
    }

    pub(crate) fn clear(&self) -> Vec<Completion> {
        let mut inner = self.inner.lock();
        inner
            .entries
            .drain()
            .map(|(_, mut e)| Completion::from_entry(&mut e))
            .collect()
    }

    /// Registers `waker` to be woken when resolution of `addr` completes.
    /// Wakes it immediately if the entry is already resolved.
    pub(crate) fn add_waker(&self, addr: IpAddr, waker: &Waker) {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&addr) {
            Some(e) if e.state == NeighborState::Incomplete => e.wakers.push(waker.clone()),
            _ => waker.wake_by_ref(),
        }
    }

    /// Drops a previously registered waker.
    pub(crate) fn remove_waker(&self, addr: IpAddr, waker: &Waker) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.entries.get_mut(&addr) {
            e.wakers.retain(|w| !w.will_wake(waker));
        }
    }

    pub(crate) fn resolve(&self, addr: IpAddr) -> ResolveResult {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&addr) {
            match entry.state {
                NeighborState::Reachable | NeighborState::Static => {
                    if let Some(link) = entry.link_addr {
                        return ResolveResult::Ready(link);
                    }
                }
                NeighborState::Incomplete => {
                    let (tx, rx) = oneshot::channel();
                    entry.senders.push(tx);
                    return ResolveResult::Pending {
                        rx,
                        new_probe: false,
                    };
                }
                NeighborState::Failed => {
                    // Restart resolution below.
                }
            }
        }
        let seq = Self::next_order(&mut inner);
        Self::make_room(&mut inner, addr, self.capacity);
        let (tx, rx) = oneshot::channel();
        inner.entries.insert(
            addr,
            Entry {
                state: NeighborState::Incomplete,
                link_addr: None,
                senders: vec![tx],
                wakers: Vec::new(),
                retries_left: MAX_PROBE_RETRANSMITS,
                timer: None,
                order: seq,
            },
        );
        ResolveResult::Pending {
            rx,
            new_probe: true,
        }
    }

    /// Stores the retransmit-timer handle for an in-progress resolution.
    pub(crate) fn set_probe_timer(&self, addr: IpAddr, timer: TimerHandle) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&addr) {
            if entry.state == NeighborState::Incomplete {
                entry.timer = Some(timer);
            }
        }
    }

    /// A confirmation carrying the neighbor's link address arrived.
    pub(crate) fn handle_confirmation(
        &self,
        addr: IpAddr,
        link_addr: EthernetAddress,
    ) -> Completion {
        let mut inner = self.inner.lock();
        let seq = Self::next_order(&mut inner);
        Self::make_room(&mut inner, addr, self.capacity);
        let entry = inner.entries.entry(addr).or_insert_with(|| Entry {
            state: NeighborState::Reachable,
            link_addr: None,
            senders: Vec::new(),
            wakers: Vec::new(),
            retries_left: 0,
            timer: None,
            order: seq,
        });
        if entry.state == NeighborState::Static {
            return Completion::default();
        }
        entry.state = NeighborState::Reachable;
        entry.link_addr = Some(link_addr);
        entry.timer = None;
        Completion::from_entry(entry)
    }

    /// The probe retransmit timer for `addr` fired.
    pub(crate) fn probe_timeout(&self, addr: IpAddr) -> Option<ProbeTimeout> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&addr)?;
        if entry.state != NeighborState::Incomplete {
            return None;
        }
        if entry.retries_left > 0 {
            entry.retries_left -= 1;
            Some(ProbeTimeout::Retransmit)
        } else {
            entry.state = NeighborState::Failed;
            entry.timer = None;
            Some(ProbeTimeout::Failed(Completion::from_entry(entry)))
        }
    }

    fn next_order(inner: &mut Inner) -> u64 {
        inner.seq += 1;
        inner.seq
    }

    // Evicts the oldest non-static entry when at capacity. Waiters of an
    // evicted incomplete entry observe a dropped channel and give up.
    fn make_room(inner: &mut Inner, incoming: IpAddr, capacity: usize) {
        if inner.entries.contains_key(&incoming) || inner.entries.len() < capacity {
            return;
        }
        let victim = inner
            .entries
            .iter()
            .filter(|(_, e)| e.state != NeighborState::Static)
            .min_by_key(|(_, e)| e.order)
            .map(|(addr, _)| *addr);
        if let Some(addr) = victim {
            if let Some(mut entry) = inner.entries.remove(&addr) {
                for waker in std::mem::take(&mut entry.wakers) {
                    waker.wake();
                }
            }
        }
    }
}
