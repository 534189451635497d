// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Packet and error counters.
//!
//! Counters are relaxed atomics; they are incremented from the dataplane
//! without any lock and read by whoever is inspecting the stack.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A monotonically increasing event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Adds one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Adds `n`.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// The current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Packet and byte counts for one direction of one NIC.
#[derive(Debug, Default)]
pub struct DirectionStats {
    /// Packets seen.
    pub packets: Counter,
    /// Bytes seen.
    pub bytes: Counter,
}

/// Per-NIC counters.
#[derive(Debug, Default)]
pub struct NicStats {
    /// Frames delivered up from the link.
    pub rx: DirectionStats,
    /// Frames handed down to the link.
    pub tx: DirectionStats,
    /// Frames that arrived while the NIC was disabled.
    pub disabled_rx: DirectionStats,
}

/// IP-layer counters shared by IPv4 and IPv6.
#[derive(Debug, Default)]
pub struct IpStats {
    /// IP packets received on any NIC.
    pub packets_received: Counter,
    /// IP packets sent out any NIC.
    pub packets_sent: Counter,
    /// Packets dropped because their source is an address of the receiving
    /// NIC (with handle-local enabled).
    pub invalid_source_addresses_received: Counter,
    /// Packets whose destination matched nothing local and could not be
    /// forwarded.
    pub invalid_destination_addresses_received: Counter,
    /// Failures writing a forwarded or routed packet out its link.
    pub outgoing_packet_errors: Counter,
}

/// Stack-wide counters.
#[derive(Debug, Default)]
pub struct StackStats {
    /// Frames carrying an ethertype no network engine claims.
    pub unknown_protocol_rcvd_packets: Counter,
    /// Packets the network or transport parser rejected.
    pub malformed_rcvd_packets: Counter,
    /// Packets dropped by the forwarder when link-address resolution
    /// failed.
    pub dropped_packets: Counter,
    /// IP-layer counters.
    pub ip: IpStats,
}
