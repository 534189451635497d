// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Base vocabulary for the userspace TCP/IP stack: error kinds, protocol
//! numbers, the packet buffer, the clock/timer abstraction, and statistics
//! counters. Everything here is shared between the stack core and link
//! drivers and carries no protocol logic of its own.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod stats;
pub mod time;

use std::fmt;
use thiserror::Error;

/// Identifier of a NIC, unique within its owning stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NicId(pub u32);

impl fmt::Display for NicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A network-layer protocol number. These are ethertypes, matching what the
/// link layer carries on the wire.
pub type NetworkProtocolNumber = u16;

/// A transport-layer protocol number (IP protocol field).
pub type TransportProtocolNumber = u8;

/// Ethertype of IPv4.
pub const IPV4_PROTOCOL_NUMBER: NetworkProtocolNumber = 0x0800;

/// Ethertype of IPv6.
pub const IPV6_PROTOCOL_NUMBER: NetworkProtocolNumber = 0x86dd;

/// The distinguished "every ethertype" key used by packet-socket
/// registration, after the ETH_P_ALL convention.
pub const ETHERNET_PROTOCOL_ALL: NetworkProtocolNumber = 0x0003;

/// Errors surfaced by the stack's administrative and lookup APIs.
///
/// Dataplane anomalies (malformed packets, unknown destinations) are counted
/// in [`stats`] and dropped rather than reported through this type.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No protocol engine registered for the requested protocol number.
    #[error("unknown protocol")]
    UnknownProtocol,
    /// The NIC id does not name a NIC in this stack.
    #[error("unknown NIC")]
    UnknownNic,
    /// A NIC with this id already exists.
    #[error("duplicate NIC id")]
    DuplicateNicId,
    /// The address is already assigned in an incompatible kind.
    #[error("duplicate address")]
    DuplicateAddress,
    /// The address is not present, or not in a removable kind.
    #[error("bad local address")]
    BadLocalAddress,
    /// The referenced entry (e.g. a neighbor) does not exist.
    #[error("bad address")]
    BadAddress,
    /// The endpoint is not in a state where the operation is legal.
    #[error("invalid endpoint state")]
    InvalidEndpointState,
    /// The capability backing this operation is missing.
    #[error("operation not supported")]
    NotSupported,
    /// No route to the destination.
    #[error("no route to host")]
    NoRoute,
    /// The operation would block; for link-address resolution the caller
    /// recovers by waiting on the resolution channel.
    #[error("operation would block")]
    WouldBlock,
}
