// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A userspace TCP/IP stack core, centered on the per-interface NIC object.
//!
//! The NIC binds a link-layer transport to the network-layer protocol
//! engines configured on its owning [`stack::Stack`]: it owns the addresses
//! assigned to the interface, dispatches received frames into protocol and
//! packet endpoints, forwards packets between interfaces when routing is
//! enabled, and drives IPv6 Neighbor Discovery (DAD, SLAAC, router and
//! prefix discovery) for the interface.
//!
//! Wire parsing and emission go through `smoltcp`'s typed representations;
//! timers are sans-io (see [`tcpip::time`]) and are driven by the embedder
//! through [`stack::Stack::handle_timers`].

#![forbid(unsafe_code)]

pub mod addresses;
pub mod ipv4;
pub mod ipv6;
pub mod link;
pub mod ndp;
pub mod neighbor;
pub mod nic;
pub mod protocol;
pub mod route;
pub mod stack;

#[cfg(test)]
mod testutil;
