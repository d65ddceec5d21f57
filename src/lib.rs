// Part of ecrt. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Native implementation of the EtherCAT master's datagram transport and
//! process-data engine.
//!
//! EtherCAT is an Ethernet-based fieldbus system, originally invented by
//! Beckhoff GmbH but now used by numerous providers of automation related
//! hardware.  This crate implements the lower half of a master: it builds
//! the addressed protocol datagrams, multiplexes them onto frames, matches
//! the responses that return from the slave ring, validates working
//! counters and aggregates cyclic process data into domains.
//!
//! The entry point is [`Master`], which owns the datagrams, the domains
//! and the dispatch machinery on top of a [`Transport`].  A real-time
//! cycle drives it with `receive` / `Domain::process` / `Domain::queue` /
//! `send`, once per tick.  Mailbox-style protocols issue standalone
//! datagrams through `add_datagram` / `submit` and poll their state.

mod datagram;
mod dispatcher;
mod domain;
mod frame;
mod master;
mod transport;
mod types;

pub use self::{
    datagram::{Command, Datagram, DatagramState, Payload},
    master::{Domain, Master},
    transport::{Loopback, Transport, TransportError},
    types::*,
};
