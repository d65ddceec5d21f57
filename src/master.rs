// Part of ecrt. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The master: ownership root for datagrams, domains and the
//! dispatcher, and the facade the real-time cycle drives.
//!
//! One master serves one physical network; several masters are
//! independent and may live on separate threads.  Within one master
//! everything below is meant for the single cycle-driving context.

use log::*;
use std::time::{Duration, Instant};

use crate::datagram::{Arena, Datagram, DatagramState};
use crate::dispatcher::Dispatcher;
use crate::domain::DomainImage;
use crate::transport::Transport;
use crate::types::*;

pub struct Master {
    transport: Box<dyn Transport>,
    datagrams: Arena,
    domains: Vec<DomainImage>,
    dispatcher: Dispatcher,
    epoch: Instant,
    active: bool,
}

// XXX missing: distributed-clock offsets, redundant second link

impl Master {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Master {
            transport,
            datagrams: Arena::default(),
            domains: Vec::new(),
            dispatcher: Dispatcher::new(),
            epoch: Instant::now(),
            active: false,
        }
    }

    /// Monotonic timestamp fed into the engine; all deadline logic
    /// works on explicit timestamps, never on an ambient clock.
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Deadline for responses, measured from transmission.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.dispatcher.set_timeout(timeout.as_nanos() as u64);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn create_domain(&mut self) -> Result<DomainIdx> {
        if self.active {
            return Err(Error::Activated);
        }
        let idx = DomainIdx::from(self.domains.len());
        self.domains.push(DomainImage::new(idx));
        Ok(idx)
    }

    pub fn domain(&mut self, idx: DomainIdx) -> Domain {
        Domain { master: self, idx }
    }

    fn image(&self, idx: DomainIdx) -> Result<&DomainImage> {
        self.domains
            .get(usize::from(idx))
            .ok_or(Error::NoDomain(usize::from(idx)))
    }

    fn image_mut(&mut self, idx: DomainIdx) -> Result<&mut DomainImage> {
        self.domains
            .get_mut(usize::from(idx))
            .ok_or(Error::NoDomain(usize::from(idx)))
    }

    /// Take ownership of a standalone datagram, e.g. for a mailbox
    /// exchange outside any domain.  The caller keeps the handle and
    /// is responsible for removing it again.
    pub fn add_datagram(&mut self, datagram: Datagram) -> DatagramHandle {
        self.datagrams.insert(datagram)
    }

    pub fn remove_datagram(&mut self, handle: DatagramHandle) -> Result<Datagram> {
        match self.datagrams.get(handle)?.state() {
            DatagramState::Queued | DatagramState::Sent => Err(Error::InFlight),
            _ => self.datagrams.remove(handle),
        }
    }

    pub fn datagram(&self, handle: DatagramHandle) -> Result<&Datagram> {
        self.datagrams.get(handle)
    }

    /// Payload bytes of a datagram, following a domain-bound payload
    /// into the image.  Not available while the datagram is on the
    /// wire.
    pub fn datagram_data(&self, handle: DatagramHandle) -> Result<&[u8]> {
        let datagram = self.datagrams.get(handle)?;
        match datagram.state() {
            DatagramState::Queued | DatagramState::Sent => Err(Error::InFlight),
            _ => Ok(datagram.payload_bytes(&self.domains)),
        }
    }

    pub fn datagram_data_mut(&mut self, handle: DatagramHandle) -> Result<&mut [u8]> {
        let datagram = self.datagrams.get_mut(handle)?;
        match datagram.state() {
            DatagramState::Queued | DatagramState::Sent => Err(Error::InFlight),
            _ => Ok(datagram.payload_bytes_mut(&mut self.domains)),
        }
    }

    /// Queue a standalone datagram for the next `send`.
    pub fn submit(&mut self, handle: DatagramHandle) -> Result<()> {
        self.dispatcher.submit(&mut self.datagrams, handle)?;
        Ok(())
    }

    /// Withdraw a still-queued datagram.
    pub fn cancel(&mut self, handle: DatagramHandle) -> Result<()> {
        self.dispatcher.cancel(&mut self.datagrams, handle)
    }

    /// Finalize all domains and enter the cyclic phase; the domain
    /// layout is frozen from here on.
    pub fn activate(&mut self) -> Result<()> {
        if self.active {
            return Err(Error::Activated);
        }
        for domain in &mut self.domains {
            if !domain.finalized() {
                domain.finalize(&mut self.datagrams, None)?;
            }
        }
        self.active = true;
        info!("master activated with {} domain(s)", self.domains.len());
        Ok(())
    }

    /// Drop all domains and their datagrams and return to the
    /// configuration phase.  Outstanding exchanges are forgotten.
    pub fn deactivate(&mut self) -> Result<()> {
        self.dispatcher.reset();
        for domain in &mut self.domains {
            domain.clear(&mut self.datagrams);
        }
        self.domains.clear();
        self.active = false;
        Ok(())
    }

    /// Transmit all queued datagrams.  Called once per cycle, before
    /// the round-trip budget.
    pub fn send(&mut self) -> Result<usize> {
        let now = self.now_ns();
        self.dispatcher
            .flush(&mut self.datagrams, &self.domains, self.transport.as_mut(), now)
    }

    /// Drain and reconcile responses.  Called once per cycle, after
    /// the round-trip budget; returns the number of matched datagrams.
    pub fn receive(&mut self) -> Result<usize> {
        let now = self.now_ns();
        self.dispatcher.process_responses(
            &mut self.datagrams,
            &mut self.domains,
            self.transport.as_mut(),
            now,
        )
    }

    /// The aggregated image of a domain, only while it is a coherent
    /// snapshot (finalized, and fully resolved if a cycle ran).
    pub fn domain_data(&mut self, idx: DomainIdx) -> Result<&mut [u8]> {
        let domain = self.image_mut(idx)?;
        if !domain.finalized() {
            Err(Error::NotFinalized)
        } else if !domain.resolved() {
            Err(Error::Incomplete)
        } else {
            Ok(domain.image_mut())
        }
    }
}

/// Borrow-view of one domain, in the style of the master's other
/// configuration handles.
pub struct Domain<'m> {
    master: &'m mut Master,
    idx: DomainIdx,
}

impl<'m> Domain<'m> {
    pub fn index(&self) -> DomainIdx {
        self.idx
    }

    /// Aggregated image size: the sum of all constituent payloads.
    pub fn size(&self) -> Result<usize> {
        Ok(self.master.image(self.idx)?.size())
    }

    /// Append a datagram during configuration; its payload becomes the
    /// next sub-range of the aggregated image.
    pub fn append(&mut self, datagram: Datagram) -> Result<DatagramHandle> {
        let master = &mut *self.master;
        if master.active {
            return Err(Error::Activated);
        }
        if master.image(self.idx)?.finalized() {
            return Err(Error::AlreadyFinalized);
        }
        if datagram.state() != DatagramState::Init {
            return Err(Error::DatagramState {
                from: datagram.state(),
                to: DatagramState::Init,
            });
        }
        let size = datagram.size();
        let handle = master.datagrams.insert(datagram);
        master.domains[usize::from(self.idx)].append(handle, size)?;
        Ok(handle)
    }

    /// Compute the layout and bind an internally allocated image.
    pub fn finalize(&mut self) -> Result<()> {
        let master = &mut *self.master;
        let domain = master
            .domains
            .get_mut(usize::from(self.idx))
            .ok_or(Error::NoDomain(usize::from(self.idx)))?;
        domain.finalize(&mut master.datagrams, None)
    }

    /// Compute the layout and bind application-supplied image memory,
    /// so the application writes straight into the wire payloads.
    pub fn finalize_external(&mut self, image: Vec<u8>) -> Result<()> {
        let master = &mut *self.master;
        let domain = master
            .domains
            .get_mut(usize::from(self.idx))
            .ok_or(Error::NoDomain(usize::from(self.idx)))?;
        domain.finalize(&mut master.datagrams, Some(image))
    }

    /// Submit all constituent datagrams for the next `send`, in append
    /// order.  Constituents still on the wire from an earlier cycle
    /// are skipped; their skip counts tell the story.
    pub fn queue(&mut self) -> Result<usize> {
        let master = &mut *self.master;
        let domain = master
            .domains
            .get_mut(usize::from(self.idx))
            .ok_or(Error::NoDomain(usize::from(self.idx)))?;
        if !domain.finalized() {
            return Err(Error::NotFinalized);
        }
        domain.begin_cycle();
        let mut queued = 0;
        for &handle in domain.datagrams() {
            match master.datagrams.get(handle)?.state() {
                DatagramState::Queued | DatagramState::Sent => {
                    debug!("domain {}: datagram still on the wire, skipped", self.idx);
                }
                _ => {
                    master.dispatcher.submit(&mut master.datagrams, handle)?;
                    queued += 1;
                }
            }
        }
        Ok(queued)
    }

    /// Evaluate the constituents after `receive` and update the
    /// domain's cycle state.
    pub fn process(&mut self) -> Result<DomainState> {
        let master = &mut *self.master;
        let domain = master
            .domains
            .get_mut(usize::from(self.idx))
            .ok_or(Error::NoDomain(usize::from(self.idx)))?;
        let state = domain.fold_state(&master.datagrams)?;
        debug!("domain {}: {:?}", self.idx, state);
        Ok(state)
    }

    /// The state computed by the last `process`.
    pub fn state(&self) -> Result<DomainState> {
        Ok(self.master.image(self.idx)?.state())
    }

    /// Coherent read access to the aggregated image.
    pub fn data(&self) -> Result<&[u8]> {
        let domain = self.master.image(self.idx)?;
        if !domain.finalized() {
            Err(Error::NotFinalized)
        } else if !domain.resolved() {
            Err(Error::Incomplete)
        } else {
            Ok(domain.image())
        }
    }

    /// Coherent write access to the aggregated image.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        self.master.domain_data(self.idx)
    }

    /// Best-effort access regardless of resolution: the caller opted
    /// into possibly stale values.
    pub fn raw_data_mut(&mut self) -> Result<&mut [u8]> {
        let domain = self.master.image_mut(self.idx)?;
        if !domain.finalized() {
            return Err(Error::NotFinalized);
        }
        Ok(domain.image_mut())
    }
}
