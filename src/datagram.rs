// Part of ecrt. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! EtherCAT datagrams: the single addressed exchange unit of the protocol.

use byteorder::{ByteOrder, LittleEndian as LE};
use log::*;
use std::ops::Range;

use crate::domain::DomainImage;
use crate::types::*;

/// Minimum interval between statistics outputs for one datagram.
const STATS_INTERVAL_NS: u64 = 1_000_000_000;

/// Datagram type, with the protocol-fixed command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Dummy.
    None = 0x00,
    /// Auto-increment physical read.
    Aprd = 0x01,
    /// Auto-increment physical write.
    Apwr = 0x02,
    /// Node-addressed physical read.
    Nprd = 0x04,
    /// Node-addressed physical write.
    Npwr = 0x05,
    /// Broadcast read.
    Brd = 0x07,
    /// Broadcast write.
    Bwr = 0x08,
    /// Logical read/write.
    Lrw = 0x0C,
}

impl Command {
    /// Slaves put data on the wire for these commands, so the returned
    /// payload replaces the datagram's own.
    pub(crate) fn is_read(self) -> bool {
        matches!(
            self,
            Command::Aprd | Command::Nprd | Command::Brd | Command::Lrw
        )
    }
}

/// Datagram state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramState {
    /// Initial state of a new datagram.
    Init,
    /// Queued for sending.
    Queued,
    /// Sent, awaiting its response.
    Sent,
    /// Response matched and working counter read.
    Received,
    /// No response arrived within the deadline.
    TimedOut,
    /// Failure while sending or receiving.
    Error,
}

/// Origin of a datagram's payload memory.
#[derive(Debug)]
pub enum Payload {
    /// Internally allocated, released with the datagram.
    Owned(Vec<u8>),
    /// Aliases a sub-range of a domain's aggregated process image.
    Bound { domain: DomainIdx, range: Range<usize> },
}

impl Payload {
    pub fn size(&self) -> usize {
        match self {
            Payload::Owned(buf) => buf.len(),
            Payload::Bound { range, .. } => range.len(),
        }
    }
}

/// One addressed protocol exchange: the request and its eventual
/// response share this structure.
#[derive(Debug)]
pub struct Datagram {
    command: Command,
    address: [u8; 4],
    payload: Payload,
    index: u8,
    working_counter: u16,
    expected_wc: Option<u16>,
    state: DatagramState,
    sent_at: u64,
    received_at: u64,
    skip_count: u32,
    stats_output_at: u64,
    name: String,
}

fn prealloc(size: usize) -> Result<Vec<u8>> {
    if size > EC_MAX_DATA_SIZE {
        return Err(Error::InvalidSize {
            requested: size,
            max: EC_MAX_DATA_SIZE,
        });
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).map_err(|_| Error::Allocation(size))?;
    buf.resize(size, 0);
    Ok(buf)
}

fn physical_addr(position: u16, offset: u16) -> [u8; 4] {
    let mut addr = [0; 4];
    LE::write_u16(&mut addr[0..2], position);
    LE::write_u16(&mut addr[2..4], offset);
    addr
}

fn logical_addr(start: u32) -> [u8; 4] {
    let mut addr = [0; 4];
    LE::write_u32(&mut addr, start);
    addr
}

impl Datagram {
    fn with_address(
        name: &str,
        command: Command,
        address: [u8; 4],
        size: usize,
        expected_wc: Option<u16>,
    ) -> Result<Self> {
        Ok(Datagram {
            command,
            address,
            payload: Payload::Owned(prealloc(size)?),
            index: 0,
            working_counter: 0,
            expected_wc,
            state: DatagramState::Init,
            sent_at: 0,
            received_at: 0,
            skip_count: 0,
            stats_output_at: 0,
            name: name.chars().take(EC_DATAGRAM_NAME_SIZE).collect(),
        })
    }

    /// Node-addressed physical read from a configured station address.
    pub fn nprd(name: &str, node: u16, offset: u16, size: usize) -> Result<Self> {
        Self::with_address(name, Command::Nprd, physical_addr(node, offset), size, Some(1))
    }

    /// Node-addressed physical write to a configured station address.
    pub fn npwr(name: &str, node: u16, offset: u16, size: usize) -> Result<Self> {
        Self::with_address(name, Command::Npwr, physical_addr(node, offset), size, Some(1))
    }

    /// Auto-increment physical read from a ring position.
    pub fn aprd(name: &str, position: SlavePos, offset: u16, size: usize) -> Result<Self> {
        let adp = 0u16.wrapping_sub(u16::from(position));
        Self::with_address(name, Command::Aprd, physical_addr(adp, offset), size, None)
    }

    /// Auto-increment physical write to a ring position.
    pub fn apwr(name: &str, position: SlavePos, offset: u16, size: usize) -> Result<Self> {
        let adp = 0u16.wrapping_sub(u16::from(position));
        Self::with_address(name, Command::Apwr, physical_addr(adp, offset), size, None)
    }

    /// Broadcast read.
    pub fn brd(name: &str, offset: u16, size: usize) -> Result<Self> {
        Self::with_address(name, Command::Brd, physical_addr(0, offset), size, None)
    }

    /// Broadcast write.
    pub fn bwr(name: &str, offset: u16, size: usize) -> Result<Self> {
        Self::with_address(name, Command::Bwr, physical_addr(0, offset), size, None)
    }

    /// Logical read/write over the mapped address space.
    pub fn lrw(name: &str, start: u32, size: usize) -> Result<Self> {
        Self::with_address(name, Command::Lrw, logical_addr(start), size, None)
    }

    /// Declare how many slaves are expected to process this datagram.
    ///
    /// Node-addressed datagrams default to 1; for broadcast,
    /// auto-increment and logical datagrams only the configuration
    /// layer knows the count, so they start out unchecked.
    pub fn expect_wc(mut self, wc: u16) -> Self {
        self.expected_wc = Some(wc);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub(crate) fn address(&self) -> [u8; 4] {
        self.address
    }

    pub fn state(&self) -> DatagramState {
        self.state
    }

    /// Logical payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.size()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Correlation index of the current or last dispatch.
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn working_counter(&self) -> u16 {
        self.working_counter
    }

    pub fn expected_wc(&self) -> Option<u16> {
        self.expected_wc
    }

    /// Number of dispatch cycles this datagram stayed unresolved.
    pub fn skip_count(&self) -> u32 {
        self.skip_count
    }

    pub(crate) fn sent_at(&self) -> u64 {
        self.sent_at
    }

    /// Wire round-trip time of the last exchange, if it completed.
    pub fn round_trip_time(&self) -> Option<u64> {
        match self.state {
            DatagramState::Received => Some(self.received_at - self.sent_at),
            _ => None,
        }
    }

    /// The working counter as a result: a mismatch against the declared
    /// expectation is a semantic failure, distinct from a timeout or a
    /// transport error (the frame did round-trip).
    pub fn wc_result(&self) -> Result<u16> {
        match self.expected_wc {
            Some(expected) if self.working_counter != expected => Err(Error::WorkingCounter {
                name: self.name.clone(),
                expected,
                got: self.working_counter,
            }),
            _ => Ok(self.working_counter),
        }
    }

    pub(crate) fn log_wc_error(&self) {
        if let Err(e) = self.wc_result() {
            warn!("{}", e);
        }
    }

    /// All transitions are validated here; everything else only asks
    /// for a target state.
    fn advance(&mut self, to: DatagramState) -> Result<()> {
        use DatagramState::*;
        let legal = matches!(
            (self.state, to),
            (Init, Queued)
                | (Received, Queued)
                | (TimedOut, Queued)
                | (Error, Queued)
                | (Queued, Init)
                | (Queued, Sent)
                | (Queued, Error)
                | (Sent, Received)
                | (Sent, TimedOut)
                | (Sent, Error)
        );
        if !legal {
            return Err(crate::Error::DatagramState { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn mark_queued(&mut self, index: u8) -> Result<()> {
        self.advance(DatagramState::Queued)?;
        self.index = index;
        self.working_counter = 0;
        Ok(())
    }

    pub(crate) fn mark_cancelled(&mut self) -> Result<()> {
        self.advance(DatagramState::Init)
    }

    pub(crate) fn mark_sent(&mut self, now: u64) -> Result<()> {
        self.advance(DatagramState::Sent)?;
        self.sent_at = now;
        Ok(())
    }

    pub(crate) fn mark_received(&mut self, wc: u16, now: u64) -> Result<()> {
        self.advance(DatagramState::Received)?;
        self.working_counter = wc;
        self.received_at = now;
        Ok(())
    }

    pub(crate) fn mark_timed_out(&mut self) -> Result<()> {
        self.advance(DatagramState::TimedOut)
    }

    pub(crate) fn mark_error(&mut self) -> Result<()> {
        self.advance(DatagramState::Error)
    }

    pub(crate) fn bump_skip(&mut self, now: u64) {
        self.skip_count += 1;
        self.output_stats(now);
    }

    fn output_stats(&mut self, now: u64) {
        if now.saturating_sub(self.stats_output_at) >= STATS_INTERVAL_NS {
            info!("datagram {}: skipped {} time(s)", self.name, self.skip_count);
            self.stats_output_at = now;
            self.skip_count = 0;
        }
    }

    /// Resolve the payload bytes, following a bound payload into its
    /// domain's image.
    pub(crate) fn payload_bytes<'a>(&'a self, domains: &'a [DomainImage]) -> &'a [u8] {
        match &self.payload {
            Payload::Owned(buf) => buf,
            Payload::Bound { domain, range } => {
                &domains[usize::from(*domain)].image()[range.clone()]
            }
        }
    }

    pub(crate) fn payload_bytes_mut<'a>(
        &'a mut self,
        domains: &'a mut [DomainImage],
    ) -> &'a mut [u8] {
        match &mut self.payload {
            Payload::Owned(buf) => buf,
            Payload::Bound { domain, range } => {
                &mut domains[usize::from(*domain)].image_mut()[range.clone()]
            }
        }
    }

    /// Rebind the payload onto a domain image sub-range, returning the
    /// previously owned buffer (if any) so its content can be carried
    /// over.
    pub(crate) fn rebind(&mut self, domain: DomainIdx, range: Range<usize>) -> Option<Vec<u8>> {
        match std::mem::replace(&mut self.payload, Payload::Bound { domain, range }) {
            Payload::Owned(buf) => Some(buf),
            Payload::Bound { .. } => None,
        }
    }
}

/// Arena holding all datagrams of one master.  Lists (domain
/// membership, dispatch queues) refer into it by handle.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Option<Datagram>>,
    free: Vec<usize>,
}

impl Arena {
    pub fn insert(&mut self, datagram: Datagram) -> DatagramHandle {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(datagram);
                DatagramHandle::from(idx)
            }
            None => {
                self.slots.push(Some(datagram));
                DatagramHandle::from(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, handle: DatagramHandle) -> Result<&Datagram> {
        let idx = usize::from(handle);
        self.slots
            .get(idx)
            .and_then(|slot| slot.as_ref())
            .ok_or(Error::NoDatagram(idx))
    }

    pub fn get_mut(&mut self, handle: DatagramHandle) -> Result<&mut Datagram> {
        let idx = usize::from(handle);
        self.slots
            .get_mut(idx)
            .and_then(|slot| slot.as_mut())
            .ok_or(Error::NoDatagram(idx))
    }

    pub fn remove(&mut self, handle: DatagramHandle) -> Result<Datagram> {
        let idx = usize::from(handle);
        match self.slots.get_mut(idx).and_then(Option::take) {
            Some(datagram) => {
                self.free.push(idx);
                Ok(datagram)
            }
            None => Err(Error::NoDatagram(idx)),
        }
    }
}
