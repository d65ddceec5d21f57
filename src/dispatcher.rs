// Part of ecrt. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Datagram queueing and dispatch: correlation indices, frame packing,
//! response reconciliation and the timeout policy.
//!
//! Responses are matched purely by correlation index; the socket layer
//! may return frames out of order and the indexed slots reorder them
//! automatically.

use log::*;
use std::collections::VecDeque;

use crate::datagram::{Arena, DatagramState};
use crate::domain::DomainImage;
use crate::frame::{self, FrameAssembler};
use crate::transport::Transport;
use crate::types::*;

/// Default response deadline, measured from transmission.
pub(crate) const DEFAULT_TIMEOUT_NS: u64 = 500_000;

/// The correlation index is a single byte on the wire.
const INDEX_SLOTS: usize = 256;

pub(crate) struct Dispatcher {
    /// Submitted, not yet transmitted; order is preserved into frames.
    pending: VecDeque<DatagramHandle>,
    /// Correlation index -> holder.  A slot is taken from submission
    /// until the datagram leaves the wire (match, timeout or error), so
    /// an index is never shared by two live datagrams.
    slots: Vec<Option<DatagramHandle>>,
    next_index: u8,
    timeout_ns: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            pending: VecDeque::new(),
            slots: vec![None; INDEX_SLOTS],
            next_index: 0,
            timeout_ns: DEFAULT_TIMEOUT_NS,
        }
    }

    pub fn set_timeout(&mut self, timeout_ns: u64) {
        self.timeout_ns = timeout_ns;
    }

    fn alloc_index(&mut self) -> Option<u8> {
        for _ in 0..INDEX_SLOTS {
            let idx = self.next_index;
            self.next_index = self.next_index.wrapping_add(1);
            if self.slots[idx as usize].is_none() {
                return Some(idx);
            }
        }
        None
    }

    /// Assign a fresh correlation index and append to the pending
    /// queue.  The datagram must be newly constructed or in a terminal
    /// state from an earlier cycle.
    pub fn submit(&mut self, arena: &mut Arena, handle: DatagramHandle) -> Result<u8> {
        arena.get(handle)?;
        let index = self.alloc_index().ok_or(Error::QueueFull)?;
        arena.get_mut(handle)?.mark_queued(index)?;
        self.slots[index as usize] = Some(handle);
        self.pending.push_back(handle);
        Ok(index)
    }

    /// Take a still-queued datagram off the pending queue.  Once sent,
    /// only a matched response or the deadline resolves it.
    pub fn cancel(&mut self, arena: &mut Arena, handle: DatagramHandle) -> Result<()> {
        let datagram = arena.get_mut(handle)?;
        datagram.mark_cancelled()?;
        let index = datagram.index();
        self.slots[index as usize] = None;
        self.pending.retain(|&h| h != handle);
        Ok(())
    }

    /// Transmit everything pending as one or more frames, preserving
    /// submission order within and across frames.  Returns the number
    /// of datagrams that went out.
    pub fn flush(
        &mut self,
        arena: &mut Arena,
        domains: &[DomainImage],
        transport: &mut dyn Transport,
        now: u64,
    ) -> Result<usize> {
        let mut sent = 0;
        while !self.pending.is_empty() {
            let mut assembler = FrameAssembler::new();
            let mut batch = Vec::new();
            while let Some(&handle) = self.pending.front() {
                let datagram = arena.get(handle)?;
                if !assembler.is_empty() && !assembler.fits(datagram.size()) {
                    break;
                }
                assembler.push(
                    datagram.command(),
                    datagram.index(),
                    datagram.address(),
                    datagram.payload_bytes(domains),
                );
                batch.push(handle);
                self.pending.pop_front();
            }
            let frame = assembler.finish();
            debug!(
                "sending frame: {} datagram(s), {} bytes",
                batch.len(),
                frame.len()
            );
            if let Err(e) = transport.send(&frame) {
                warn!("sending frame failed: {}", e);
                for &handle in &batch {
                    let datagram = arena.get_mut(handle)?;
                    self.slots[datagram.index() as usize] = None;
                    datagram.mark_error()?;
                }
                return Err(e.into());
            }
            for &handle in &batch {
                arena.get_mut(handle)?.mark_sent(now)?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Drain returned frames and reconcile them against the in-flight
    /// set, then expire everything past its deadline.  Never blocks;
    /// calling it with nothing pending changes no state apart from
    /// deadline expiry.
    pub fn process_responses(
        &mut self,
        arena: &mut Arena,
        domains: &mut [DomainImage],
        transport: &mut dyn Transport,
        now: u64,
    ) -> Result<usize> {
        let mut matched = 0;
        loop {
            let frame = match transport.receive() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => return Err(e.into()),
            };
            let parsed = match frame::responses(&frame) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("dropping malformed frame: {}", e);
                    continue;
                }
            };
            for response in parsed {
                let response = match response {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("dropping malformed datagram: {}", e);
                        break;
                    }
                };
                let handle = match self.slots[response.index as usize] {
                    Some(handle) => handle,
                    None => {
                        debug!("no datagram in flight for index {}", response.index);
                        continue;
                    }
                };
                let datagram = arena.get_mut(handle)?;
                if datagram.state() != DatagramState::Sent {
                    debug!("datagram {} matched before transmission", datagram.name());
                    continue;
                }
                if response.data.len() != datagram.size() {
                    warn!(
                        "datagram {}: response size {} instead of {}",
                        datagram.name(),
                        response.data.len(),
                        datagram.size()
                    );
                    datagram.mark_error()?;
                    self.slots[response.index as usize] = None;
                    continue;
                }
                if datagram.command().is_read() {
                    datagram
                        .payload_bytes_mut(domains)
                        .copy_from_slice(response.data);
                }
                datagram.mark_received(response.working_counter, now)?;
                datagram.log_wc_error();
                self.slots[response.index as usize] = None;
                matched += 1;
            }
        }
        for idx in 0..self.slots.len() {
            let handle = match self.slots[idx] {
                Some(handle) => handle,
                None => continue,
            };
            let datagram = arena.get_mut(handle)?;
            if datagram.state() != DatagramState::Sent {
                // still queued: the deadline starts at transmission
                continue;
            }
            if now.saturating_sub(datagram.sent_at()) >= self.timeout_ns {
                debug!("datagram {} timed out", datagram.name());
                datagram.mark_timed_out()?;
                self.slots[idx] = None;
            } else {
                datagram.bump_skip(now);
            }
        }
        Ok(matched)
    }

    /// Forget all pending and in-flight datagrams, e.g. on master
    /// deactivation while exchanges are still outstanding.
    pub fn reset(&mut self) {
        self.pending.clear();
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}
