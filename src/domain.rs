// Part of ecrt. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Domains: ordered collections of datagrams whose payloads form one
//! contiguous process-data image, exchanged once per cycle.

use crate::datagram::{Arena, DatagramState};
use crate::types::*;

/// The aggregated image and bookkeeping of one domain.  The public
/// face is `Domain` in the master module; this is the owned record.
#[derive(Debug)]
pub(crate) struct DomainImage {
    index: DomainIdx,
    datagrams: Vec<DatagramHandle>,
    offsets: Vec<usize>,
    data_size: usize,
    process_data: Vec<u8>,
    external: bool,
    finalized: bool,
    resolved: bool,
    state: DomainState,
}

impl DomainImage {
    pub fn new(index: DomainIdx) -> Self {
        DomainImage {
            index,
            datagrams: Vec::new(),
            offsets: Vec::new(),
            data_size: 0,
            process_data: Vec::new(),
            external: false,
            finalized: false,
            resolved: false,
            state: DomainState::new(0, WcState::Zero),
        }
    }

    pub fn index(&self) -> DomainIdx {
        self.index
    }

    pub fn size(&self) -> usize {
        self.data_size
    }

    pub fn datagrams(&self) -> &[DatagramHandle] {
        &self.datagrams
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn resolved(&self) -> bool {
        self.resolved
    }

    pub fn state(&self) -> DomainState {
        self.state
    }

    pub fn image(&self) -> &[u8] {
        &self.process_data
    }

    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.process_data
    }

    /// Record a constituent datagram.  Offsets into the image follow
    /// append order; the layout is fixed at finalization.
    pub fn append(&mut self, handle: DatagramHandle, size: usize) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized);
        }
        self.datagrams.push(handle);
        self.offsets.push(self.data_size);
        self.data_size += size;
        Ok(())
    }

    /// Size the image, bind every constituent payload onto its
    /// sub-range and freeze the layout.  With an internally allocated
    /// image the constituents' current payload bytes are carried over;
    /// an externally supplied image is authoritative as handed in.
    pub fn finalize(&mut self, arena: &mut Arena, image: Option<Vec<u8>>) -> Result<()> {
        if self.finalized {
            return Err(Error::AlreadyFinalized);
        }
        let mut data = match image {
            Some(buf) => {
                if buf.len() != self.data_size {
                    return Err(Error::SizeMismatch {
                        expected: self.data_size,
                        got: buf.len(),
                    });
                }
                self.external = true;
                buf
            }
            None => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(self.data_size)
                    .map_err(|_| Error::Allocation(self.data_size))?;
                buf.resize(self.data_size, 0);
                buf
            }
        };
        for (offset, &handle) in self.offsets.iter().zip(&self.datagrams) {
            let datagram = arena.get_mut(handle)?;
            let range = *offset..*offset + datagram.size();
            if let Some(old) = datagram.rebind(self.index, range.clone()) {
                if !self.external {
                    data[range].copy_from_slice(&old);
                }
            }
        }
        self.process_data = data;
        self.finalized = true;
        // coherent until the first exchange is under way
        self.resolved = true;
        Ok(())
    }

    /// A new cycle starts: the image is no longer a coherent snapshot
    /// until every constituent has resolved again.
    pub fn begin_cycle(&mut self) {
        self.resolved = false;
    }

    /// Fold the constituent states and working counters into the
    /// domain's cycle state.
    pub fn fold_state(&mut self, arena: &Arena) -> Result<DomainState> {
        if !self.finalized {
            return Err(Error::NotFinalized);
        }
        let mut total: u32 = 0;
        let mut expected: u32 = 0;
        let mut all_received = true;
        for &handle in &self.datagrams {
            let datagram = arena.get(handle)?;
            match datagram.state() {
                DatagramState::Received => total += u32::from(datagram.working_counter()),
                _ => all_received = false,
            }
            if let Some(wc) = datagram.expected_wc() {
                expected += u32::from(wc);
            }
        }
        let wc_state = if total == 0 {
            WcState::Zero
        } else if total == expected && all_received {
            WcState::Complete
        } else {
            WcState::Incomplete
        };
        self.resolved = all_received;
        self.state = DomainState::new(total, wc_state);
        Ok(self.state)
    }

    /// Release the constituent datagrams and the image.
    pub fn clear(&mut self, arena: &mut Arena) {
        for handle in self.datagrams.drain(..) {
            let _ = arena.remove(handle);
        }
        self.offsets.clear();
        self.process_data = Vec::new();
        self.data_size = 0;
        self.external = false;
        self.finalized = false;
        self.resolved = false;
        self.state = DomainState::new(0, WcState::Zero);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::{Datagram, Payload};

    fn image_with_sizes(arena: &mut Arena, sizes: &[usize]) -> DomainImage {
        let mut dom = DomainImage::new(DomainIdx::from(0));
        for (i, &size) in sizes.iter().enumerate() {
            let dg = Datagram::lrw(&format!("part-{}", i), (i * 0x100) as u32, size).unwrap();
            let handle = arena.insert(dg);
            dom.append(handle, size).unwrap();
        }
        dom
    }

    #[test]
    fn offsets_follow_append_order() {
        let mut arena = Arena::default();
        let mut dom = image_with_sizes(&mut arena, &[4, 2, 6]);
        dom.finalize(&mut arena, None).unwrap();
        assert_eq!(dom.size(), 12);
        let expected = [(0, 4), (4, 6), (6, 12)];
        for (&handle, &(start, end)) in dom.datagrams().iter().zip(&expected) {
            match arena.get(handle).unwrap().payload() {
                Payload::Bound { range, .. } => assert_eq!((range.start, range.end), (start, end)),
                other => panic!("payload not bound: {:?}", other),
            }
        }
    }

    #[test]
    fn layout_is_fixed_after_finalization() {
        let mut arena = Arena::default();
        let mut dom = image_with_sizes(&mut arena, &[4]);
        dom.finalize(&mut arena, None).unwrap();
        let extra = arena.insert(Datagram::lrw("extra", 0, 2).unwrap());
        assert!(matches!(
            dom.append(extra, 2),
            Err(Error::AlreadyFinalized)
        ));
        assert!(matches!(
            dom.finalize(&mut arena, None),
            Err(Error::AlreadyFinalized)
        ));
    }

    #[test]
    fn external_image_must_match_exactly() {
        let mut arena = Arena::default();
        let mut dom = image_with_sizes(&mut arena, &[4, 4]);
        assert!(matches!(
            dom.finalize(&mut arena, Some(vec![0; 7])),
            Err(Error::SizeMismatch { expected: 8, got: 7 })
        ));
        dom.finalize(&mut arena, Some(vec![0xEE; 8])).unwrap();
        // externally supplied content is authoritative
        assert_eq!(dom.image(), &[0xEE; 8]);
    }

    #[test]
    fn owned_payload_content_is_carried_over() {
        let mut arena = Arena::default();
        let mut dom = DomainImage::new(DomainIdx::from(0));
        let handle = arena.insert(Datagram::bwr("out", 0x0F00, 3).unwrap());
        dom.append(handle, 3).unwrap();
        arena
            .get_mut(handle)
            .unwrap()
            .payload_bytes_mut(&mut [])
            .copy_from_slice(&[7, 8, 9]);
        dom.finalize(&mut arena, None).unwrap();
        assert_eq!(dom.image(), &[7, 8, 9]);
    }

    #[test]
    fn fold_state_tracks_the_cycle() {
        let mut arena = Arena::default();
        let mut dom = image_with_sizes(&mut arena, &[2, 2]);
        dom.finalize(&mut arena, None).unwrap();
        assert!(dom.resolved());

        dom.begin_cycle();
        assert!(!dom.resolved());
        let handles: Vec<_> = dom.datagrams().to_vec();
        for &h in &handles {
            arena.get_mut(h).unwrap().mark_queued(0).unwrap();
            arena.get_mut(h).unwrap().mark_sent(0).unwrap();
        }
        // half-resolved: not exposed as coherent
        arena.get_mut(handles[0]).unwrap().mark_received(3, 1).unwrap();
        let state = dom.fold_state(&arena).unwrap();
        assert!(!dom.resolved());
        assert_eq!(state.wc_state, WcState::Incomplete);

        arena.get_mut(handles[1]).unwrap().mark_received(3, 1).unwrap();
        let state = dom.fold_state(&arena).unwrap();
        assert!(dom.resolved());
        assert_eq!(state.working_counter, 6);
    }

    #[test]
    fn clear_releases_the_constituents() {
        let mut arena = Arena::default();
        let mut dom = image_with_sizes(&mut arena, &[4, 2]);
        let handles: Vec<_> = dom.datagrams().to_vec();
        dom.finalize(&mut arena, None).unwrap();
        dom.clear(&mut arena);
        assert_eq!(dom.size(), 0);
        assert!(!dom.finalized());
        for h in handles {
            assert!(arena.get(h).is_err());
        }
    }
}
