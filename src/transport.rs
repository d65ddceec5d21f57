// Part of ecrt. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The seam towards the wire.  EtherCAT frames are only ever sent by
//! the master and always come back to it, so the contract is a bounded
//! blocking send plus a non-blocking drain of returned frames.

use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link is down")]
    LinkDown,
    #[error("frame of {0} bytes exceeds the transport MTU")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait Transport: Send {
    /// Put one EtherCAT frame (frame header plus datagram area) on the
    /// wire.  May block, but only boundedly.
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// The next complete frame that returned to the master, if any.
    /// Must never block.
    fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Echoes every sent frame back unchanged, like a ring closed directly
/// onto the master: no slaves, all working counters stay zero.
#[derive(Debug, Default)]
pub struct Loopback {
    frames: VecDeque<Vec<u8>>,
}

impl Transport for Loopback {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.frames.push_back(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.frames.pop_front())
    }
}

#[cfg(test)]
pub(crate) mod sim {
    //! A slave ring in software: every sent frame comes back with each
    //! datagram run through a configurable hook standing in for the
    //! slaves on the bus.

    use super::{Transport, TransportError};
    use crate::types::{EC_DATAGRAM_FOOTER_SIZE, EC_DATAGRAM_HEADER_SIZE, EC_FRAME_HEADER_SIZE};
    use byteorder::{ByteOrder, LittleEndian as LE};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// (command code, index, payload) -> number of slaves that
    /// processed the datagram; may patch the payload in place.
    type SlaveFn = Box<dyn FnMut(u8, u8, &mut [u8]) -> u16 + Send>;

    pub(crate) struct SimInner {
        pub rx: VecDeque<Vec<u8>>,
        pub drop_next: usize,
        pub fail_next: bool,
        slave: SlaveFn,
    }

    #[derive(Clone)]
    pub(crate) struct SimBus {
        pub inner: Arc<Mutex<SimInner>>,
    }

    impl SimBus {
        pub fn new(slave: SlaveFn) -> Self {
            SimBus {
                inner: Arc::new(Mutex::new(SimInner {
                    rx: VecDeque::new(),
                    drop_next: 0,
                    fail_next: false,
                    slave,
                })),
            }
        }

        /// One well-behaved slave that processes everything.
        pub fn single_slave() -> Self {
            Self::new(Box::new(|_, _, _| 1))
        }

        pub fn drop_next(&self, n: usize) {
            self.inner.lock().unwrap().drop_next = n;
        }

        pub fn fail_next(&self) {
            self.inner.lock().unwrap().fail_next = true;
        }

        /// Frames waiting to be drained; tests may reorder this.
        pub fn pending(&self) -> usize {
            self.inner.lock().unwrap().rx.len()
        }

        pub fn reverse_pending(&self) {
            let mut inner = self.inner.lock().unwrap();
            let reversed: VecDeque<_> = inner.rx.drain(..).rev().collect();
            inner.rx = reversed;
        }

        pub fn inject(&self, frame: Vec<u8>) {
            self.inner.lock().unwrap().rx.push_back(frame);
        }
    }

    impl Transport for SimBus {
        fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_next {
                inner.fail_next = false;
                return Err(TransportError::LinkDown);
            }
            if inner.drop_next > 0 {
                inner.drop_next -= 1;
                return Ok(());
            }
            let mut frame = frame.to_vec();
            let mut at = EC_FRAME_HEADER_SIZE;
            loop {
                let command = frame[at];
                let index = frame[at + 1];
                let word = LE::read_u16(&frame[at + 6..at + 8]);
                let size = (word & 0x07FF) as usize;
                let data_at = at + EC_DATAGRAM_HEADER_SIZE;
                let wc_at = data_at + size;
                let wc = (inner.slave)(command, index, &mut frame[data_at..wc_at]);
                let old = LE::read_u16(&frame[wc_at..wc_at + 2]);
                LE::write_u16(&mut frame[wc_at..wc_at + 2], old + wc);
                if word & 0x8000 == 0 {
                    break;
                }
                at = wc_at + EC_DATAGRAM_FOOTER_SIZE;
            }
            inner.rx.push_back(frame);
            Ok(())
        }

        fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(self.inner.lock().unwrap().rx.pop_front())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_echoes_in_order() {
        let mut lo = Loopback::default();
        lo.send(&[1, 2, 3]).unwrap();
        lo.send(&[4, 5]).unwrap();
        assert_eq!(lo.receive().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(lo.receive().unwrap(), Some(vec![4, 5]));
        assert_eq!(lo.receive().unwrap(), None);
    }
}
