// Part of ecrt. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Composing EtherCAT frames out of datagrams and taking responses
//! apart again.  The layout is protocol-fixed and must stay bit-exact.

use byteorder::{ByteOrder, LittleEndian as LE};
use derive_new::new;

use crate::datagram::Command;
use crate::types::*;

/// Protocol nibble of the frame header: DL PDUs.
const PROTOCOL_PDU: u16 = 0x1;
/// The length fields of frame and datagram headers are 11 bits wide.
const LEN_MASK: u16 = 0x07FF;
/// "More datagrams follow" flag in the datagram length word.
const MORE_FLAG: u16 = 0x8000;

/// Bytes one datagram occupies inside a frame.
pub(crate) fn datagram_footprint(data_size: usize) -> usize {
    EC_DATAGRAM_HEADER_SIZE + data_size + EC_DATAGRAM_FOOTER_SIZE
}

/// Builds one frame; datagrams keep the order they are pushed in.
pub(crate) struct FrameAssembler {
    buf: Vec<u8>,
    last_len_at: Option<usize>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        FrameAssembler {
            buf: vec![0; EC_FRAME_HEADER_SIZE],
            last_len_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == EC_FRAME_HEADER_SIZE
    }

    /// Whether another datagram of the given payload size still fits.
    pub fn fits(&self, data_size: usize) -> bool {
        self.buf.len() - EC_FRAME_HEADER_SIZE + datagram_footprint(data_size)
            <= EC_MAX_FRAME_DATA_SIZE
    }

    pub fn push(&mut self, command: Command, index: u8, address: [u8; 4], data: &[u8]) {
        if let Some(at) = self.last_len_at {
            // the previous datagram is no longer the last one
            let word = LE::read_u16(&self.buf[at..at + 2]);
            LE::write_u16(&mut self.buf[at..at + 2], word | MORE_FLAG);
        }
        self.buf.push(command as u8);
        self.buf.push(index);
        self.buf.extend_from_slice(&address);
        let len_at = self.buf.len();
        let mut word = [0; 2];
        LE::write_u16(&mut word, data.len() as u16 & LEN_MASK);
        self.buf.extend_from_slice(&word);
        self.buf.extend_from_slice(&[0, 0]); // irq
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(&[0, 0]); // working counter
        self.last_len_at = Some(len_at);
    }

    pub fn finish(mut self) -> Vec<u8> {
        let data_len = (self.buf.len() - EC_FRAME_HEADER_SIZE) as u16;
        LE::write_u16(
            &mut self.buf[0..2],
            (data_len & LEN_MASK) | (PROTOCOL_PDU << 12),
        );
        self.buf
    }
}

/// One datagram slot of a received frame.
#[derive(Debug, new)]
pub(crate) struct Response<'a> {
    pub index: u8,
    pub working_counter: u16,
    pub data: &'a [u8],
}

/// Validate the frame header and iterate over the contained datagrams.
pub(crate) fn responses(frame: &[u8]) -> Result<Responses> {
    if frame.len() < EC_FRAME_HEADER_SIZE {
        return Err(Error::Frame("truncated frame header"));
    }
    let word = LE::read_u16(&frame[0..2]);
    if word >> 12 != PROTOCOL_PDU {
        return Err(Error::Frame("unexpected protocol type"));
    }
    let len = (word & LEN_MASK) as usize;
    if frame.len() < EC_FRAME_HEADER_SIZE + len {
        return Err(Error::Frame("truncated frame payload"));
    }
    Ok(Responses {
        rest: &frame[EC_FRAME_HEADER_SIZE..EC_FRAME_HEADER_SIZE + len],
        more: true,
    })
}

pub(crate) struct Responses<'a> {
    rest: &'a [u8],
    more: bool,
}

impl<'a> Iterator for Responses<'a> {
    type Item = Result<Response<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.more || self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < EC_DATAGRAM_HEADER_SIZE + EC_DATAGRAM_FOOTER_SIZE {
            self.more = false;
            return Some(Err(Error::Frame("truncated datagram header")));
        }
        let index = self.rest[1];
        let word = LE::read_u16(&self.rest[6..8]);
        let size = (word & LEN_MASK) as usize;
        let total = datagram_footprint(size);
        if self.rest.len() < total {
            self.more = false;
            return Some(Err(Error::Frame("truncated datagram payload")));
        }
        let data = &self.rest[EC_DATAGRAM_HEADER_SIZE..EC_DATAGRAM_HEADER_SIZE + size];
        let working_counter = LE::read_u16(&self.rest[total - 2..total]);
        self.more = word & MORE_FLAG != 0;
        self.rest = &self.rest[total..];
        Some(Ok(Response::new(index, working_counter, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_datagram_wire_image() {
        let mut asm = FrameAssembler::new();
        asm.push(Command::Brd, 0x17, [0x00, 0x00, 0x30, 0x01], &[0xAA, 0xBB]);
        let frame = asm.finish();
        assert_eq!(
            frame,
            vec![
                0x0E, 0x10, // frame header: 14 bytes, protocol 0x1
                0x07, 0x17, // BRD, index
                0x00, 0x00, 0x30, 0x01, // adp, ado
                0x02, 0x00, // length, no more datagrams
                0x00, 0x00, // irq
                0xAA, 0xBB, // payload
                0x00, 0x00, // working counter
            ]
        );
    }

    #[test]
    fn round_trip_with_more_flag() {
        let mut asm = FrameAssembler::new();
        asm.push(Command::Npwr, 1, [0x01, 0x00, 0x00, 0x10], &[1, 2, 3, 4]);
        asm.push(Command::Nprd, 2, [0x02, 0x00, 0x00, 0x10], &[0, 0]);
        let mut frame = asm.finish();

        // first datagram carries the "more" flag, second does not
        let word = LE::read_u16(&frame[8..10]);
        assert_eq!(word, 4 | 0x8000);

        // patch the second working counter as a slave would
        let len = frame.len();
        LE::write_u16(&mut frame[len - 2..], 1);

        let parsed = responses(&frame)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].index, 1);
        assert_eq!(parsed[0].data, &[1, 2, 3, 4]);
        assert_eq!(parsed[0].working_counter, 0);
        assert_eq!(parsed[1].index, 2);
        assert_eq!(parsed[1].working_counter, 1);
    }

    #[test]
    fn frame_capacity() {
        let asm = FrameAssembler::new();
        // a maximum-size datagram fills the frame exactly
        assert!(asm.fits(EC_MAX_DATA_SIZE));
        assert!(!asm.fits(EC_MAX_DATA_SIZE + 1));

        let mut asm = FrameAssembler::new();
        asm.push(Command::Lrw, 0, [0; 4], &[0; 800]);
        assert!(!asm.fits(800));
        assert!(asm.fits(600));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(responses(&[0x0E]), Err(Error::Frame(_))));
        // wrong protocol nibble
        assert!(matches!(responses(&[0x02, 0x20, 0, 0]), Err(Error::Frame(_))));
        // header promises more payload than present
        assert!(matches!(responses(&[0x0E, 0x10, 0x07]), Err(Error::Frame(_))));
        // datagram length field runs past the frame
        let mut asm = FrameAssembler::new();
        asm.push(Command::Brd, 0, [0; 4], &[0; 4]);
        let mut frame = asm.finish();
        LE::write_u16(&mut frame[8..10], 200);
        let items: Vec<_> = responses(&frame).unwrap().collect();
        assert!(items[0].is_err());
    }
}
