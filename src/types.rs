// Part of ecrt. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::datagram::DatagramState;
use crate::transport::TransportError;
use derive_new::new;
use std::fmt;
use thiserror::Error;

/// Usable data area of an Ethernet frame.
pub const ETH_DATA_SIZE: usize = 1500;
/// Size of the EtherCAT frame header.
pub const EC_FRAME_HEADER_SIZE: usize = 2;
/// Size of an EtherCAT datagram header.
pub const EC_DATAGRAM_HEADER_SIZE: usize = 10;
/// Size of an EtherCAT datagram footer (the working counter).
pub const EC_DATAGRAM_FOOTER_SIZE: usize = 2;
/// Maximum total size of the datagram area of one frame.
pub const EC_MAX_FRAME_DATA_SIZE: usize = ETH_DATA_SIZE - EC_FRAME_HEADER_SIZE;
/// Maximum payload size of a single datagram.
pub const EC_MAX_DATA_SIZE: usize =
    EC_MAX_FRAME_DATA_SIZE - EC_DATAGRAM_HEADER_SIZE - EC_DATAGRAM_FOOTER_SIZE;
/// Size of the datagram description string.
pub const EC_DATAGRAM_NAME_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum Error {
    #[error("datagram payload size {requested} exceeds the maximum of {max}")]
    InvalidSize { requested: usize, max: usize },
    #[error("could not allocate {0} bytes of datagram memory")]
    Allocation(usize),
    #[error("no free datagram index, queue is full")]
    QueueFull,
    #[error("illegal datagram state transition from {from:?} to {to:?}")]
    DatagramState {
        from: DatagramState,
        to: DatagramState,
    },
    #[error("datagram is queued or on the wire")]
    InFlight,
    #[error("domain is already finalized")]
    AlreadyFinalized,
    #[error("domain is not finalized")]
    NotFinalized,
    #[error("external image size {got} does not match domain size {expected}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("domain process data is not fully resolved")]
    Incomplete,
    #[error("invalid domain index {0}")]
    NoDomain(usize),
    #[error("invalid datagram handle {0}")]
    NoDatagram(usize),
    #[error("datagram {name}: working counter {got}, expected {expected}")]
    WorkingCounter {
        name: String,
        expected: u16,
        got: u16,
    },
    #[error("master is already activated")]
    Activated,
    #[error("malformed frame: {0}")]
    Frame(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Index of a domain within its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainIdx(usize);

impl From<usize> for DomainIdx {
    fn from(idx: usize) -> Self {
        DomainIdx(idx)
    }
}

impl From<DomainIdx> for usize {
    fn from(idx: DomainIdx) -> Self {
        idx.0
    }
}

impl fmt::Display for DomainIdx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a datagram within its master's arena.
///
/// Handles stay valid until the datagram is removed; membership in
/// domain and dispatcher lists is tracked through handles instead of
/// embedded links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatagramHandle(usize);

impl From<usize> for DatagramHandle {
    fn from(idx: usize) -> Self {
        DatagramHandle(idx)
    }
}

impl From<DatagramHandle> for usize {
    fn from(idx: DatagramHandle) -> Self {
        idx.0
    }
}

impl fmt::Display for DatagramHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ring position of a slave, counted from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlavePos(u16);

impl From<u16> for SlavePos {
    fn from(pos: u16) -> Self {
        SlavePos(pos)
    }
}

impl From<SlavePos> for u16 {
    fn from(pos: SlavePos) -> Self {
        pos.0
    }
}

impl fmt::Display for SlavePos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate working-counter interpretation of a domain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcState {
    /// No slave processed any constituent datagram.
    Zero,
    /// Some, but not all, expected exchanges happened.
    Incomplete,
    /// Every constituent datagram was processed as expected.
    Complete,
}

/// Result of one cyclic exchange of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct DomainState {
    pub working_counter: u32,
    pub wc_state: WcState,
}
