//! Low-level binary protocol for the descriptor exchange.
//!
//! This module defines the C-compatible header used between the compositor
//! and its remote clients over a SOCK_SEQPACKET Unix domain socket.
//!
//! # Protocol Overview
//!
//! Every exchange is one request followed by exactly one reply:
//!
//! 1. **Request**: header with `direction = Request`, no descriptors. The
//!    compositor replies with the descriptors of surface `id`, or none if the
//!    surface is unknown or not ready.
//! 2. **Offer**: header with `direction = Offer`, carrying the client's buffer
//!    planes as ancillary data (SCM_RIGHTS). The compositor replies with an
//!    empty `Reply` once the planes are imported.
//!
//! Ancillary data never carries more than [`MAX_DESCRIPTORS`] handles.

use bytemuck::{Pod, Zeroable};
use std::mem;

/// Upper bound of descriptors travelling in a single message.
pub const MAX_DESCRIPTORS: usize = 4;

/// Surface id reserved for the compositor's render device.
pub const DISPLAY_ID: u32 = 0;

/// Direction of a message on the privileged channel.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request = 1,
    Offer = 2,
    Reply = 3,
}

impl TryFrom<u32> for Direction {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Direction::Request),
            2 => Ok(Direction::Offer),
            3 => Ok(Direction::Reply),
            other => Err(other),
        }
    }
}

/// Header for every message on the privileged channel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ExchangeHeader {
    /// Magic number to verify protocol sync
    pub magic: u32,
    /// [`Direction`] as its wire value
    pub direction: u32,
    /// Surface the exchange is about
    pub id: u32,
    /// Number of file descriptors attached to this message (via ancillary data)
    pub num_fds: u32,
}

impl ExchangeHeader {
    pub const MAGIC: u32 = 0x4d4f5341; // "MOSA" in ASCII

    pub fn new(direction: Direction, id: u32, num_fds: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            direction: direction as u32,
            id,
            num_fds,
        }
    }

    /// Size of the header in bytes
    pub const fn size() -> usize {
        mem::size_of::<Self>()
    }
}
