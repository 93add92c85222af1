// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol-level failures.

use core::fmt;

/// A violation of the wire protocol.
///
/// Every variant is fatal to the link: the byte stream can no longer be
/// trusted and the session must be torn down. Back-pressure (short
/// accepted or delivered fifo lengths) is deliberately *not* represented
/// here; it is ordinary data returned to callers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// A type byte decoded to no known operation, or a bare response
    /// type arrived where a request header was required.
    BadOpcode(u8),
    /// A length field outside the rules for its opcode: 0 or 255 on a
    /// data op, non-zero on a control op.
    BadLength(u8),
    /// A response length inconsistent with the request at the head of
    /// the pending queue.
    LengthMismatch { requested: u8, got: u8 },
    /// Payload bytes plus checksum did not sum to zero.
    Checksum,
    /// A data span reaching outside the shared image.
    AddrRange { addr: u32, len: u8 },
    /// A fifo op whose address is not a descriptor-slot boundary inside
    /// the descriptor region.
    FifoAlignment { addr: u32 },
    /// A fifo op aimed at one of the link's own rings, which would
    /// corrupt the transport that carries it.
    LinkFifo { addr: u32 },
    /// A response arrived with nothing pending, or with an opcode other
    /// than the oldest pending request's.
    UnexpectedResponse(u8),
}

impl core::error::Error for ProtocolError {}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadOpcode(t) => write!(f, "unknown type byte {t:#04x}"),
            Self::BadLength(n) => write!(f, "illegal length field {n}"),
            Self::LengthMismatch { requested, got } => write!(
                f,
                "response length {got} does not answer request length {requested}"
            ),
            Self::Checksum => f.write_str("payload checksum mismatch"),
            Self::AddrRange { addr, len } => write!(
                f,
                "span {addr:#07x}+{len} reaches outside the shared image"
            ),
            Self::FifoAlignment { addr } => write!(
                f,
                "address {addr:#07x} is not a fifo descriptor slot"
            ),
            Self::LinkFifo { addr } => write!(
                f,
                "fifo op at {addr:#07x} targets a link ring"
            ),
            Self::UnexpectedResponse(t) => write!(
                f,
                "response type {t:#04x} matches no pending request"
            ),
        }
    }
}
