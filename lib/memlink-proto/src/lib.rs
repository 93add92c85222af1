// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire format for the shared-memory link.
//!
//! Every transaction starts with a fixed 4-byte little-endian header:
//! 4 bits of opcode, 20 bits of byte address into the shared image, and
//! 8 bits of payload length. The opcode's least significant bit is zero
//! on requests and one on the matching response; responses do not carry
//! a full header, only a type byte (and, for data-bearing ops, a length
//! byte, the payload, and a checksum).
//!
//! Payload lengths 0 and 255 are reserved on the data ops; control ops
//! (fifo clear/reset, device reset) require length zero.

#![cfg_attr(not(test), no_std)]

mod error;

pub use error::ProtocolError;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use static_assertions::const_assert;

/// Size of a serialized request header.
pub const HEADER_SIZE: usize = 4;

/// Largest payload a single data transaction may carry. Larger spans are
/// split across several transactions.
pub const MAX_DATA_LEN: u8 = 254;

/// Set on the type byte of every response.
pub const RESPONSE_BIT: u8 = 0x01;

const TYPE_BITS: u32 = 4;
const ADDR_BITS: u32 = 20;
const ADDR_MASK: u32 = (1 << ADDR_BITS) - 1;

// The header bit fields must tile a u32 exactly.
const_assert!(TYPE_BITS + ADDR_BITS + 8 == 32);

/// Transaction opcodes, as they appear in the low nibble of the header
/// with the response bit cleared.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Op {
    /// Copy bytes out of the responder's image.
    Read = 0x0,
    /// Copy bytes into the responder's image.
    Write = 0x2,
    /// Dequeue bytes from one of the responder's rings.
    ReadFifo = 0x4,
    /// Enqueue bytes into one of the responder's rings.
    WriteFifo = 0x6,
    /// Drop the contents of one of the responder's rings.
    ClearFifo = 0x8,
    /// Drop contents and rewind the indices of one of the responder's
    /// rings.
    ResetFifo = 0xA,
    /// Ask the responder to reset itself.
    DeviceReset = 0xC,
}

impl Op {
    /// Splits a wire type byte into its opcode and response flag.
    pub fn from_wire(byte: u8) -> Result<(Op, bool), ProtocolError> {
        let nibble = byte & 0x0F;
        let op = Op::from_u8(nibble & !RESPONSE_BIT)
            .ok_or(ProtocolError::BadOpcode(nibble))?;
        Ok((op, nibble & RESPONSE_BIT != 0))
    }

    /// The wire type byte of a request carrying this opcode.
    pub fn request_type(self) -> u8 {
        self as u8
    }

    /// The wire type byte of the matching response.
    pub fn response_type(self) -> u8 {
        self as u8 | RESPONSE_BIT
    }

    /// True for the ops that address a ring descriptor rather than a
    /// byte span of the image.
    pub fn targets_fifo(self) -> bool {
        matches!(
            self,
            Op::ReadFifo | Op::WriteFifo | Op::ClearFifo | Op::ResetFifo
        )
    }

    /// True for the zero-length control ops.
    pub fn is_control(self) -> bool {
        matches!(self, Op::ClearFifo | Op::ResetFifo | Op::DeviceReset)
    }

    /// True when the request frame itself carries payload bytes.
    pub fn request_carries_data(self) -> bool {
        matches!(self, Op::Write | Op::WriteFifo)
    }
}

/// A decoded request header.
///
/// Responses never carry one of these on the wire; the pending queue
/// holds the request header a response is matched against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub op: Op,
    /// Byte offset into the shared image, 20 bits.
    pub addr: u32,
    /// Payload length. Zero only on control ops.
    pub len: u8,
}

impl Header {
    pub fn new(op: Op, addr: u32, len: u8) -> Self {
        debug_assert!(addr <= ADDR_MASK);
        Self { op, addr, len }
    }

    /// Serializes to the little-endian wire form.
    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let word = u32::from(self.op.request_type())
            | (self.addr & ADDR_MASK) << TYPE_BITS
            | u32::from(self.len) << (TYPE_BITS + ADDR_BITS);
        word.to_le_bytes()
    }

    /// Deserializes a request header, rejecting unknown opcodes and
    /// type bytes with the response bit set.
    pub fn unpack(raw: [u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let word = u32::from_le_bytes(raw);
        let nibble = (word & 0x0F) as u8;
        if nibble & RESPONSE_BIT != 0 {
            return Err(ProtocolError::BadOpcode(nibble));
        }
        let op =
            Op::from_u8(nibble).ok_or(ProtocolError::BadOpcode(nibble))?;
        Ok(Self {
            op,
            addr: (word >> TYPE_BITS) & ADDR_MASK,
            len: (word >> (TYPE_BITS + ADDR_BITS)) as u8,
        })
    }

    /// Checks the length field against the rules for this opcode:
    /// control ops take exactly zero, data ops anything in
    /// `1..=MAX_DATA_LEN`.
    pub fn check_len(&self) -> Result<(), ProtocolError> {
        let ok = if self.op.is_control() {
            self.len == 0
        } else {
            (1..=MAX_DATA_LEN).contains(&self.len)
        };
        if ok {
            Ok(())
        } else {
            Err(ProtocolError::BadLength(self.len))
        }
    }

    /// Total bytes this request occupies on the wire.
    pub fn request_wire_len(&self) -> usize {
        if self.op.request_carries_data() {
            // Header, payload, checksum.
            HEADER_SIZE + self.len as usize + 1
        } else {
            HEADER_SIZE
        }
    }

    /// Total bytes the matching response occupies on the wire, given the
    /// payload length the responder actually delivers.
    pub fn response_wire_len(op: Op, len: u8) -> usize {
        match op {
            // Type, length, payload, checksum.
            Op::Read | Op::ReadFifo => 3 + len as usize,
            // Type, accepted length.
            Op::Write | Op::WriteFifo => 2,
            // Type only.
            Op::ClearFifo | Op::ResetFifo | Op::DeviceReset => 1,
        }
    }
}

/// Computes the checksum byte for `bytes`: the two's-complement negation
/// of their byte-wise sum, so that summing payload plus checksum over
/// the same window yields zero.
pub fn checksum<I>(bytes: I) -> u8
where
    I: IntoIterator<Item = u8>,
{
    let mut sum = 0u8;
    for b in bytes {
        sum = sum.wrapping_add(b);
    }
    sum.wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_OPS: [Op; 7] = [
        Op::Read,
        Op::Write,
        Op::ReadFifo,
        Op::WriteFifo,
        Op::ClearFifo,
        Op::ResetFifo,
        Op::DeviceReset,
    ];

    #[test]
    fn header_round_trip() {
        for op in ALL_OPS {
            for addr in [0, 1, 0x555, 0xFFFF, 0xF_FFFF] {
                for len in [0u8, 1, 2, 127, 254, 255] {
                    let h = Header::new(op, addr, len);
                    assert_eq!(Header::unpack(h.pack()), Ok(h));
                }
            }
        }
    }

    #[test]
    fn header_wire_bytes() {
        // type=2 (write), addr=0x20, len=1:
        // word = 0x2 | 0x20 << 4 | 1 << 24 = 0x0100_0202
        let h = Header::new(Op::Write, 0x20, 1);
        assert_eq!(h.pack(), [0x02, 0x02, 0x00, 0x01]);

        let h = Header::new(Op::ReadFifo, 0xF_FFFF, 254);
        assert_eq!(h.pack(), [0xF4, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn unpack_rejects_junk() {
        // Unknown opcode nibble.
        assert_eq!(
            Header::unpack([0x0E, 0, 0, 0]),
            Err(ProtocolError::BadOpcode(0x0E))
        );
        // Response bit set: responses don't carry headers.
        assert_eq!(
            Header::unpack([0x03, 0, 0, 0]),
            Err(ProtocolError::BadOpcode(0x03))
        );
    }

    #[test]
    fn wire_type_bytes() {
        assert_eq!(Op::Read.request_type(), 0x0);
        assert_eq!(Op::Read.response_type(), 0x1);
        assert_eq!(Op::DeviceReset.request_type(), 0xC);
        assert_eq!(Op::DeviceReset.response_type(), 0xD);
        for op in ALL_OPS {
            let (back, resp) = Op::from_wire(op.request_type()).unwrap();
            assert_eq!((back, resp), (op, false));
            let (back, resp) = Op::from_wire(op.response_type()).unwrap();
            assert_eq!((back, resp), (op, true));
        }
        assert!(Op::from_wire(0x0E).is_err());
    }

    #[test]
    fn length_rules() {
        assert!(Header::new(Op::Read, 0, 0).check_len().is_err());
        assert!(Header::new(Op::Read, 0, 255).check_len().is_err());
        assert!(Header::new(Op::Read, 0, 1).check_len().is_ok());
        assert!(Header::new(Op::Write, 0, 254).check_len().is_ok());
        assert!(Header::new(Op::ClearFifo, 0, 0).check_len().is_ok());
        assert!(Header::new(Op::ClearFifo, 0, 1).check_len().is_err());
        assert!(Header::new(Op::DeviceReset, 0, 3).check_len().is_err());
    }

    #[test]
    fn checksum_law() {
        let payloads: [&[u8]; 5] = [
            &[],
            &[0x01],
            &[0xA5],
            &[0x34, 0x12, 0x78, 0x56],
            &[0xFF; 254],
        ];
        for p in payloads {
            let chk = checksum(p.iter().copied());
            let total = p
                .iter()
                .fold(chk, |acc, &b| acc.wrapping_add(b));
            assert_eq!(total, 0);
        }
        // The literal from the LED scenario: one payload byte 0x01.
        assert_eq!(checksum([0x01]), 0xFF);
        // And from the GPIO scenario: 0xA5.
        assert_eq!(checksum([0xA5]), 0x5B);
    }

    #[test]
    fn wire_sizes() {
        let w = Header::new(Op::Write, 0, 5);
        assert_eq!(w.request_wire_len(), 10);
        assert_eq!(Header::new(Op::Read, 0, 5).request_wire_len(), 4);
        assert_eq!(Header::response_wire_len(Op::Read, 5), 8);
        assert_eq!(Header::response_wire_len(Op::Write, 5), 2);
        assert_eq!(Header::response_wire_len(Op::ClearFifo, 0), 1);
    }
}
