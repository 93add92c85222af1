// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The symmetric transaction handler.
//!
//! Both endpoints run the same state machine: inspect the first byte of
//! the inbound ring, service exactly one frame if it is complete, and
//! otherwise report how many inbound bytes (or outbound free bytes) the
//! next attempt needs. A frame is validated through [`Fifo::peek`]
//! before any byte of it is consumed, so a truncated or not-yet-arrived
//! frame never leaves partial state behind.
//!
//! Responses are matched positionally against the pending queue; a
//! response that does not answer the oldest pending request means the
//! byte stream itself can no longer be trusted, and every such failure
//! is returned as a fatal [`ProtocolError`].

use memlink_proto::{Header, Op, ProtocolError, MAX_DATA_LEN};

use bytefifo::Fifo;

use crate::image::SharedMem;
use crate::layout::FifoId;
use crate::pending::PendingQueue;

/// Result of one handler step that did not break the link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// One complete frame was serviced.
    Handled,
    /// The inbound ring must hold at least this many bytes (in total)
    /// before the frame at its head can be serviced.
    NeedRx(usize),
    /// The outbound ring must have at least this many free bytes before
    /// the response can be emitted.
    NeedTx(usize),
    /// The inbound ring is empty.
    Idle,
}

/// Hook points around frame servicing. Every method defaults to a
/// no-op; endpoints override what they care about.
pub trait Hooks {
    /// Runs after an inbound request is validated and consumed, before
    /// its operation executes.
    fn before(&mut self, _mem: &mut SharedMem, _header: &Header) {}

    /// Runs after an inbound request's operation and response emission.
    fn after(&mut self, _mem: &mut SharedMem, _header: &Header) {}

    /// Runs when a response retires the oldest pending request.
    /// `actual` is the payload length the responder reported: the
    /// delivered length for READ/READ-FIFO, the accepted length for
    /// WRITE/WRITE-FIFO (short means back-pressure), zero for control
    /// ops.
    fn complete(&mut self, _header: &Header, _actual: u8) {}

    /// Runs when a DEVICE-RESET request is serviced.
    fn reset(&mut self, _mem: &mut SharedMem) {}
}

/// The hookless endpoint.
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Attempts to service the single frame at the head of the inbound
/// ring.
///
/// Returns a fatal [`ProtocolError`] on any violation of the wire
/// contract; the link must be torn down and no further frames serviced.
pub fn try_handle_one(
    mem: &mut SharedMem,
    pending: &mut PendingQueue,
    hooks: &mut dyn Hooks,
) -> Result<Outcome, ProtocolError> {
    let rx = mem.fifo(FifoId::Rx);
    if rx.is_empty() {
        return Ok(Outcome::Idle);
    }
    let type_byte = rx.peek(0) & 0x0F;
    let (op, is_response) = Op::from_wire(type_byte)?;
    if is_response {
        handle_response(mem, pending, hooks, op, type_byte)
    } else {
        handle_request(mem, hooks)
    }
}

/// Services frames until the inbound ring runs dry or a frame is
/// incomplete. Returns the number serviced.
pub fn try_handle_all(
    mem: &mut SharedMem,
    pending: &mut PendingQueue,
    hooks: &mut dyn Hooks,
) -> Result<usize, ProtocolError> {
    let mut handled = 0;
    while try_handle_one(mem, pending, hooks)? == Outcome::Handled {
        handled += 1;
    }
    Ok(handled)
}

fn handle_response(
    mem: &mut SharedMem,
    pending: &mut PendingQueue,
    hooks: &mut dyn Hooks,
    op: Op,
    type_byte: u8,
) -> Result<Outcome, ProtocolError> {
    let head = pending
        .head()
        .ok_or(ProtocolError::UnexpectedResponse(type_byte))?;
    if head.op != op {
        return Err(ProtocolError::UnexpectedResponse(type_byte));
    }

    let actual = match op {
        Op::Read => {
            let rx = mem.fifo(FifoId::Rx);
            if rx.count() < 2 {
                return Ok(Outcome::NeedRx(2));
            }
            let got = rx.peek(1);
            if got != head.len {
                return Err(ProtocolError::LengthMismatch {
                    requested: head.len,
                    got,
                });
            }
            let len = got as usize;
            if rx.count() < 3 + len {
                return Ok(Outcome::NeedRx(3 + len));
            }
            check_window(rx, 2, len)?;

            let mut buf = [0; MAX_DATA_LEN as usize];
            let rx = mem.fifo_mut(FifoId::Rx);
            rx.discard(2);
            rx.read_into(&mut buf[..len]);
            rx.discard(1);
            mem.write_bytes(head.addr, &buf[..len]);
            got
        }
        Op::ReadFifo => {
            let rx = mem.fifo(FifoId::Rx);
            if rx.count() < 2 {
                return Ok(Outcome::NeedRx(2));
            }
            let got = rx.peek(1);
            // Delivery may fall short of the request, never exceed it.
            if got > head.len {
                return Err(ProtocolError::LengthMismatch {
                    requested: head.len,
                    got,
                });
            }
            let len = got as usize;
            if rx.count() < 3 + len {
                return Ok(Outcome::NeedRx(3 + len));
            }
            check_window(rx, 2, len)?;

            let mut buf = [0; MAX_DATA_LEN as usize];
            let rx = mem.fifo_mut(FifoId::Rx);
            rx.discard(2);
            rx.read_into(&mut buf[..len]);
            rx.discard(1);
            // Our own request produced this address; it still names a
            // valid non-link ring.
            let id = FifoId::from_descriptor_addr(head.addr)?;
            // A saturated mirror truncates, mirroring the responder's
            // write-fifo rule.
            mem.fifo_mut(id).write_from(&buf[..len]);
            got
        }
        Op::Write | Op::WriteFifo => {
            let rx = mem.fifo(FifoId::Rx);
            if rx.count() < 2 {
                return Ok(Outcome::NeedRx(2));
            }
            let got = rx.peek(1);
            let honest = if op == Op::Write {
                // The echoed length must match exactly.
                got == head.len
            } else {
                // Acceptance may fall short: back-pressure.
                got <= head.len
            };
            if !honest {
                return Err(ProtocolError::LengthMismatch {
                    requested: head.len,
                    got,
                });
            }
            mem.fifo_mut(FifoId::Rx).discard(2);
            got
        }
        Op::ClearFifo | Op::ResetFifo | Op::DeviceReset => {
            mem.fifo_mut(FifoId::Rx).discard(1);
            0
        }
    };

    pending.advance();
    hooks.complete(&head, actual);
    Ok(Outcome::Handled)
}

fn handle_request(
    mem: &mut SharedMem,
    hooks: &mut dyn Hooks,
) -> Result<Outcome, ProtocolError> {
    let rx = mem.fifo(FifoId::Rx);
    if rx.count() < 4 {
        return Ok(Outcome::NeedRx(4));
    }
    let mut raw = [0; 4];
    for (i, b) in raw.iter_mut().enumerate() {
        *b = rx.peek(i);
    }
    let header = Header::unpack(raw)?;
    header.check_len()?;

    let len = header.len as usize;
    match header.op {
        Op::Read => {
            SharedMem::check_span(header.addr, header.len)?;
            if mem.fifo(FifoId::Tx).remain() < 3 + len {
                return Ok(Outcome::NeedTx(3 + len));
            }
            mem.fifo_mut(FifoId::Rx).discard(4);
            hooks.before(mem, &header);

            let mut buf = [0; MAX_DATA_LEN as usize];
            mem.read_bytes(header.addr, &mut buf[..len]);
            respond_data(mem, Op::Read, &buf[..len]);
        }
        Op::Write => {
            SharedMem::check_span(header.addr, header.len)?;
            let rx = mem.fifo(FifoId::Rx);
            if rx.count() < 4 + len + 1 {
                return Ok(Outcome::NeedRx(4 + len + 1));
            }
            if mem.fifo(FifoId::Tx).remain() < 2 {
                return Ok(Outcome::NeedTx(2));
            }
            check_window(mem.fifo(FifoId::Rx), 4, len)?;

            mem.fifo_mut(FifoId::Rx).discard(4);
            hooks.before(mem, &header);

            let mut buf = [0; MAX_DATA_LEN as usize];
            let rx = mem.fifo_mut(FifoId::Rx);
            rx.read_into(&mut buf[..len]);
            rx.discard(1);
            mem.write_bytes(header.addr, &buf[..len]);
            respond_short(mem, Op::Write, header.len);
        }
        Op::ReadFifo => {
            let id = data_ring(header.addr)?;
            let deliver = len.min(mem.fifo(id).count());
            if mem.fifo(FifoId::Tx).remain() < 3 + deliver {
                return Ok(Outcome::NeedTx(3 + deliver));
            }
            mem.fifo_mut(FifoId::Rx).discard(4);
            hooks.before(mem, &header);

            // Underflow is not an error here; a short payload tells the
            // initiator how much there was.
            let mut buf = [0; MAX_DATA_LEN as usize];
            let n = mem.fifo_mut(id).read_into(&mut buf[..deliver]);
            respond_data(mem, Op::ReadFifo, &buf[..n]);
        }
        Op::WriteFifo => {
            let id = data_ring(header.addr)?;
            let rx = mem.fifo(FifoId::Rx);
            if rx.count() < 4 + len + 1 {
                return Ok(Outcome::NeedRx(4 + len + 1));
            }
            if mem.fifo(FifoId::Tx).remain() < 2 {
                return Ok(Outcome::NeedTx(2));
            }
            check_window(mem.fifo(FifoId::Rx), 4, len)?;

            mem.fifo_mut(FifoId::Rx).discard(4);
            hooks.before(mem, &header);

            // Accept what fits, consume the overflow from the wire
            // regardless, and report the accepted count back.
            let accepted = len.min(mem.fifo(id).remain());
            let mut buf = [0; MAX_DATA_LEN as usize];
            let rx = mem.fifo_mut(FifoId::Rx);
            rx.read_into(&mut buf[..accepted]);
            rx.discard(len - accepted);
            rx.discard(1);
            mem.fifo_mut(id).write_from(&buf[..accepted]);
            respond_short(mem, Op::WriteFifo, accepted as u8);
        }
        Op::ClearFifo | Op::ResetFifo => {
            let id = data_ring(header.addr)?;
            if mem.fifo(FifoId::Tx).remain() < 1 {
                return Ok(Outcome::NeedTx(1));
            }
            mem.fifo_mut(FifoId::Rx).discard(4);
            hooks.before(mem, &header);

            let ring = mem.fifo_mut(id);
            if header.op == Op::ClearFifo {
                ring.clear();
            } else {
                ring.reset();
            }
            respond_control(mem, header.op);
        }
        Op::DeviceReset => {
            if mem.fifo(FifoId::Tx).remain() < 1 {
                return Ok(Outcome::NeedTx(1));
            }
            mem.fifo_mut(FifoId::Rx).discard(4);
            hooks.before(mem, &header);
            hooks.reset(mem);
            respond_control(mem, Op::DeviceReset);
        }
    }

    hooks.after(mem, &header);
    Ok(Outcome::Handled)
}

/// Verifies that `len` payload bytes plus the trailing checksum byte,
/// peeked starting `start` bytes past the ring's read side, sum to
/// zero.
fn check_window(
    rx: &Fifo,
    start: usize,
    len: usize,
) -> Result<(), ProtocolError> {
    let mut sum = 0u8;
    for i in 0..=len {
        sum = sum.wrapping_add(rx.peek(start + i));
    }
    if sum == 0 {
        Ok(())
    } else {
        Err(ProtocolError::Checksum)
    }
}

/// Resolves a fifo-op address, additionally refusing the link's own
/// rings.
fn data_ring(addr: u32) -> Result<FifoId, ProtocolError> {
    let id = FifoId::from_descriptor_addr(addr)?;
    if id.is_link_ring() {
        return Err(ProtocolError::LinkFifo { addr });
    }
    Ok(id)
}

/// Emits a payload-bearing response: type, length, payload, checksum.
/// Outbound room was checked by the caller.
fn respond_data(mem: &mut SharedMem, op: Op, payload: &[u8]) {
    let chk = memlink_proto::checksum(payload.iter().copied());
    let tx = mem.fifo_mut(FifoId::Tx);
    tx.write_from(&[op.response_type(), payload.len() as u8]);
    tx.write_from(payload);
    tx.write_from(&[chk]);
}

/// Emits a type + length response.
fn respond_short(mem: &mut SharedMem, op: Op, len: u8) {
    mem.fifo_mut(FifoId::Tx)
        .write_from(&[op.response_type(), len]);
}

/// Emits a type-only response.
fn respond_control(mem: &mut SharedMem, op: Op) {
    mem.fifo_mut(FifoId::Tx).write_from(&[op.response_type()]);
}
