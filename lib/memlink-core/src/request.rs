// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request emission: serializing delayed transactions into the outbound
//! ring and recording them in the pending queue.
//!
//! Nothing here blocks. When the pending ring or the outbound ring has
//! no room the push is refused with [`Backlog`] and the caller retires
//! an outstanding transaction first.

use memlink_proto::{checksum, Header, Op, MAX_DATA_LEN};

use crate::image::SharedMem;
use crate::layout::FifoId;
use crate::pending::PendingQueue;

/// Why a request could not be enqueued right now. Transient; never a
/// protocol failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backlog {
    /// The pending ring is at depth.
    Pending,
    /// The outbound ring lacks room for the whole frame.
    TxSpace,
}

/// Enqueues a payload-free request frame: READ, READ-FIFO, or any of
/// the control ops.
pub fn push_plain(
    mem: &mut SharedMem,
    pending: &mut PendingQueue,
    header: Header,
) -> Result<(), Backlog> {
    debug_assert!(!header.op.request_carries_data());
    reserve(mem, pending, &header)?;
    mem.fifo_mut(FifoId::Tx).write_from(&header.pack());
    Ok(())
}

/// Enqueues a WRITE request whose payload is copied out of the local
/// image at the header's address.
pub fn push_write(
    mem: &mut SharedMem,
    pending: &mut PendingQueue,
    header: Header,
) -> Result<(), Backlog> {
    debug_assert_eq!(header.op, Op::Write);
    reserve(mem, pending, &header)?;

    let mut buf = [0; MAX_DATA_LEN as usize];
    let payload = &mut buf[..header.len as usize];
    mem.read_bytes(header.addr, payload);
    let chk = checksum(payload.iter().copied());

    let tx = mem.fifo_mut(FifoId::Tx);
    tx.write_from(&header.pack());
    tx.write_from(&buf[..header.len as usize]);
    tx.write_from(&[chk]);
    Ok(())
}

/// Enqueues a WRITE-FIFO request, draining `len` bytes out of the local
/// mirror ring `id` as the payload.
///
/// The bytes leave the mirror here, whether or not the responder ends
/// up accepting all of them; a short accepted count in the response is
/// the back-pressure signal.
///
/// # Panics
///
/// Panics if the mirror holds fewer than `len` bytes; callers clamp to
/// `count()` first.
pub fn push_write_fifo(
    mem: &mut SharedMem,
    pending: &mut PendingQueue,
    id: FifoId,
    len: u8,
) -> Result<(), Backlog> {
    assert!(len as usize <= mem.fifo(id).count());
    let header = Header::new(Op::WriteFifo, id.descriptor_addr(), len);
    reserve(mem, pending, &header)?;

    let mut buf = [0; MAX_DATA_LEN as usize];
    let n = mem.fifo_mut(id).read_into(&mut buf[..len as usize]);
    let chk = checksum(buf[..n].iter().copied());

    let tx = mem.fifo_mut(FifoId::Tx);
    tx.write_from(&header.pack());
    tx.write_from(&buf[..n]);
    tx.write_from(&[chk]);
    Ok(())
}

/// Common admission check: room in the pending ring and room in the
/// outbound ring for the entire frame, committed atomically.
fn reserve(
    mem: &mut SharedMem,
    pending: &mut PendingQueue,
    header: &Header,
) -> Result<(), Backlog> {
    debug_assert!(header.check_len().is_ok());
    if mem.fifo(FifoId::Tx).remain() < header.request_wire_len() {
        return Err(Backlog::TxSpace);
    }
    pending.push(*header).map_err(|_| Backlog::Pending)
}
