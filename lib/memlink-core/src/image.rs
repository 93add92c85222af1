// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The shared-memory image: one endpoint's copy of the register block,
//! the fifo descriptor region, and the arena of ring backing buffers.

use bytefifo::Fifo;
use memlink_proto::ProtocolError;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::layout::{
    self, FifoDesc, FifoId, Registers, DESC_SIZE, FIFO_REGION_START,
    MEM_SIZE,
};

/// One endpoint's image.
///
/// The register block and the descriptor region form a flat, byte
/// addressable space of [`MEM_SIZE`] bytes; every READ/WRITE transaction
/// lands somewhere in it. The rings themselves live in an arena indexed
/// by [`FifoId`] (the descriptor's `handle` word) rather than behind
/// pointers, so the image has the same meaning on either end of the
/// link regardless of pointer width.
#[derive(Debug)]
pub struct SharedMem {
    regs: Registers,
    fifos: [Fifo; layout::FIFO_COUNT],
}

impl SharedMem {
    /// A freshly initialized image: zero-filled except for the identity
    /// registers, with every ring bound and empty.
    pub fn new() -> Self {
        let mut regs = Registers::new_zeroed();
        regs.status = layout::STATUS_INIT;
        regs.verbose = layout::VERBOSE_DEBUG;
        regs.pid.set(layout::MEM_PID);
        regs.version.set(layout::MEM_VERSION);
        regs.size.set(MEM_SIZE as u32);
        Self {
            regs,
            fifos: FifoId::ALL.map(|id| Fifo::new(id.backing_len())),
        }
    }

    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    pub fn fifo(&self, id: FifoId) -> &Fifo {
        &self.fifos[id as usize]
    }

    pub fn fifo_mut(&mut self, id: FifoId) -> &mut Fifo {
        &mut self.fifos[id as usize]
    }

    /// Validates that a data span stays inside the image.
    pub fn check_span(addr: u32, len: u8) -> Result<(), ProtocolError> {
        if addr as usize + len as usize <= MEM_SIZE {
            Ok(())
        } else {
            Err(ProtocolError::AddrRange { addr, len })
        }
    }

    /// Copies `out.len()` image bytes starting at `addr`.
    ///
    /// Reads overlapping the descriptor region observe descriptor bytes
    /// synthesized from the live ring state.
    ///
    /// # Panics
    ///
    /// Panics if the span leaves the image; callers validate first.
    pub fn read_bytes(&self, addr: u32, out: &mut [u8]) {
        let start = addr as usize;
        let end = start + out.len();
        assert!(end <= MEM_SIZE);

        if start < FIFO_REGION_START {
            let n = (FIFO_REGION_START - start).min(out.len());
            out[..n]
                .copy_from_slice(&self.regs.as_bytes()[start..start + n]);
        }
        for id in FifoId::ALL {
            let (dst, src) = match overlap(start, end, id) {
                Some(pair) => pair,
                None => continue,
            };
            let desc = self.descriptor_bytes(id);
            out[dst].copy_from_slice(&desc[src]);
        }
    }

    /// Writes `data` into the image starting at `addr`.
    ///
    /// Within a descriptor slot only the `read`/`write` words take
    /// effect (reduced modulo the ring length); `handle` and `length`
    /// are bound at init and writes to them are dropped.
    ///
    /// # Panics
    ///
    /// Panics if the span leaves the image; callers validate first.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        assert!(end <= MEM_SIZE);

        if start < FIFO_REGION_START {
            let n = (FIFO_REGION_START - start).min(data.len());
            self.regs.as_mut_bytes()[start..start + n]
                .copy_from_slice(&data[..n]);
        }
        for id in FifoId::ALL {
            let (src, dst) = match overlap(start, end, id) {
                Some(pair) => pair,
                None => continue,
            };
            let mut desc = self.descriptor_bytes(id);
            desc[dst].copy_from_slice(&data[src]);
            if let Ok(parsed) = FifoDesc::read_from_bytes(&desc[..]) {
                self.fifos[id as usize]
                    .set_indices(parsed.read.get(), parsed.write.get());
            }
        }
    }

    /// The wire image of one descriptor slot.
    fn descriptor_bytes(&self, id: FifoId) -> [u8; DESC_SIZE] {
        let ring = self.fifo(id);
        let desc = FifoDesc {
            handle: U32::new(id as u32),
            length: U32::new(ring.len() as u32),
            read: U32::new(ring.read_index()),
            write: U32::new(ring.write_index()),
        };
        let mut out = [0; DESC_SIZE];
        out.copy_from_slice(desc.as_bytes());
        out
    }
}

impl Default for SharedMem {
    fn default() -> Self {
        Self::new()
    }
}

/// Intersection of the request span `[start, end)` with `id`'s
/// descriptor slot, as (span-relative range, slot-relative range).
fn overlap(
    start: usize,
    end: usize,
    id: FifoId,
) -> Option<(core::ops::Range<usize>, core::ops::Range<usize>)> {
    let slot = id.descriptor_addr() as usize;
    let lo = start.max(slot);
    let hi = end.min(slot + DESC_SIZE);
    if lo >= hi {
        return None;
    }
    Some((lo - start..hi - start, lo - slot..hi - slot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{MEM_PID, MEM_VERSION};

    #[test]
    fn fresh_image_identity() {
        let mem = SharedMem::new();
        assert_eq!(mem.regs().version.get(), MEM_VERSION);
        assert_eq!(mem.regs().pid.get(), MEM_PID);
        assert_eq!(mem.regs().size.get(), MEM_SIZE as u32);
        assert_eq!(mem.regs().status, layout::STATUS_INIT);
        assert!(mem.fifo(FifoId::Data0).is_empty());
    }

    #[test]
    fn register_bytes_round_trip() {
        let mut mem = SharedMem::new();
        mem.write_bytes(layout::ADC1.addr, &[0x34, 0x12, 0x78, 0x56]);
        assert_eq!(mem.regs().adc1.get(), 0x1234);
        assert_eq!(mem.regs().adc2.get(), 0x5678);

        let mut out = [0; 4];
        mem.read_bytes(layout::VERSION.addr, &mut out);
        assert_eq!(u32::from_le_bytes(out), MEM_VERSION);
    }

    #[test]
    fn descriptor_reads_track_ring_state() {
        let mut mem = SharedMem::new();
        mem.fifo_mut(FifoId::Log).write_from(b"abc");
        let mut out = [0; DESC_SIZE];
        mem.read_bytes(FifoId::Log.descriptor_addr(), &mut out);
        let desc = FifoDesc::read_from_bytes(&out[..]).unwrap();
        assert_eq!(desc.handle.get(), 2);
        assert_eq!(desc.length.get(), 512);
        assert_eq!(desc.read.get(), 0);
        assert_eq!(desc.write.get(), 3);
    }

    #[test]
    fn descriptor_writes_move_only_the_indices() {
        let mut mem = SharedMem::new();
        mem.fifo_mut(FifoId::Data0).write_from(&[1, 2, 3, 4, 5]);

        let mut desc = [0; DESC_SIZE];
        mem.read_bytes(FifoId::Data0.descriptor_addr(), &mut desc);
        // Tamper with everything: handle, length, and both indices.
        desc[0..4].copy_from_slice(&77u32.to_le_bytes());
        desc[4..8].copy_from_slice(&9999u32.to_le_bytes());
        desc[8..12].copy_from_slice(&2u32.to_le_bytes());
        desc[12..16].copy_from_slice(&4u32.to_le_bytes());
        mem.write_bytes(FifoId::Data0.descriptor_addr(), &desc);

        let ring = mem.fifo(FifoId::Data0);
        assert_eq!(ring.read_index(), 2);
        assert_eq!(ring.write_index(), 4);
        assert_eq!(ring.count(), 2);
        // Handle and length were not taken from the write.
        let mut back = [0; DESC_SIZE];
        mem.read_bytes(FifoId::Data0.descriptor_addr(), &mut back);
        assert_eq!(&back[0..4], &3u32.to_le_bytes());
        assert_eq!(&back[4..8], &1024u32.to_le_bytes());
    }

    #[test]
    fn spans_crossing_the_region_boundary() {
        let mut mem = SharedMem::new();
        // Read the last 4 register bytes plus the first 8 descriptor
        // bytes in one go.
        let mut out = [0; 12];
        mem.read_bytes(FIFO_REGION_START as u32 - 4, &mut out);
        assert_eq!(&out[4..8], &0u32.to_le_bytes()); // rx handle
        assert_eq!(&out[8..12], &1024u32.to_le_bytes()); // rx length

        // And a write that straddles two descriptor slots.
        let mut two = [0; DESC_SIZE * 2];
        mem.read_bytes(FifoId::Log.descriptor_addr(), &mut two);
        two[8..12].copy_from_slice(&5u32.to_le_bytes()); // log read
        two[DESC_SIZE + 12..DESC_SIZE + 16]
            .copy_from_slice(&7u32.to_le_bytes()); // data0 write
        mem.write_bytes(FifoId::Log.descriptor_addr(), &two);
        assert_eq!(mem.fifo(FifoId::Log).read_index(), 5);
        assert_eq!(mem.fifo(FifoId::Data0).write_index(), 7);
    }

    #[test]
    fn span_bounds() {
        assert!(SharedMem::check_span(0, 254).is_err());
        assert!(SharedMem::check_span(0, 132).is_ok());
        assert!(SharedMem::check_span(131, 1).is_ok());
        assert!(SharedMem::check_span(131, 2).is_err());
    }
}
