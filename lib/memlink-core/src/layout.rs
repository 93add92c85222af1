// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte layout of the shared image.
//!
//! Both endpoints hold a copy of the same fixed-size image: a register
//! block at offset zero and a descriptor slot per embedded ring at the
//! tail. Every multi-byte field is little-endian and byte-aligned, so
//! the structs below have no padding and their zerocopy views are the
//! wire representation.
//!
//! The descriptor region doubles as the address space for the fifo ops:
//! a fifo op's address must land exactly on one of the slots, and the
//! slot index is the opaque handle into the arena of backing buffers.

use core::mem::{offset_of, size_of};

use memlink_proto::ProtocolError;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Image format version, read back at open and required to match.
pub const MEM_VERSION: u32 = 0x1905_2200;

/// Product id the device reports. Recorded, not enforced.
pub const MEM_PID: u16 = 0x1234;

/// `status` values.
pub const STATUS_INIT: u8 = 0x00;
pub const STATUS_IDLE: u8 = 0x01;
pub const STATUS_RUNNING: u8 = 0x66;
pub const STATUS_TEST: u8 = 0xFF;

/// `verbose` levels, ordered; a message prints when its level is at or
/// below the configured one.
pub const VERBOSE_NONE: u8 = 0x00;
pub const VERBOSE_ERROR: u8 = 0x20;
pub const VERBOSE_WARN: u8 = 0x40;
pub const VERBOSE_INFO: u8 = 0x60;
pub const VERBOSE_DEBUG: u8 = 0x80;

/// Per-timer register block.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct TimerRegs {
    /// Non-zero routes the timer to its PWM output pin.
    pub pwm_enable: u8,
    /// Non-zero enables the update interrupt (the streaming tick).
    pub irq_enable: u8,
    pub prescaler: U16,
    pub period: U16,
    pub pulse: U16,
}

/// The register block at the head of the image.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct Registers {
    pub status: u8,
    pub verbose: u8,
    pub pid: U16,
    pub version: U32,
    /// Total image size, for the open-time geometry check.
    pub size: U32,
    /// Device-side count of link bytes dropped on rx overflow.
    pub rx_overflow: U16,
    /// Output port; the device drives its pins when this is written.
    pub gpio_out: u8,
    /// Input port, sampled by the device.
    pub gpio_in: u8,
    /// Write N: the device folds N into `gpio_count` and zeroes this.
    pub gpio_count_add: U32,
    /// Streaming samples still owed; decremented once per timer-1 tick.
    pub gpio_count: U32,
    /// Ticks on which the streaming ring was empty while samples were
    /// still owed.
    pub gpio_underflow: U32,
    pub adc1: U16,
    pub adc2: U16,
    /// LSB drives the board LED.
    pub led: u8,
    pub _reserved: [u8; 3],
    pub timers: [TimerRegs; 2],
}

/// One fifo descriptor slot in the image tail.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct FifoDesc {
    /// Arena index of the backing buffer. Fixed at init.
    pub handle: U32,
    /// Ring length of the backing buffer. Fixed at init.
    pub length: U32,
    pub read: U32,
    pub write: U32,
}

pub const REG_SIZE: usize = size_of::<Registers>();
pub const DESC_SIZE: usize = size_of::<FifoDesc>();
pub const FIFO_COUNT: usize = 5;

/// First byte of the descriptor region.
pub const FIFO_REGION_START: usize = REG_SIZE;

/// Total image size.
pub const MEM_SIZE: usize = REG_SIZE + FIFO_COUNT * DESC_SIZE;

// The offsets are a wire contract; pin them.
const_assert_eq!(size_of::<TimerRegs>(), 8);
const_assert_eq!(REG_SIZE, 52);
const_assert_eq!(DESC_SIZE, 16);
const_assert_eq!(MEM_SIZE, 132);
const_assert_eq!(offset_of!(Registers, gpio_count), 20);
const_assert_eq!(offset_of!(Registers, timers), 36);

/// The embedded rings, in descriptor-slot order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum FifoId {
    /// Link receive ring: bytes in from the transport.
    Rx = 0,
    /// Link transmit ring: bytes out to the transport.
    Tx = 1,
    /// Device debug output.
    Log = 2,
    /// Streaming data, GPIO direction (timer 1).
    Data0 = 3,
    /// Streaming data, ADC direction (timer 2).
    Data1 = 4,
}

impl FifoId {
    pub const ALL: [FifoId; FIFO_COUNT] =
        [FifoId::Rx, FifoId::Tx, FifoId::Log, FifoId::Data0, FifoId::Data1];

    /// Image address of this ring's descriptor slot.
    pub const fn descriptor_addr(self) -> u32 {
        (FIFO_REGION_START + self as usize * DESC_SIZE) as u32
    }

    /// Ring length of the backing buffer.
    pub const fn backing_len(self) -> usize {
        match self {
            FifoId::Rx | FifoId::Tx => 1024,
            FifoId::Log => 512,
            FifoId::Data0 | FifoId::Data1 => 1024,
        }
    }

    /// True for the rings the link itself runs over; fifo ops aimed at
    /// these would corrupt the transport carrying them.
    pub fn is_link_ring(self) -> bool {
        matches!(self, FifoId::Rx | FifoId::Tx)
    }

    /// Resolves a fifo-op address to a ring, enforcing the descriptor
    /// region bounds and slot alignment.
    pub fn from_descriptor_addr(addr: u32) -> Result<Self, ProtocolError> {
        let a = addr as usize;
        if a < FIFO_REGION_START || a + DESC_SIZE > MEM_SIZE {
            return Err(ProtocolError::FifoAlignment { addr });
        }
        let rel = a - FIFO_REGION_START;
        if rel % DESC_SIZE != 0 {
            return Err(ProtocolError::FifoAlignment { addr });
        }
        // In range and aligned, so the index is a valid discriminant.
        match FifoId::from_usize(rel / DESC_SIZE) {
            Some(id) => Ok(id),
            None => Err(ProtocolError::FifoAlignment { addr }),
        }
    }
}

/// A named byte span of the image, the unit the read/write verbs work
/// in. Spans wider than one transaction are split by the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub addr: u32,
    pub len: u32,
}

impl Span {
    pub const fn new(addr: usize, len: usize) -> Self {
        Self {
            addr: addr as u32,
            len: len as u32,
        }
    }

    /// The contiguous span covering both `a` and `b`, inclusive.
    /// `a` must not start after `b`.
    pub const fn between(a: Span, b: Span) -> Span {
        assert!(a.addr <= b.addr + b.len);
        Span {
            addr: a.addr,
            len: b.addr + b.len - a.addr,
        }
    }
}

pub const STATUS: Span = Span::new(offset_of!(Registers, status), 1);
pub const VERBOSE: Span = Span::new(offset_of!(Registers, verbose), 1);
pub const PID: Span = Span::new(offset_of!(Registers, pid), 2);
pub const VERSION: Span = Span::new(offset_of!(Registers, version), 4);
pub const SIZE: Span = Span::new(offset_of!(Registers, size), 4);
pub const RX_OVERFLOW: Span =
    Span::new(offset_of!(Registers, rx_overflow), 2);
pub const GPIO_OUT: Span = Span::new(offset_of!(Registers, gpio_out), 1);
pub const GPIO_IN: Span = Span::new(offset_of!(Registers, gpio_in), 1);
pub const GPIO_COUNT_ADD: Span =
    Span::new(offset_of!(Registers, gpio_count_add), 4);
pub const GPIO_COUNT: Span = Span::new(offset_of!(Registers, gpio_count), 4);
pub const GPIO_UNDERFLOW: Span =
    Span::new(offset_of!(Registers, gpio_underflow), 4);
pub const ADC1: Span = Span::new(offset_of!(Registers, adc1), 2);
pub const ADC2: Span = Span::new(offset_of!(Registers, adc2), 2);
pub const LED: Span = Span::new(offset_of!(Registers, led), 1);

const fn timer_base(timer: usize) -> usize {
    offset_of!(Registers, timers) + timer * size_of::<TimerRegs>()
}

pub const fn timer_pwm_enable(timer: usize) -> Span {
    Span::new(timer_base(timer) + offset_of!(TimerRegs, pwm_enable), 1)
}

pub const fn timer_irq_enable(timer: usize) -> Span {
    Span::new(timer_base(timer) + offset_of!(TimerRegs, irq_enable), 1)
}

pub const fn timer_prescaler(timer: usize) -> Span {
    Span::new(timer_base(timer) + offset_of!(TimerRegs, prescaler), 2)
}

pub const fn timer_period(timer: usize) -> Span {
    Span::new(timer_base(timer) + offset_of!(TimerRegs, period), 2)
}

pub const fn timer_pulse(timer: usize) -> Span {
    Span::new(timer_base(timer) + offset_of!(TimerRegs, pulse), 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_addresses() {
        assert_eq!(FifoId::Rx.descriptor_addr(), 52);
        assert_eq!(FifoId::Data1.descriptor_addr(), 116);
        for id in FifoId::ALL {
            assert_eq!(
                FifoId::from_descriptor_addr(id.descriptor_addr()),
                Ok(id)
            );
        }
    }

    #[test]
    fn descriptor_addr_rejects_misfits() {
        // Inside the register block.
        assert!(FifoId::from_descriptor_addr(0).is_err());
        assert!(FifoId::from_descriptor_addr(48).is_err());
        // Misaligned inside the region.
        assert!(FifoId::from_descriptor_addr(53).is_err());
        assert!(FifoId::from_descriptor_addr(60).is_err());
        // Past the end.
        assert!(FifoId::from_descriptor_addr(MEM_SIZE as u32).is_err());
    }

    #[test]
    fn spans_cover_the_documented_offsets() {
        assert_eq!(VERSION, Span { addr: 4, len: 4 });
        assert_eq!(LED, Span { addr: 32, len: 1 });
        assert_eq!(ADC1.addr, 28);
        let adc = Span::between(ADC1, ADC2);
        assert_eq!(adc, Span { addr: 28, len: 4 });
        let counters = Span::between(GPIO_COUNT, GPIO_UNDERFLOW);
        assert_eq!(counters, Span { addr: 20, len: 8 });
        assert_eq!(timer_prescaler(1), Span { addr: 46, len: 2 });
        let t0 = Span::between(timer_prescaler(0), timer_pulse(0));
        assert_eq!(t0, Span { addr: 38, len: 6 });
    }
}
