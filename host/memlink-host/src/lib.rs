// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host side of the shared-memory link.
//!
//! A [`Session`] mirrors the device's register image across a byte
//! transport (any [`Link`]), exposing blocking verbs for GPIO, LED,
//! ADC, timers, and flow-controlled sample streaming in both
//! directions. The transport is a trait so the same session runs over
//! a real serial port, the in-memory [`pipe`], or anything else that
//! can move bytes with short-count semantics.
//!
//! ```no_run
//! use memlink_host::{pipe, Session, SimDevice};
//!
//! let (host_end, dev_end) = pipe::duplex();
//! SimDevice::new(dev_end).spawn();
//!
//! let session = Session::open(host_end)?;
//! session.led_set(true)?;
//! session.gpio_write(0xA5)?;
//! let (adc1, adc2) = session.adc_read()?;
//! println!("adc: {adc1} {adc2}");
//! session.close()?;
//! # Ok::<(), memlink_host::Error>(())
//! ```

mod error;
mod link;
pub mod pipe;
mod session;
mod sim;
mod stream;
mod timer;

pub use error::{Error, Result};
pub use link::Link;
pub use session::Session;
pub use sim::{with_version, SimDevice};
pub use timer::{Timer, PERIPH_CLOCK_HZ};

// The protocol vocabulary callers need for spans and observers.
pub use memlink_core::layout;
pub use memlink_core::{FifoId, Span};
pub use memlink_proto::{Header, Op, MAX_DATA_LEN};
