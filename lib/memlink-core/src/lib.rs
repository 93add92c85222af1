// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The endpoint-neutral half of the shared-memory link: the image both
//! sides mirror, the queue of requests awaiting responses, request
//! serialization, and the symmetric frame handler.
//!
//! Nothing in this crate performs I/O or blocks. An endpoint is a
//! [`SharedMem`] plus a [`PendingQueue`]; bytes move between the
//! image's link rings and the outside world at a layer above (the host
//! flow driver, or a device main loop), and the handler reports what it
//! is missing through [`Outcome`] rather than waiting for it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod handler;
pub mod image;
pub mod layout;
pub mod pending;
pub mod request;

pub use handler::{try_handle_all, try_handle_one, Hooks, NoHooks, Outcome};
pub use image::SharedMem;
pub use layout::{FifoId, Span};
pub use pending::{PendingFull, PendingQueue};
pub use request::{push_plain, push_write, push_write_fifo, Backlog};
