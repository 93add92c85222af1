// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use memlink_proto::ProtocolError;

/// Host-side session failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying transport failed.
    #[error("link i/o failed")]
    Io(#[from] std::io::Error),

    /// The peer hung up mid-session.
    #[error("link closed by peer")]
    LinkClosed,

    /// The byte stream violated the wire contract. The session is
    /// poisoned; every later verb fails with [`Error::Poisoned`].
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// An earlier protocol violation already tore the session down.
    #[error("session poisoned by an earlier protocol failure")]
    Poisoned,

    /// The device speaks a different image format.
    #[error("device image version {device:#010x}, host built for {host:#010x}")]
    VersionMismatch { device: u32, host: u32 },

    /// The device image has different geometry.
    #[error("device image size {device}, host built for {host}")]
    SizeMismatch { device: u32, host: u32 },

    /// The device ticked on an empty streaming ring: the host failed
    /// the timing contract. The streaming run is dead; the session
    /// itself is still usable.
    #[error("streaming underflow, device starved for {lost} tick(s)")]
    Underflow { lost: u32 },

    /// A caller-supplied parameter the hardware cannot express.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
