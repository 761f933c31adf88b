// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv6Addr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("out of memory allocating {0}")]
    NoMemory(&'static str),

    #[error("no such route")]
    NotFound,

    #[error("gateway {0} unreachable")]
    HostUnreachable(Ipv6Addr),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("command {0:#x} not supported")]
    NotSupported(u32),

    #[error("route message decode error after {consumed} bytes: {reason}")]
    Decode { consumed: usize, reason: String },
}

impl Error {
    /// The classic errno value an administrative caller would see.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoMemory(_) => 12,
            Self::NotFound => 2,
            Self::HostUnreachable(_) => 113,
            Self::InvalidArgument(_) => 22,
            Self::PermissionDenied => 1,
            Self::NotSupported(_) => 95,
            Self::Decode { .. } => 22,
        }
    }
}
