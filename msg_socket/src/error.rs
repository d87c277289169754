// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

/// Errors produced by the frame codec, the wait-object registry, and the
/// proxy link. Transport and decode errors are fatal to the link they occur
/// on; callers that get one back from `send`/`recv` must tear the link down
/// rather than retry.
#[derive(Debug)]
pub enum Error {
    /// The peer hung up or the socket errored mid-operation.
    Transport(io::Error),
    /// A short read or short write left the frame inconsistent.
    ShortTransfer { expected: usize, got: usize },
    /// `num_fds` on the wire exceeded the 8-fd transmission limit.
    TooManyFds(usize),
    /// The `cmd` ordinal on the wire did not match any known command.
    UnknownCommand(u32),
    /// A command that carries a fixed number of fds received the wrong count.
    WrongFdCount { cmd: &'static str, expected: usize, got: usize },
    /// The ancillary data carried fewer fds than `num_fds` declared.
    RightsTruncated { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "proxy link transport error: {}", e),
            Error::ShortTransfer { expected, got } => {
                write!(f, "short transfer: expected {} bytes, got {}", expected, got)
            }
            Error::TooManyFds(n) => write!(f, "message carried {} fds, limit is 8", n),
            Error::UnknownCommand(cmd) => write!(f, "unknown command ordinal {}", cmd),
            Error::WrongFdCount { cmd, expected, got } => write!(
                f,
                "{} expects {} fds, got {}",
                cmd, expected, got
            ),
            Error::RightsTruncated { expected, got } => write!(
                f,
                "num_fds declared {} but only {} arrived",
                expected, got
            ),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<sys_util::Error> for Error {
    fn from(e: sys_util::Error) -> Self {
        Error::Transport(io::Error::from_raw_os_error(e.errno()))
    }
}
