// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

/// Wraps an errno value, giving it a `Display` implementation that prints the
/// libc-provided description of the error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Error(i32);

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Constructs a new error from the current `errno`.
    pub fn last() -> Error {
        Error(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub fn new(e: i32) -> Error {
        Error(e)
    }

    pub fn errno(self) -> i32 {
        self.0
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error(e.raw_os_error().unwrap_or(0))
    }
}

/// Returns a result from the current value of `errno`, mapping 0 to `Ok(())`.
pub fn errno_result<T>() -> Result<T> {
    Err(Error::last())
}
