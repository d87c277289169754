// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small, mostly-unsafe wrappers around the Linux primitives the rest of
//! this workspace is built on: `errno`, `eventfd`, `epoll`, `SCM_RIGHTS`
//! fd-passing, a guest-memory stand-in, and the syslog macros.

pub mod errno;
pub mod eventfd;
pub mod guest_memory;
pub mod poll;
pub mod scm_socket;
pub mod syslog;

pub use errno::{errno_result, Error, Result};
pub use eventfd::EventFd;
pub use guest_memory::{GuestAddress, MemoryRegion, RegionKind};
pub use poll::{PollContext, PollEvents, PollToken, TriggeredEvent};
pub use scm_socket::{recv_with_fds, send_with_fds, SCM_MAX_FD};
