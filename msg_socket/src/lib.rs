// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The proxy wire protocol: a frame codec, a one-shot wait-object registry,
//! and the connected-socket event loop that ties them together.

mod error;
mod link;
mod wait;
mod wire;

pub use error::{Error, Result};
pub use link::{LinkEvent, ProxyLink};
pub use wait::{acquire, Notifier, Waiter};
pub use wire::{Command, Message, SyncRegion, HEADER_LEN, MAX_FDS};
