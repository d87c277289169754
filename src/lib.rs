// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host-side orchestration this core's embedder owns directly: the
//! process-global proxy list and the heartbeat timer that were `QLIST`/
//! static globals in the original, here realized as explicit values
//! (`System`/`Heartbeat`) per the redesign note against process-wide
//! singletons.
//!
//! `devices::proxy::ProxyDevice` itself does not depend on this crate (it
//! lives one layer down in the workspace and `devproxy` already depends on
//! `devices`); the embedder calls `ProxyDevice::realize`, then registers the
//! result's `link()`/`pid()` with a `System` it owns.

extern crate devices;
extern crate libc;
extern crate msg_socket;
#[macro_use]
extern crate sys_util;

pub mod heartbeat;
pub mod system;

pub use heartbeat::Heartbeat;
pub use system::System;
