// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host-side proxy device and the remote-side command dispatcher that
//! together make a remote process's device model appear in-process to the
//! guest and to the host emulator.

extern crate kvm;
extern crate libc;
extern crate msg_socket;
extern crate resources;
extern crate serde_json;
#[macro_use]
extern crate sys_util;

pub mod bus;
pub mod pci;
pub mod proxy;
pub mod remote;

pub use self::bus::{Bus, BusDevice};
pub use self::proxy::Error as ProxyError;
pub use self::proxy::ProxyDevice;
pub use self::remote::{DeviceModel, RemoteState};
