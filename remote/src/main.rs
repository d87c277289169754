// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The remote process entry point. Parses the inherited socket fd the host
//! passed as `argv[1]` and runs the command dispatcher against it, mirroring
//! `remote/remote-main.c`'s `main()`: a thin binary that hands off to
//! library code for the actual behavior.

extern crate devices;
extern crate libc;
extern crate msg_socket;
extern crate serde_json;
#[macro_use]
extern crate sys_util;

use std::env;
use std::os::unix::io::RawFd;
use std::process;

use devices::pci::{PciClassCode, PciConfiguration, PciHeaderType, PciMultimediaSubclass};
use devices::{Bus, DeviceModel, RemoteState};
use msg_socket::ProxyLink;

/// Stand-in device/drive model: logs every hotplug operation and always
/// succeeds. A real embedding supplies its own `DeviceModel`; the block and
/// SCSI stacks one would drive are explicitly out of scope for this core.
struct NullDeviceModel;

impl DeviceModel for NullDeviceModel {
    fn add_device(&mut self, opts: &serde_json::Value) -> Result<(), String> {
        info!("add_device {}", opts);
        Ok(())
    }
    fn del_device(&mut self, opts: &serde_json::Value) -> Result<(), String> {
        info!("del_device {}", opts);
        Ok(())
    }
    fn add_drive(&mut self, opts: &serde_json::Value) -> Result<(), String> {
        info!("add_drive {}", opts);
        Ok(())
    }
    fn del_drive(&mut self, opts: &serde_json::Value) -> Result<(), String> {
        info!("del_drive {}", opts);
        Ok(())
    }
    fn resize_drive(&mut self, opts: &serde_json::Value) -> Result<(), String> {
        info!("resize_drive {}", opts);
        Ok(())
    }
}

/// `argv[1]` is the decimal fd number of the remote's end of the pre-created
/// socket pair the host passed down across `exec`.
fn parse_sock_fd() -> Option<RawFd> {
    env::args().nth(1)?.parse().ok()
}

fn main() {
    sys_util::syslog::init("remote");

    let sock = match parse_sock_fd() {
        Some(fd) => fd,
        None => {
            error!("usage: remote <inherited-socket-fd>");
            process::exit(1);
        }
    };

    let link = ProxyLink::new(sock);
    let config = PciConfiguration::new(
        0,
        0,
        PciClassCode::Other,
        &PciMultimediaSubclass::Other,
        PciHeaderType::Device,
    );
    let mut state = RemoteState::new(NullDeviceModel, config, Bus::new(), Bus::new());

    if let Err(e) = state.run(&link) {
        error!("dispatch loop exited: {}", e);
        process::exit(1);
    }
}
