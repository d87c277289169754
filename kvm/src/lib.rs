// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The narrow boundary between a proxy device and the kernel's interrupt
//! injection path. Actually programming `KVM_IRQFD` is explicitly out of
//! scope for this workspace (an external collaborator); this crate only
//! defines the trait a real KVM vm/vcpu wrapper implements and the small
//! bit of bookkeeping a proxy device needs to reassign routes when the
//! guest's interrupt routing changes underneath it.

use std::fmt::{self, Display};

use sys_util::EventFd;

#[derive(Debug)]
pub enum Error {
    Install(sys_util::Error),
    Deassign(sys_util::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Install(e) => write!(f, "failed to install irqfd: {}", e),
            Error::Deassign(e) => write!(f, "failed to deassign irqfd: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// A GSI (Global System Interrupt) number, the kernel's identifier for one
/// interrupt routing entry.
pub type Gsi = u32;

/// Implemented by whatever owns the real `KVM_IRQFD` ioctl boundary (a VM
/// wrapper in the embedding emulator). A proxy device calls `install` once
/// it has a remote's `intr`/`resample` eventfd pair and calls `deassign`
/// before reassigning to a new GSI on a routing change.
pub trait IntxInstaller {
    /// Registers `intr` as the eventfd that raises `gsi` when written, with
    /// `resample` as the companion resamplefd for level-triggered EOI.
    fn install(&mut self, intr: &EventFd, resample: &EventFd, gsi: Gsi) -> Result<()>;

    /// Tears down a previously installed route.
    fn deassign(&mut self, gsi: Gsi) -> Result<()>;
}

/// Tracks the currently-installed GSI for one proxy device's INTx pin and
/// reinstalls on change: deassigns the previous irqfd and reassigns with
/// the new GSI.
pub struct IntxRoute {
    current_gsi: Option<Gsi>,
}

impl IntxRoute {
    pub fn new() -> IntxRoute {
        IntxRoute { current_gsi: None }
    }

    /// Installs `gsi` as the route for `intr`/`resample`, deassigning
    /// whatever GSI was previously installed first. A no-op if `gsi` is
    /// already the installed route.
    pub fn reroute(
        &mut self,
        installer: &mut dyn IntxInstaller,
        intr: &EventFd,
        resample: &EventFd,
        gsi: Gsi,
    ) -> Result<()> {
        if self.current_gsi == Some(gsi) {
            return Ok(());
        }
        if let Some(old) = self.current_gsi.take() {
            installer.deassign(old)?;
        }
        installer.install(intr, resample, gsi)?;
        self.current_gsi = Some(gsi);
        Ok(())
    }
}

impl Default for IntxRoute {
    fn default() -> Self {
        IntxRoute::new()
    }
}
