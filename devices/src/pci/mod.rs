// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PCI configuration-space types shared by the host-side proxy device and
//! the remote's local device model.

mod pci_configuration;
mod pci_device;
mod pci_types;

pub use self::pci_configuration::{
    PciBridgeSubclass, PciClassCode, PciConfiguration, PciHeaderType, PciMultimediaSubclass,
    PciSubclass,
};
pub use self::pci_device::PciDevice;
pub use self::pci_types::PciInterruptPin;
