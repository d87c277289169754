// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side guest resource tracking: today, just the memory-sync listener
//! that ships RAM topology to a remote device.

pub mod memory_sync;

pub use memory_sync::MemorySyncListener;
