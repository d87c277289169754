// Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A small wrapper around the system log, plus the `error!`/`warn!`/
//! `info!`/`debug!` macros used throughout this workspace instead of
//! `println!`.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static INIT: Once = Once::new();

/// Severity, mapped directly onto the matching `LOG_*` priority.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Error,
    Warning,
    Info,
    Debug,
}

impl Priority {
    fn to_libc(self) -> libc::c_int {
        match self {
            Priority::Error => libc::LOG_ERR,
            Priority::Warning => libc::LOG_WARNING,
            Priority::Info => libc::LOG_INFO,
            Priority::Debug => libc::LOG_DEBUG,
        }
    }
}

/// Opens the connection to the system logger under `ident`. Safe to call more
/// than once; only the first call takes effect.
pub fn init(ident: &str) {
    INIT.call_once(|| {
        let ident = CString::new(ident).unwrap_or_else(|_| CString::new("devproxy").unwrap());
        // SAFETY: `ident` is leaked intentionally; openlog keeps a pointer to
        // it for the life of the process.
        unsafe {
            libc::openlog(
                Box::leak(ident.into_boxed_c_str()).as_ptr(),
                libc::LOG_CONS | libc::LOG_PID,
                libc::LOG_USER,
            );
        }
        INITIALIZED.store(true, Ordering::SeqCst);
    });
}

/// Writes one line to the system log, falling back to stderr if `init` was
/// never called.
pub fn log(priority: Priority, args: std::fmt::Arguments) {
    let line = args.to_string();
    if INITIALIZED.load(Ordering::SeqCst) {
        if let Ok(c_line) = CString::new(line.clone()) {
            let fmt = CString::new("%s").unwrap();
            // SAFETY: `fmt` and `c_line` are valid, NUL-terminated buffers
            // for the duration of this call.
            unsafe {
                libc::syslog(priority.to_libc(), fmt.as_ptr(), c_line.as_ptr());
            }
            return;
        }
    }
    eprintln!("[{:?}] {}", priority, line);
}

#[macro_export]
macro_rules! error {
    ($($args:tt)*) => {
        $crate::syslog::log($crate::syslog::Priority::Error, format_args!($($args)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($args:tt)*) => {
        $crate::syslog::log($crate::syslog::Priority::Warning, format_args!($($args)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($args:tt)*) => {
        $crate::syslog::log($crate::syslog::Priority::Info, format_args!($($args)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($args:tt)*) => {
        $crate::syslog::log($crate::syslog::Priority::Debug, format_args!($($args)*))
    };
}
