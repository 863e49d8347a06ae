//! Invariant violations.
//!
//! The allocation path has no way to report an error other than a null
//! pointer, and null means "out of memory".  Registry misuse therefore ends
//! the process.

use std::{
    process,
    sync::atomic::{AtomicBool, Ordering},
};

use backtrace::Backtrace;

use crate::error::ShimError;

static ABORTING: AtomicBool = AtomicBool::new(false);

/// Reports `err` with a backtrace on stderr and aborts.
///
/// Reporting allocates.  If that allocation trips another violation, the
/// nested call aborts without reporting.
#[cold]
#[inline(never)]
pub fn fatal(err: ShimError) -> ! {
    if ABORTING.swap(true, Ordering::SeqCst) {
        process::abort();
    }
    log::error!("zone_shim: {}", err);
    eprintln!("zone_shim: fatal: {}", err);
    eprintln!("{:?}", Backtrace::new());
    process::abort()
}
