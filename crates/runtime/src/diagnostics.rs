//! Runtime diagnostics for production debugging
//!
//! Provides a SIGQUIT (kill -3) handler that dumps runtime statistics to
//! stderr and keeps running, in the spirit of JVM thread dumps.
//!
//! ## Usage
//!
//! ```bash
//! kill -3 <pid>
//! ```

#![cfg(feature = "diagnostics")]

use crate::gc::{TOTAL_CELLS_SWEPT, TOTAL_GC_CYCLES};
use crate::space::{PEAK_HEAP_BYTES, TOTAL_CELLS_ALLOCATED};
use crate::thread::{PEAK_THREADS, TOTAL_THREADS_SPAWNED};
use std::sync::Once;
use std::sync::atomic::Ordering;

static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Install the SIGQUIT signal handler for diagnostics.
///
/// Safe to call multiple times (idempotent).
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            unsafe {
                // SIGQUIT = 3 (same as the JVM's kill -3 thread dumps)
                let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                    dump_diagnostics();
                });
            }
        }
    });
}

/// Dump runtime statistics to stderr.
///
/// Can be called directly or triggered via SIGQUIT. Reads only lock-free
/// counters so it is safe from a signal context.
pub fn dump_diagnostics() {
    use std::io::Write;

    let mut out = std::io::stderr().lock();

    let _ = writeln!(out, "\n=== Proto Runtime Diagnostics ===");
    let _ = writeln!(out, "[Heap]");
    let _ = writeln!(
        out,
        "  Peak bytes:      {}",
        PEAK_HEAP_BYTES.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        out,
        "  Cells allocated: {}",
        TOTAL_CELLS_ALLOCATED.load(Ordering::Relaxed)
    );
    let _ = writeln!(out, "[Collector]");
    let _ = writeln!(
        out,
        "  Cycles:          {}",
        TOTAL_GC_CYCLES.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        out,
        "  Cells swept:     {}",
        TOTAL_CELLS_SWEPT.load(Ordering::Relaxed)
    );
    let _ = writeln!(out, "[Threads]");
    let _ = writeln!(
        out,
        "  Spawned:         {}",
        TOTAL_THREADS_SPAWNED.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        out,
        "  Peak:            {}",
        PEAK_THREADS.load(Ordering::Relaxed)
    );
    let _ = writeln!(out, "=== End Diagnostics ===\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_diagnostics_runs() {
        dump_diagnostics();
    }

    #[test]
    fn test_install_signal_handler_idempotent() {
        install_signal_handler();
        install_signal_handler();
        install_signal_handler();
    }
}
