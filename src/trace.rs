//! Process-wide debug facilities: log filter, debug trace sink, and the
//! timeslice recorder.
//!
//! All three are explicitly-initialized singletons with no-op fallbacks, so
//! library users who never call [`init`] pay nothing and lose nothing.
//!
//! Configuration is environment-driven (not CLI):
//! - `CRADLE_LOG` — tracing filter directive (e.g. `cradle=debug`)
//! - `CRADLE_TRACE_FILE` — append low-level VM-exit trace records here
//! - `CRADLE_TIMESLICE_FILE` — append per-vCPU timeslice records here
//! - `CRADLE_PCAP_DIR` — packet captures for the pluggable netstack

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use tracing::warn;
use tracing_subscriber::EnvFilter;

static TRACE_SINK: OnceLock<Option<Mutex<File>>> = OnceLock::new();
static TIMESLICE: OnceLock<Option<Mutex<TimesliceRecorder>>> = OnceLock::new();
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Initialize logging and the debug sinks from the environment.
///
/// Safe to call more than once; later calls are no-ops. Intended to be called
/// by the embedding application, not by library code paths.
pub fn init() {
    let filter = EnvFilter::try_from_env("CRADLE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("cradle=info"));
    // A subscriber may already be installed by the host application.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();

    let _ = EPOCH.set(Instant::now());

    TRACE_SINK.get_or_init(|| {
        let path = std::env::var_os("CRADLE_TRACE_FILE").map(PathBuf::from)?;
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Some(Mutex::new(f)),
            Err(e) => {
                warn!("cannot open trace file {}: {}", path.display(), e);
                None
            }
        }
    });

    TIMESLICE.get_or_init(|| {
        let path = std::env::var_os("CRADLE_TIMESLICE_FILE").map(PathBuf::from)?;
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Some(Mutex::new(TimesliceRecorder { file: f })),
            Err(e) => {
                warn!("cannot open timeslice file {}: {}", path.display(), e);
                None
            }
        }
    });
}

/// Flush and drop the sinks. After close, records are discarded.
pub fn close() {
    if let Some(Some(sink)) = TRACE_SINK.get().map(|s| s.as_ref()) {
        if let Ok(mut f) = sink.lock() {
            let _ = f.flush();
        }
    }
    if let Some(Some(rec)) = TIMESLICE.get().map(|s| s.as_ref()) {
        if let Ok(mut r) = rec.lock() {
            let _ = r.file.flush();
        }
    }
}

fn elapsed_us() -> u128 {
    EPOCH.get().map(|e| e.elapsed().as_micros()).unwrap_or(0)
}

/// Record one low-level trace event (VM exit, IRQ edge, queue notify).
/// No-op unless `CRADLE_TRACE_FILE` was set at [`init`] time.
pub fn trace_event(kind: &str, detail: std::fmt::Arguments<'_>) {
    let Some(Some(sink)) = TRACE_SINK.get().map(|s| s.as_ref()) else {
        return;
    };
    if let Ok(mut f) = sink.lock() {
        let _ = writeln!(f, "{} {} {}", elapsed_us(), kind, detail);
    }
}

/// Record a vCPU timeslice: how long one `KVM_RUN` entry lasted and why it
/// exited. No-op unless `CRADLE_TIMESLICE_FILE` was set at [`init`] time.
pub fn record_timeslice(vcpu: usize, entered_us: u128, exit_reason: &str) {
    let Some(Some(rec)) = TIMESLICE.get().map(|s| s.as_ref()) else {
        return;
    };
    if let Ok(mut r) = rec.lock() {
        let _ = writeln!(
            r.file,
            "{} vcpu={} entered={} reason={}",
            elapsed_us(),
            vcpu,
            entered_us,
            exit_reason
        );
    }
}

/// Directory for netstack packet captures, if enabled.
pub fn pcap_dir() -> Option<PathBuf> {
    std::env::var_os("CRADLE_PCAP_DIR").map(PathBuf::from)
}

struct TimesliceRecorder {
    file: File,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_event_is_noop_before_init() {
        // Must not panic or block when nothing is configured.
        trace_event("exit", format_args!("mmio {:#x}", 0xd000_0000u64));
        record_timeslice(0, 12, "hlt");
    }

    #[test]
    fn pcap_dir_reflects_env() {
        // Only checks the unset path to avoid cross-test env races.
        if std::env::var_os("CRADLE_PCAP_DIR").is_none() {
            assert!(pcap_dir().is_none());
        }
    }
}
