//! Surprise flags and the request watchdog
//!
//! Other threads never touch interpreter state directly. They set bits in
//! a shared `SurpriseFlags` word and the interpreter polls it at backward
//! branches and function entry, turning a set bit into an ordinary fault.
//!
//! Reference: HHVM `runtime/base/execution_context.h` (RequestInjectionData)

use crate::vm::engine::{VM, VmError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub const TIMED_OUT: u32 = 1 << 0;
pub const SIGNALED: u32 = 1 << 1;

#[derive(Debug, Clone, Default)]
pub struct SurpriseFlags {
    bits: Arc<AtomicU32>,
}

impl SurpriseFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle another thread can use to interrupt this request
    pub fn handle(&self) -> SurpriseHandle {
        SurpriseHandle {
            bits: self.bits.clone(),
        }
    }

    #[inline]
    pub fn pending(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Clear and return the bits in `mask`
    pub fn take(&self, mask: u32) -> u32 {
        self.bits.fetch_and(!mask, Ordering::AcqRel) & mask
    }
}

#[derive(Debug, Clone)]
pub struct SurpriseHandle {
    bits: Arc<AtomicU32>,
}

impl SurpriseHandle {
    pub fn set(&self, flag: u32) {
        self.bits.fetch_or(flag, Ordering::AcqRel);
    }

    /// Ask the request to stop at its next poll point
    pub fn interrupt(&self) {
        self.set(SIGNALED);
    }
}

/// Timer thread that marks a request as timed out
pub struct Watchdog {
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(handle: SurpriseHandle, limit: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("hhvm-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(limit) {
                    debug!(limit_ms = limit.as_millis() as u64, "request timed out");
                    handle.set(TIMED_OUT);
                }
            });
        match thread {
            Ok(thread) => Self {
                cancel: Some(tx),
                thread: Some(thread),
            },
            Err(e) => {
                warn!(error = %e, "could not start watchdog thread");
                Self {
                    cancel: None,
                    thread: None,
                }
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl VM {
    pub fn surprise_handle(&self) -> SurpriseHandle {
        self.surprise.handle()
    }

    /// Poll point; a pending flag becomes a fault
    #[inline]
    pub(crate) fn check_surprise(&mut self) -> Result<(), VmError> {
        if self.surprise.pending() == 0 {
            return Ok(());
        }
        if self.surprise.take(TIMED_OUT) != 0 {
            return Err(VmError::Timeout);
        }
        if self.surprise.take(SIGNALED) != 0 {
            return Err(VmError::fatal("Execution interrupted"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn take_clears_only_requested_bits() {
        let flags = SurpriseFlags::new();
        let handle = flags.handle();
        handle.set(TIMED_OUT);
        handle.interrupt();
        assert_eq!(flags.take(TIMED_OUT), TIMED_OUT);
        assert_eq!(flags.pending(), SIGNALED);
        assert_eq!(flags.take(TIMED_OUT), 0);
    }

    #[test]
    fn watchdog_fires_after_limit() {
        let flags = SurpriseFlags::new();
        let _dog = Watchdog::spawn(flags.handle(), Duration::from_millis(10));
        let start = Instant::now();
        while flags.pending() & TIMED_OUT == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "watchdog never fired");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn dropped_watchdog_never_fires() {
        let flags = SurpriseFlags::new();
        drop(Watchdog::spawn(flags.handle(), Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(flags.pending(), 0);
    }
}
