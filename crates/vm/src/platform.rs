//! Platform services the core needs from its host.
//!
//! Production code uses [`SystemPlatform`]; tests use [`MockPlatform`] with
//! a manually advanced clock so timed waits are deterministic.

use std::cell::Cell as StdCell;
use std::time::{SystemTime, UNIX_EPOCH};

/// The services the VM core requires from the platform shim.
pub trait Platform {
    /// Milliseconds since the Unix epoch.
    fn system_time_ms(&self) -> u64;

    /// Writes a line to the console, if one is attached.
    fn console_line(&self, line: &str);
}

/// The real platform: wall clock and standard error.
#[derive(Debug, Default)]
pub struct SystemPlatform;

impl Platform for SystemPlatform {
    fn system_time_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn console_line(&self, line: &str) {
        eprintln!("{line}");
    }
}

/// A deterministic platform for tests: the clock only moves when told to.
#[derive(Debug, Default)]
pub struct MockPlatform {
    now_ms: StdCell<u64>,
}

impl MockPlatform {
    /// A mock platform starting at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the mock clock.
    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.set(self.now_ms.get() + delta);
    }

    /// Sets the mock clock.
    pub fn set_ms(&self, now: u64) {
        self.now_ms.set(now);
    }
}

impl Platform for MockPlatform {
    fn system_time_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn console_line(&self, line: &str) {
        log::debug!("console: {line}");
    }
}

/// Shared handles delegate, so a test can keep a clock handle while the VM
/// owns the platform.
impl<P: Platform + ?Sized> Platform for std::rc::Rc<P> {
    fn system_time_ms(&self) -> u64 {
        (**self).system_time_ms()
    }

    fn console_line(&self, line: &str) {
        (**self).console_line(line)
    }
}
