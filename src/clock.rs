// SPDX-License-Identifier: Apache-2.0

//! Host clocks published to enclaves
//!
//! Trusted code cannot read the host clocks itself. A background ticker
//! keeps two shared counters current instead.

use crate::error::Result;
use crate::resources::{SharedName, SharedResources};

use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, trace};

/// Resource name of the monotonic clock, in nanoseconds.
pub const MONOTONIC: &str = "clock_monotonic";

/// Resource name of the realtime clock, in nanoseconds since the epoch.
pub const REALTIME: &str = "clock_realtime";

/// The interval between two ticks.
pub const PERIOD: Duration = Duration::from_micros(70);

fn read(clock: libc::clockid_t) -> io::Result<i64> {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();

    if unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let ts = unsafe { ts.assume_init() };
    Ok(ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64)
}

/// The published clock values.
///
/// Clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct Clock {
    monotonic: Arc<AtomicI64>,
    realtime: Arc<AtomicI64>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn monotonic(&self) -> i64 {
        self.monotonic.load(Ordering::Acquire)
    }

    pub fn realtime(&self) -> i64 {
        self.realtime.load(Ordering::Acquire)
    }

    /// Read both host clocks and publish them.
    ///
    /// A clock that cannot be read keeps its previous value.
    pub fn tick(&self) {
        for (id, name, value) in [
            (libc::CLOCK_MONOTONIC, MONOTONIC, &self.monotonic),
            (libc::CLOCK_REALTIME, REALTIME, &self.realtime),
        ] {
            match read(id) {
                Ok(nanos) => value.store(nanos, Ordering::Release),
                Err(e) => error!(clock = name, "failed to read clock: {}", e),
            }
        }
    }

    /// Publish the counters under [`MONOTONIC`] and [`REALTIME`].
    pub fn register(&self, resources: &SharedResources) -> Result<()> {
        resources.register_unmanaged(SharedName::address(MONOTONIC), self.monotonic.clone())?;
        resources.register_unmanaged(SharedName::address(REALTIME), self.realtime.clone())?;
        Ok(())
    }

    /// Tick once, then keep ticking every [`PERIOD`] on a new thread.
    ///
    /// The first tick completes before this returns, so readers never see
    /// an unset clock.
    pub fn spawn(&self) -> io::Result<Ticker> {
        self.tick();

        let stop = Arc::new(AtomicBool::new(false));
        let clock = self.clone();
        let stopped = stop.clone();

        let thread = thread::Builder::new()
            .name("enclave-clock".into())
            .spawn(move || {
                trace!("clock ticker started");
                let mut deadline = Instant::now();

                while !stopped.load(Ordering::Acquire) {
                    clock.tick();

                    deadline += PERIOD;
                    let now = Instant::now();
                    match deadline.checked_duration_since(now) {
                        Some(wait) => thread::sleep(wait),
                        None => deadline = now,
                    }
                }

                trace!("clock ticker stopped");
            })?;

        Ok(Ticker {
            stop,
            thread: Some(thread),
        })
    }
}

/// Stops and joins the ticker thread when dropped.
#[derive(Debug)]
pub struct Ticker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("clock ticker panicked");
            }
        }
    }
}
