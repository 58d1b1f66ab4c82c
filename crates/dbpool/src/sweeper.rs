//! Background maintenance of idle connections.
//!
//! Each cycle the sweeper refreshes the alert thresholds from the pool
//! properties, validates every free connection, closes invalid ones and
//! connections idle beyond the idle timeout (while the pool is above its
//! minimum size), and finally tops the pool back up to its minimum.
//!
//! Free handles are moved to the `Examining` state for the duration of the
//! validation so acquisition skips them while the pool mutex is released.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::PoolError;
use crate::handle::ConnectionHandle;
use crate::pool::PoolInner;

/// Outcome of one sweeper cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Free connections validated this cycle.
    pub validated: usize,
    /// Connections removed because validation failed.
    pub invalid_removed: usize,
    /// Connections removed because they were idle too long.
    pub idle_removed: usize,
    /// Connections opened to restore the minimum size.
    pub created: usize,
}

#[derive(Debug, Default)]
struct SweeperControl {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the sweeper thread of one pool.
#[derive(Debug)]
pub(crate) struct Sweeper {
    control: Arc<SweeperControl>,
    thread: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start the sweeper thread. It exits once the pool is dropped or
    /// [`Sweeper::stop`] is called.
    pub(crate) fn spawn(
        pool: Weak<PoolInner>,
        pool_name: &str,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let control = Arc::new(SweeperControl::default());
        let thread_control = Arc::clone(&control);
        let thread = std::thread::Builder::new()
            .name(format!("{pool_name}-sweeper"))
            .spawn(move || run(&pool, &thread_control, interval))?;

        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    /// Ask the sweeper thread to exit at its next wake-up.
    pub(crate) fn stop(&self) {
        *self.control.stopped.lock() = true;
        self.control.wake.notify_all();
    }

    /// Wait for the sweeper thread to exit.
    pub(crate) fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("sweeper thread panicked");
            }
        }
    }
}

fn run(pool: &Weak<PoolInner>, control: &SweeperControl, interval: Duration) {
    loop {
        let deadline = Instant::now() + interval;
        {
            let mut stopped = control.stopped.lock();
            while !*stopped {
                if control.wake.wait_until(&mut stopped, deadline).timed_out() {
                    break;
                }
            }
            if *stopped {
                break;
            }
        }

        let Some(inner) = pool.upgrade() else {
            break;
        };
        sweep(&inner);
    }
    tracing::debug!("sweeper thread exiting");
}

/// Run one maintenance cycle on `inner`.
pub(crate) fn sweep(inner: &PoolInner) -> SweepReport {
    let pool_name = inner.config.name.as_str();
    let mut report = SweepReport::default();

    if let Some(alarm) = inner.properties.alarm() {
        match alarm.parse() {
            Ok(thresholds) => inner.state.lock().thresholds = thresholds,
            Err(e) => tracing::warn!(
                pool = pool_name,
                alarm = %alarm,
                error = %e,
                "ignoring malformed alarm configuration"
            ),
        }
    }

    let examined: Vec<Arc<ConnectionHandle>> = {
        let state = inner.state.lock();
        if state.closed {
            return report;
        }
        state
            .handles
            .iter()
            .filter(|handle| handle.begin_examine())
            .cloned()
            .collect()
    };

    let query = inner.config.validation_query.as_deref();
    let verdicts: Vec<bool> = examined
        .iter()
        .map(|handle| handle.validate(query))
        .collect();
    report.validated = examined.len();
    let invalid = verdicts.iter().filter(|valid| !**valid).count();

    let mut doomed = Vec::new();
    {
        let mut state = inner.state.lock();
        let now = Instant::now();
        for (handle, valid) in examined.iter().zip(&verdicts) {
            if !state.contains(handle) {
                continue;
            }
            if !*valid {
                let invalid = PoolError::ConnectionInvalid {
                    connection: handle.name().to_string(),
                };
                tracing::debug!(pool = pool_name, error = %invalid, "evicting connection");
                state.remove(handle);
                doomed.push((Arc::clone(handle), "failed validation"));
                report.invalid_removed += 1;
            } else if state.handles.len() > inner.config.min_size
                && handle.idle_for(now) > inner.config.idle_timeout
            {
                state.remove(handle);
                doomed.push((Arc::clone(handle), "idle timeout"));
                report.idle_removed += 1;
            } else {
                handle.end_examine();
            }
        }
    }
    inner.available.notify_all();

    for (handle, reason) in &doomed {
        inner.discard(handle, reason);
    }

    report.created = inner.fill_to_minimum();

    {
        let mut metrics = inner.metrics.lock();
        metrics.sweeps_performed += 1;
        metrics.validations_performed += report.validated as u64;
        metrics.validations_failed += invalid as u64;
    }

    tracing::debug!(
        pool = pool_name,
        validated = report.validated,
        invalid_removed = report.invalid_removed,
        idle_removed = report.idle_removed,
        created = report.created,
        "sweep complete"
    );
    report
}
