//! Pooled connection handles.
//!
//! A [`ConnectionHandle`] wraps one native connection together with the
//! bookkeeping the pool needs: lease state, timestamps and the identity of
//! the current lease holder.
//!
//! Lock order is pool state, then handle metadata, then the native
//! connection. Nothing takes the pool state lock while holding either of the
//! handle's own locks.

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::driver::{DriverError, NativeConnection};
use crate::statement::StatementSlot;

thread_local! {
    static THREAD_ID: ThreadId = std::thread::current().id();
}

/// Identity of the calling thread, if its thread-local storage is still
/// available.
pub(crate) fn current_thread_id() -> Option<ThreadId> {
    THREAD_ID.try_with(|id| *id).ok()
}

/// Lease state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleState {
    /// Available for checkout.
    Free,
    /// Checked out by exactly one caller.
    Leased,
    /// Held by the sweeper while it validates the connection.
    Examining,
    /// Removed from the pool; never leased again.
    Retired,
}

/// Identity of a lease holder.
#[derive(Debug, Clone)]
pub(crate) struct Owner {
    pub(crate) thread: Option<ThreadId>,
    pub(crate) thread_name: String,
    pub(crate) trace: String,
}

impl Owner {
    /// Capture the current thread, optionally with a call-site backtrace.
    pub(crate) fn current(capture_trace: bool) -> Self {
        let thread = std::thread::current();
        let thread_name = thread
            .name()
            .map_or_else(|| format!("{:?}", thread.id()), str::to_string);
        let trace = if capture_trace {
            Backtrace::force_capture().to_string()
        } else {
            thread_name.clone()
        };
        Self {
            thread: current_thread_id(),
            thread_name,
            trace,
        }
    }
}

#[derive(Debug)]
struct Lease {
    id: u64,
    owner: Owner,
    checkout_at: Instant,
    checkout_wall: DateTime<Utc>,
}

#[derive(Debug)]
struct HandleMeta {
    state: HandleState,
    lease_seq: u64,
    lease: Option<Lease>,
    last_used_at: Instant,
    audit: bool,
}

/// Snapshot of an outstanding lease.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    /// Connection name.
    pub connection: String,
    /// Name of the thread holding the lease.
    pub owner_thread: String,
    /// Wall-clock checkout time.
    pub checked_out_at: DateTime<Utc>,
    /// How long the lease has been held.
    pub held_for: Duration,
    /// Owner diagnostic trace: a backtrace when call-site tracking is on,
    /// otherwise the thread name.
    pub trace: String,
}

/// One native connection plus its pool-management metadata.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    id: u64,
    name: String,
    created_at: Instant,
    meta: Mutex<HandleMeta>,
    native: Mutex<Box<dyn NativeConnection>>,
    statements: Mutex<Vec<Arc<StatementSlot>>>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, native: Box<dyn NativeConnection>) -> Self {
        let now = Instant::now();
        Self {
            id,
            name: format!("Connection_{id}"),
            created_at: now,
            meta: Mutex::new(HandleMeta {
                state: HandleState::Free,
                lease_seq: 0,
                lease: None,
                last_used_at: now,
                audit: false,
            }),
            native: Mutex::new(native),
            statements: Mutex::new(Vec::new()),
        }
    }

    /// Create a handle that starts out leased to `owner`.
    pub(crate) fn new_leased(
        id: u64,
        native: Box<dyn NativeConnection>,
        owner: &Owner,
    ) -> (Self, u64) {
        let handle = Self::new(id, native);
        {
            let mut meta = handle.meta.lock();
            let now = Instant::now();
            meta.state = HandleState::Leased;
            meta.lease_seq = 1;
            meta.lease = Some(Lease {
                id: 1,
                owner: owner.clone(),
                checkout_at: now,
                checkout_wall: Utc::now(),
            });
        }
        (handle, 1)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn state(&self) -> HandleState {
        self.meta.lock().state
    }

    /// Transition Free to Leased, returning the new lease id.
    ///
    /// Returns `None` without side effects if the handle is not Free.
    pub(crate) fn lease(&self, owner: &Owner) -> Option<u64> {
        let mut meta = self.meta.lock();
        if meta.state != HandleState::Free {
            return None;
        }
        let now = Instant::now();
        meta.state = HandleState::Leased;
        meta.lease_seq += 1;
        meta.last_used_at = now;
        meta.lease = Some(Lease {
            id: meta.lease_seq,
            owner: owner.clone(),
            checkout_at: now,
            checkout_wall: Utc::now(),
        });
        tracing::trace!(connection = %self.name, lease = meta.lease_seq, "leased");
        Some(meta.lease_seq)
    }

    /// Transition Leased to Free if `lease_id` is the current lease.
    ///
    /// The native connection is left untouched.
    pub(crate) fn expire(&self, lease_id: u64) -> bool {
        let mut meta = self.meta.lock();
        let current = meta.lease.as_ref().map(|lease| lease.id);
        if meta.state != HandleState::Leased || current != Some(lease_id) {
            return false;
        }
        meta.state = HandleState::Free;
        meta.lease = None;
        meta.audit = false;
        meta.last_used_at = Instant::now();
        tracing::trace!(connection = %self.name, lease = lease_id, "lease expired");
        true
    }

    /// Transition Free to Examining so acquisition skips the handle while
    /// the sweeper validates it.
    pub(crate) fn begin_examine(&self) -> bool {
        let mut meta = self.meta.lock();
        if meta.state != HandleState::Free {
            return false;
        }
        meta.state = HandleState::Examining;
        true
    }

    /// Return an examined handle to Free.
    pub(crate) fn end_examine(&self) {
        let mut meta = self.meta.lock();
        if meta.state == HandleState::Examining {
            meta.state = HandleState::Free;
        }
    }

    /// Mark the handle as removed from the pool.
    pub(crate) fn retire(&self) {
        let mut meta = self.meta.lock();
        meta.state = HandleState::Retired;
        meta.lease = None;
    }

    /// Whether `lease_id` is the live lease of this handle.
    pub(crate) fn holds_lease(&self, lease_id: u64) -> bool {
        let meta = self.meta.lock();
        meta.state == HandleState::Leased
            && meta.lease.as_ref().is_some_and(|lease| lease.id == lease_id)
    }

    /// Whether the live lease `lease_id` belongs to thread `thread`.
    ///
    /// An unknown thread identity is treated as the owner.
    pub(crate) fn is_owned_by(&self, lease_id: u64, thread: Option<ThreadId>) -> bool {
        let meta = self.meta.lock();
        match meta.lease.as_ref() {
            Some(lease) if lease.id == lease_id => match (lease.owner.thread, thread) {
                (Some(owner), Some(caller)) => owner == caller,
                _ => true,
            },
            _ => false,
        }
    }

    /// Time since the handle was last leased or released.
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.meta.lock().last_used_at)
    }

    pub(crate) fn set_audit(&self, enabled: bool) {
        self.meta.lock().audit = enabled;
    }

    pub(crate) fn audit(&self) -> bool {
        self.meta.lock().audit
    }

    pub(crate) fn lease_info(&self) -> Option<LeaseInfo> {
        let meta = self.meta.lock();
        if meta.state != HandleState::Leased {
            return None;
        }
        meta.lease.as_ref().map(|lease| LeaseInfo {
            connection: self.name.clone(),
            owner_thread: lease.owner.thread_name.clone(),
            checked_out_at: lease.checkout_wall,
            held_for: lease.checkout_at.elapsed(),
            trace: lease.owner.trace.clone(),
        })
    }

    /// Run the validation query. Any failure counts as invalid; no query
    /// means always valid.
    pub(crate) fn validate(&self, query: Option<&str>) -> bool {
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            tracing::trace!(connection = %self.name, "no validation query, skipping check");
            return true;
        };
        let mut native = self.native.lock();
        if native.is_closed() {
            return false;
        }
        match native.execute(query) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(connection = %self.name, error = %e, "connection validation failed");
                false
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.native.lock().is_closed()
    }

    /// Run `f` with exclusive access to the native connection.
    pub(crate) fn with_native<R>(&self, f: impl FnOnce(&mut dyn NativeConnection) -> R) -> R {
        let mut native = self.native.lock();
        f(native.as_mut())
    }

    pub(crate) fn track_statement(&self, slot: Arc<StatementSlot>) {
        let mut statements = self.statements.lock();
        statements.retain(|s| !s.is_closed());
        statements.push(slot);
    }

    /// Close every statement opened through this handle.
    pub(crate) fn close_statements(&self) {
        let statements: Vec<_> = self.statements.lock().drain(..).collect();
        for statement in statements {
            if let Err(e) = statement.close() {
                tracing::trace!(connection = %self.name, error = %e, "failed to close statement");
            }
        }
    }

    /// Close all statements and then the native connection.
    pub(crate) fn hard_close(&self) -> Result<(), DriverError> {
        self.close_statements();
        let mut native = self.native.lock();
        if native.is_closed() {
            return Ok(());
        }
        native.close()
    }
}
