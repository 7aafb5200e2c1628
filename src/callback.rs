//! Per-address, per-event-kind registries of user callbacks, layered over
//! a [`Backend`].
//!
//! `CallbackManager` is the only thing in this crate that turns a raw
//! breakpoint hit into a user function call: it owns the registries,
//! translates first-registration/last-removal into backend breakpoint
//! set/remove, and dispatches each hit to its registered callbacks one at
//! a time on dedicated worker threads, so that a callback is never
//! mistaken for the event thread by `RspTarget`'s execution-command guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crate::backend::{Backend, EventCallback};
use crate::error::{Result, RspError};
use crate::event::EventKind;

/// Identifies one exact callback registration: which event kind and
/// address it was registered under, plus a monotonic id distinguishing
/// it from any other registration at the same `(kind, addr)` (duplicate
/// registrations of the same function are permitted and each gets its
/// own handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle {
    kind: EventKind,
    addr: u64,
    id: u64,
}

struct Registration {
    id: u64,
    cb: Arc<dyn Fn(u64) + Send + Sync>,
}

type Registry = HashMap<EventKind, HashMap<u64, Vec<Registration>>>;

/// Maps `(event_kind, address)` to an ordered list of user callbacks, and
/// arbitrates the corresponding backend breakpoints on their behalf.
pub struct CallbackManager {
    backend: Arc<dyn Backend>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl CallbackManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        CallbackManager {
            backend,
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn on_read(&self, addr: u64, cb: impl Fn(u64) + Send + Sync + 'static) -> Result<CallbackHandle> {
        self.register(EventKind::Read, addr, Arc::new(cb))
    }

    pub fn on_write(&self, addr: u64, cb: impl Fn(u64) + Send + Sync + 'static) -> Result<CallbackHandle> {
        self.register(EventKind::Write, addr, Arc::new(cb))
    }

    pub fn on_access(&self, addr: u64, cb: impl Fn(u64) + Send + Sync + 'static) -> Result<CallbackHandle> {
        self.register(EventKind::Access, addr, Arc::new(cb))
    }

    pub fn on_execute(&self, addr: u64, cb: impl Fn(u64) + Send + Sync + 'static) -> Result<CallbackHandle> {
        self.register(EventKind::Execute, addr, Arc::new(cb))
    }

    fn register(
        &self,
        kind: EventKind,
        addr: u64,
        cb: Arc<dyn Fn(u64) + Send + Sync>,
    ) -> Result<CallbackHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let was_empty = {
            let mut registry = self.registry.lock().unwrap();
            let slots = registry.entry(kind).or_default().entry(addr).or_default();
            let was_empty = slots.is_empty();
            slots.push(Registration { id, cb });
            was_empty
        };

        if was_empty {
            log::debug!("first {kind:?} callback at {addr:#x}, arming breakpoint");
            self.set_breakpoint(kind, addr)?;
        }

        Ok(CallbackHandle { kind, addr, id })
    }

    /// Remove exactly the registration identified by `handle`. Fails with
    /// [`RspError::NoSuchCallback`] if it is not currently registered.
    /// Backend breakpoint-remove failures are logged and swallowed, per
    /// this crate's "raise then swallow at the façade" policy: a stub
    /// frequently reports an error on an otherwise-successful remove.
    pub fn remove_callback(&self, handle: CallbackHandle) -> Result<()> {
        let now_empty = {
            let mut registry = self.registry.lock().unwrap();
            let by_addr = registry.entry(handle.kind).or_default();
            let slots = by_addr.get_mut(&handle.addr).ok_or(RspError::NoSuchCallback)?;
            let pos = slots
                .iter()
                .position(|r| r.id == handle.id)
                .ok_or(RspError::NoSuchCallback)?;
            slots.remove(pos);
            let now_empty = slots.is_empty();
            if now_empty {
                by_addr.remove(&handle.addr);
            }
            now_empty
        };

        if now_empty {
            log::debug!(
                "last {:?} callback at {:#x} removed, disarming breakpoint",
                handle.kind,
                handle.addr
            );
            if let Err(e) = self.del_breakpoint(handle.kind, handle.addr) {
                log::warn!("ignoring breakpoint-remove error at {:#x}: {e}", handle.addr);
            }
        }

        Ok(())
    }

    /// Invoked by a `Backend` when it observes event `kind` at `addr`.
    /// Runs every registered callback for `(kind, addr)` in registration
    /// order, each on its own joined worker thread, then re-arms every
    /// still-registered execute breakpoint (the stub clears them on
    /// every stop).
    pub fn dispatch(&self, kind: EventKind, addr: u64) {
        let callbacks: Vec<Arc<dyn Fn(u64) + Send + Sync>> = {
            let registry = self.registry.lock().unwrap();
            registry
                .get(&kind)
                .and_then(|by_addr| by_addr.get(&addr))
                .map(|slots| slots.iter().map(|r| Arc::clone(&r.cb)).collect())
                .unwrap_or_default()
        };

        for cb in callbacks {
            let addr = addr;
            let outcome = thread::Builder::new()
                .name("rsp-target-callback".into())
                .spawn(move || {
                    crate::rsp_target::mark_current_thread_as_callback_worker();
                    cb(addr);
                });
            match outcome {
                Ok(handle) => {
                    if handle.join().is_err() {
                        log::error!("callback at {addr:#x} panicked");
                    }
                }
                Err(e) => log::error!("failed to spawn callback worker: {e}"),
            }
        }

        self.rearm_execute_breakpoints();
    }

    fn rearm_execute_breakpoints(&self) {
        let addrs: Vec<u64> = {
            let registry = self.registry.lock().unwrap();
            registry
                .get(&EventKind::Execute)
                .map(|by_addr| by_addr.keys().copied().collect())
                .unwrap_or_default()
        };
        for addr in addrs {
            if let Err(e) = self.backend.set_exec_breakpoint(addr) {
                log::warn!("failed to re-arm execute breakpoint at {addr:#x}: {e}");
            }
        }
    }

    fn set_breakpoint(&self, kind: EventKind, addr: u64) -> Result<()> {
        match kind {
            EventKind::Read => self.backend.set_read_breakpoint(addr),
            EventKind::Write => self.backend.set_write_breakpoint(addr),
            EventKind::Access => self.backend.set_access_breakpoint(addr),
            EventKind::Execute => self.backend.set_exec_breakpoint(addr),
        }
    }

    fn del_breakpoint(&self, kind: EventKind, addr: u64) -> Result<()> {
        match kind {
            EventKind::Read => self.backend.del_read_breakpoint(addr),
            EventKind::Write => self.backend.del_write_breakpoint(addr),
            EventKind::Access => self.backend.del_access_breakpoint(addr),
            EventKind::Execute => self.backend.del_exec_breakpoint(addr),
        }
    }

    /// Wire this manager's dispatch into `backend`'s four event-callback
    /// slots. Called once by [`crate::target::Target`] at construction.
    ///
    /// The slots capture a [`Weak`] reference, not an owning `Arc`: `self`
    /// already holds a strong `Arc<dyn Backend>` pointing at the same
    /// `RspTarget` these closures are installed into, so an owning
    /// capture here would close a strong-reference cycle
    /// (`RspTarget` -> closure -> `CallbackManager` -> `Backend` ->
    /// `RspTarget`) that nothing would ever break (spec.md §9's
    /// "Reference cycles" note). `Target` is the sole owner of this
    /// `CallbackManager`; once it drops, dispatch becomes a no-op instead
    /// of keeping the manager alive.
    pub fn install(self: &Arc<Self>) {
        for kind in [
            EventKind::Read,
            EventKind::Write,
            EventKind::Access,
            EventKind::Execute,
        ] {
            let mgr = Arc::downgrade(self);
            let cb: EventCallback = Box::new(move |addr| {
                if let Some(mgr) = mgr.upgrade() {
                    mgr.dispatch(kind, addr);
                }
            });
            match kind {
                EventKind::Read => self.backend.set_on_read_callback(cb),
                EventKind::Write => self.backend.set_on_write_callback(cb),
                EventKind::Access => self.backend.set_on_access_callback(cb),
                EventKind::Execute => self.backend.set_on_execute_callback(cb),
            }
        }
    }
}
