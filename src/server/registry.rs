//! Handle lifecycle and the stop barrier
//!
//! ```text
//! Absent ──start──► Starting ──built──► Running ──stop──► Stopping ──drained──► Stopped
//!    ▲                 │
//!    └──── rejected ───┘
//! ```
//!
//! Calls enter a running context through a `CallGuard`. `stop` first flips the
//! handle to Stopping (no new guards), then waits on a condvar until every
//! outstanding guard is dropped before handing the state to the stop hook.

use super::arena::{Arena, SlotKey};
use super::{Server, ServerHandle};
use crate::error::ProtocolError;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Observed state of a handle. `Absent` is never stored: it is what a
/// handle without a registry entry reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Absent,
    Starting,
    Running(SlotKey),
    Stopping,
    Stopped,
}

/// Stored lifecycle of a handle that has an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Starting,
    Running(SlotKey),
    Stopping,
    Stopped,
}

impl From<Lifecycle> for HandleState {
    fn from(lifecycle: Lifecycle) -> Self {
        match lifecycle {
            Lifecycle::Starting => HandleState::Starting,
            Lifecycle::Running(key) => HandleState::Running(key),
            Lifecycle::Stopping => HandleState::Stopping,
            Lifecycle::Stopped => HandleState::Stopped,
        }
    }
}

struct Gate {
    accepting: bool,
    in_flight: usize,
}

/// One running server: domain state plus call admission
pub struct ServerContext<S> {
    handle: ServerHandle,
    state: Mutex<Option<S>>,
    gate: Mutex<Gate>,
    drained: Condvar,
    started_at: DateTime<Utc>,
    calls: AtomicU64,
}

impl<S> ServerContext<S> {
    fn new(handle: ServerHandle, state: S) -> Self {
        Self {
            handle,
            state: Mutex::new(Some(state)),
            gate: Mutex::new(Gate {
                accepting: true,
                in_flight: 0,
            }),
            drained: Condvar::new(),
            started_at: Utc::now(),
            calls: AtomicU64::new(0),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Refuse new calls and block until in-flight calls finish
    fn close_and_drain(&self) {
        let mut gate = self.gate.lock();
        gate.accepting = false;
        while gate.in_flight > 0 {
            self.drained.wait(&mut gate);
        }
    }
}

/// Admission ticket for one call against a running context.
/// Dropping it releases the stop barrier.
pub struct CallGuard<S> {
    context: Arc<ServerContext<S>>,
}

impl<S: Server> CallGuard<S> {
    pub fn handle(&self) -> ServerHandle {
        self.context.handle
    }

    /// Run the domain callback against the server state
    pub fn call(&self, args: &S::CallArgs, request: &[u8]) -> Result<Vec<u8>, Vec<u8>> {
        self.context.calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.context.state.lock();
        match state.as_mut() {
            Some(server) => server.call(args, request),
            // Unreachable while the guard is held: stop takes the state only
            // after every guard is dropped
            None => Err(Vec::new()),
        }
    }
}

impl<S> Drop for CallGuard<S> {
    fn drop(&mut self) {
        let mut gate = self.context.gate.lock();
        gate.in_flight -= 1;
        if gate.in_flight == 0 {
            self.context.drained.notify_all();
        }
    }
}

struct Inner<S> {
    handles: HashMap<ServerHandle, Lifecycle>,
    arena: Arena<Arc<ServerContext<S>>>,
}

pub struct ServerRegistry<S> {
    inner: Mutex<Inner<S>>,
}

impl<S: Server> Default for ServerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Server> ServerRegistry<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                handles: HashMap::new(),
                arena: Arena::new(),
            }),
        }
    }

    /// Build a server from `args` under `handle`
    pub fn start(&self, handle: ServerHandle, args: S::StartArgs) -> Result<(), ProtocolError> {
        {
            let mut inner = self.inner.lock();
            match inner.handles.get(&handle) {
                Some(Lifecycle::Stopped) => return Err(ProtocolError::HandleRetired(handle)),
                Some(_) => return Err(ProtocolError::AlreadyRunning(handle)),
                None => {
                    inner.handles.insert(handle, Lifecycle::Starting);
                }
            }
        }

        // Built outside the registry lock; other handles stay usable meanwhile
        let built = match catch_unwind(AssertUnwindSafe(|| S::start(args))) {
            Ok(result) => result.map_err(|e| e.0),
            Err(_) => Err("domain start panicked".to_string()),
        };

        let mut inner = self.inner.lock();
        match built {
            Ok(server) => {
                let context = Arc::new(ServerContext::new(handle, server));
                let key = inner.arena.insert(context);
                inner.handles.insert(handle, Lifecycle::Running(key));
                info!("Server {} started (slot {})", handle, key.index);
                Ok(())
            }
            Err(reason) => {
                inner.handles.remove(&handle);
                warn!("Server {} start rejected: {}", handle, reason);
                Err(ProtocolError::StartRejected(reason))
            }
        }
    }

    /// Admit one call against `handle`
    pub fn enter(&self, handle: ServerHandle) -> Result<CallGuard<S>, ProtocolError> {
        let inner = self.inner.lock();
        let context = Self::running(&inner, handle)?;
        let mut gate = context.gate.lock();
        if !gate.accepting {
            return Err(ProtocolError::NotRunning(handle));
        }
        gate.in_flight += 1;
        drop(gate);
        Ok(CallGuard { context })
    }

    /// Stop `handle`: refuse new calls, drain in-flight ones, run the stop
    /// hook and retire the handle. Must not be called from inside a call
    /// against the same handle.
    pub fn stop(&self, handle: ServerHandle, args: S::StopArgs) -> Result<(), ProtocolError> {
        let (key, context) = {
            let mut inner = self.inner.lock();
            let key = match inner.handles.get(&handle) {
                Some(Lifecycle::Running(key)) => *key,
                Some(Lifecycle::Starting) | Some(Lifecycle::Stopping) => {
                    return Err(ProtocolError::NotRunning(handle))
                }
                Some(Lifecycle::Stopped) | None => return Err(ProtocolError::NotFound(handle)),
            };
            let context = Self::running(&inner, handle)?;
            inner.handles.insert(handle, Lifecycle::Stopping);
            (key, context)
        };

        context.close_and_drain();

        let state = context.state.lock().take();
        if let Some(server) = state {
            if catch_unwind(AssertUnwindSafe(|| server.stop(args))).is_err() {
                warn!("Server {} stop hook panicked", handle);
            }
        }

        let mut inner = self.inner.lock();
        inner.arena.remove(key);
        inner.handles.insert(handle, Lifecycle::Stopped);
        info!(
            "Server {} stopped after {} calls",
            handle,
            context.calls()
        );
        Ok(())
    }

    pub fn state(&self, handle: ServerHandle) -> HandleState {
        self.inner
            .lock()
            .handles
            .get(&handle)
            .map_or(HandleState::Absent, |lifecycle| (*lifecycle).into())
    }

    /// Handles currently in the Running state, sorted
    pub fn running_handles(&self) -> Vec<ServerHandle> {
        let inner = self.inner.lock();
        let mut handles: Vec<ServerHandle> = inner
            .handles
            .iter()
            .filter(|(_, lifecycle)| matches!(lifecycle, Lifecycle::Running(_)))
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().arena.len()
    }

    fn running(
        inner: &Inner<S>,
        handle: ServerHandle,
    ) -> Result<Arc<ServerContext<S>>, ProtocolError> {
        match inner.handles.get(&handle) {
            Some(Lifecycle::Running(key)) => inner
                .arena
                .get(*key)
                .cloned()
                .ok_or(ProtocolError::NotFound(handle)),
            Some(Lifecycle::Starting) | Some(Lifecycle::Stopping) => {
                Err(ProtocolError::NotRunning(handle))
            }
            Some(Lifecycle::Stopped) | None => Err(ProtocolError::NotFound(handle)),
        }
    }
}
