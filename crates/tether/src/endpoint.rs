//! Lifecycle shared by client and server endpoints.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tether_core::{RpcError, TransportError};
use tether_primitives::{AccessTimeout, Event};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    Created = 0,
    Started = 1,
    /// A worker hit a fatal error; the endpoint serves nothing until disposed.
    Failed = 2,
    Disposing = 3,
    Disposed = 4,
}

impl EndpointState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EndpointState::Created,
            1 => EndpointState::Started,
            2 => EndpointState::Failed,
            3 => EndpointState::Disposing,
            _ => EndpointState::Disposed,
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Created => write!(f, "created"),
            EndpointState::Started => write!(f, "started"),
            EndpointState::Failed => write!(f, "failed"),
            EndpointState::Disposing => write!(f, "disposing"),
            EndpointState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Passed to crash hooks when an endpoint fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCrashed {
    pub address: String,
    pub reason: String,
}

pub type CrashHook = Box<dyn Fn(&EndpointCrashed) + Send + Sync>;

/// Errors that stop a worker loop.
#[derive(Debug)]
pub(crate) enum Fatal {
    Transport(TransportError),
    Lock(AccessTimeout),
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::Transport(err) => write!(f, "transport failed: {err}"),
            Fatal::Lock(err) => write!(f, "{err}"),
        }
    }
}

impl From<TransportError> for Fatal {
    fn from(err: TransportError) -> Self {
        Fatal::Transport(err)
    }
}

impl From<AccessTimeout> for Fatal {
    fn from(err: AccessTimeout) -> Self {
        Fatal::Lock(err)
    }
}

pub(crate) struct Lifecycle {
    address: String,
    state: AtomicU8,
    /// Set once the worker reports started or failed.
    settled: Event,
    hooks: Mutex<Vec<CrashHook>>,
}

impl Lifecycle {
    pub fn new(address: &str) -> Self {
        Lifecycle {
            address: address.to_owned(),
            state: AtomicU8::new(EndpointState::Created as u8),
            settled: Event::manual(),
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_started(&self) -> bool {
        self.state() == EndpointState::Started
    }

    pub fn on_crashed(&self, hook: CrashHook) {
        self.hooks.lock().push(hook);
    }

    fn transition(&self, from: EndpointState, to: EndpointState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            tracing::debug!(endpoint = %self.address, %from, %to, "endpoint state changed");
        }
        moved
    }

    pub fn mark_started(&self) {
        if self.transition(EndpointState::Created, EndpointState::Started) {
            tracing::info!(endpoint = %self.address, "endpoint started");
        }
        self.settled.set();
    }

    /// Record a fatal error and run the crash hooks.
    ///
    /// Ignored once the endpoint is failed or being disposed.
    pub fn fail(&self, reason: impl fmt::Display) {
        let failed = self.transition(EndpointState::Created, EndpointState::Failed)
            || self.transition(EndpointState::Started, EndpointState::Failed);
        if !failed {
            return;
        }

        let event = EndpointCrashed {
            address: self.address.clone(),
            reason: reason.to_string(),
        };
        tracing::error!(endpoint = %self.address, reason = %event.reason, "endpoint crashed");
        self.settled.set();

        for hook in self.hooks.lock().iter() {
            hook(&event);
        }
    }

    /// Move to disposing. Returns `false` if disposal already began.
    pub fn begin_dispose(&self) -> bool {
        [
            EndpointState::Created,
            EndpointState::Started,
            EndpointState::Failed,
        ]
        .into_iter()
        .any(|from| self.transition(from, EndpointState::Disposing))
    }

    pub fn finish_dispose(&self) {
        if self.transition(EndpointState::Disposing, EndpointState::Disposed) {
            tracing::info!(endpoint = %self.address, "endpoint disposed");
        }
        self.settled.set();
    }

    /// Block until the worker reports in.
    pub fn wait_started(&self, timeout: Duration) -> Result<(), RpcError> {
        if !self.settled.wait(timeout) {
            return Err(RpcError::unavailable(format!(
                "Endpoint {} did not start within {timeout:?}.",
                self.address
            )));
        }
        self.ensure_started()
    }

    pub fn ensure_started(&self) -> Result<(), RpcError> {
        match self.state() {
            EndpointState::Started => Ok(()),
            state => Err(RpcError::unavailable(format!(
                "Endpoint {} is {state}.",
                self.address
            ))),
        }
    }
}

/// A named worker thread whose join is bounded.
pub(crate) struct Worker {
    name: String,
    handle: JoinHandle<()>,
    done: Arc<Event>,
}

impl Worker {
    pub fn spawn(name: String, run: impl FnOnce() + Send + 'static) -> Result<Self, RpcError> {
        struct Done(Arc<Event>);

        impl Drop for Done {
            fn drop(&mut self) {
                self.0.set();
            }
        }

        let done = Arc::new(Event::manual());
        let guard = Done(done.clone());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _done = guard;
                run();
            })
            .map_err(|err| RpcError::internal(format!("failed to spawn {name}: {err}")))?;

        Ok(Worker { name, handle, done })
    }

    /// Wait up to `timeout` for the worker to finish, then detach it.
    pub fn join(self, timeout: Duration) -> bool {
        if !self.done.wait(timeout) {
            tracing::error!(worker = %self.name, ?timeout, "worker did not stop in time, detaching");
            return false;
        }
        if self.handle.join().is_err() {
            tracing::error!(worker = %self.name, "worker panicked");
        }
        true
    }
}
