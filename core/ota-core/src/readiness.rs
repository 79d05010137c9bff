//! One-shot readiness signal for the rendezvous listener.
//!
//! Resolves exactly once, either to the bound address or to the bind error.
//! Waiters that arrive before resolution block; waiters that arrive after it
//! return immediately with the same outcome.

use std::net::SocketAddr;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ListenerError;

#[derive(Debug, Clone)]
enum GateState {
    Pending,
    Ready(SocketAddr),
    Failed(ListenerError),
}

#[derive(Debug)]
pub struct ReadinessGate {
    state: Mutex<GateState>,
    resolved: Condvar,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending),
            resolved: Condvar::new(),
        }
    }

    /// Marks the listener bound. Returns false if the gate already resolved.
    pub fn open(&self, addr: SocketAddr) -> bool {
        self.resolve(GateState::Ready(addr))
    }

    /// Marks the listener permanently failed. Returns false if the gate
    /// already resolved.
    pub fn fail(&self, error: ListenerError) -> bool {
        self.resolve(GateState::Failed(error))
    }

    fn resolve(&self, outcome: GateState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, GateState::Pending) {
            return false;
        }
        *state = outcome;
        self.resolved.notify_all();
        true
    }

    /// Current outcome without blocking; `None` while pending.
    pub fn outcome(&self) -> Option<Result<SocketAddr, ListenerError>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        to_outcome(&state)
    }

    /// Blocks until the gate resolves.
    pub fn wait(&self) -> Result<SocketAddr, ListenerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = to_outcome(&state) {
                return outcome;
            }
            state = self
                .resolved
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the gate resolves or `timeout` elapses (`None`).
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<SocketAddr, ListenerError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = to_outcome(&state) {
                return Some(outcome);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .resolved
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

fn to_outcome(state: &GateState) -> Option<Result<SocketAddr, ListenerError>> {
    match state {
        GateState::Pending => None,
        GateState::Ready(addr) => Some(Ok(*addr)),
        GateState::Failed(err) => Some(Err(err.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;
    use std::thread;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().expect("addr")
    }

    fn bind_error() -> ListenerError {
        ListenerError::Bind {
            addr: addr(),
            kind: io::ErrorKind::AddrInUse,
            message: "address in use".to_string(),
        }
    }

    #[test]
    fn resolves_immediately_once_open() {
        let gate = ReadinessGate::new();
        assert!(gate.outcome().is_none());
        assert!(gate.open(addr()));
        assert_eq!(gate.wait(), Ok(addr()));
        assert_eq!(gate.wait(), Ok(addr()));
    }

    #[test]
    fn first_resolution_wins() {
        let gate = ReadinessGate::new();
        assert!(gate.fail(bind_error()));
        assert!(!gate.open(addr()));
        assert_eq!(gate.wait(), Err(bind_error()));
    }

    #[test]
    fn wait_timeout_while_pending() {
        let gate = ReadinessGate::new();
        assert!(gate.wait_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn releases_every_waiter_on_open() {
        let gate = Arc::new(ReadinessGate::new());
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        gate.open(addr());

        for waiter in waiters {
            assert_eq!(waiter.join().expect("waiter panicked"), Ok(addr()));
        }
    }

    #[test]
    fn releases_every_waiter_with_same_failure() {
        let gate = Arc::new(ReadinessGate::new());
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        gate.fail(bind_error());

        for waiter in waiters {
            assert_eq!(waiter.join().expect("waiter panicked"), Err(bind_error()));
        }
    }
}
