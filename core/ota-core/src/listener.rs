//! UDP rendezvous listener.
//!
//! Receives tracker hails, admits the sender when the payload matches the
//! run's verification string and silently drops everything else. Nothing is
//! ever sent back; the tracker learns it was accepted when the OTA session
//! connects to it.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::ListenerError;
use crate::readiness::ReadinessGate;
use crate::token::HailVerifier;

const RECV_POLL_INTERVAL: Duration = Duration::from_millis(250);
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);
/// Largest UDP payload, so a datagram is never truncated.
const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

/// Receives the addresses of authenticated hails.
pub trait HailSink: Send + Sync + 'static {
    fn admit(&self, address: IpAddr);
}

impl<F> HailSink for F
where
    F: Fn(IpAddr) + Send + Sync + 'static,
{
    fn admit(&self, address: IpAddr) {
        self(address)
    }
}

pub struct RendezvousListener {
    bind_addr: SocketAddr,
    gate: Arc<ReadinessGate>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RendezvousListener {
    /// Spawns the listener thread. Binding happens on that thread; use
    /// [`RendezvousListener::wait_ready`] to learn the outcome.
    pub fn start<S: HailSink>(bind_addr: SocketAddr, verifier: HailVerifier, sink: S) -> Self {
        let gate = Arc::new(ReadinessGate::new());
        let stop = Arc::new(AtomicBool::new(false));

        let thread_gate = Arc::clone(&gate);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            serve(bind_addr, &verifier, &sink, &thread_gate, &thread_stop);
        });

        Self {
            bind_addr,
            gate,
            stop,
            handle: Some(handle),
        }
    }

    /// Blocks until the socket is bound or binding failed.
    pub fn wait_ready(&self) -> Result<SocketAddr, ListenerError> {
        self.gate.wait()
    }

    /// Shared handle to the readiness gate for additional waiters.
    pub fn readiness(&self) -> Arc<ReadinessGate> {
        Arc::clone(&self.gate)
    }

    /// Bound address once ready (differs from the configured one for port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.gate.outcome().and_then(Result::ok)
    }

    /// Stops receiving and joins the listener thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.gate.fail(ListenerError::Stopped(self.bind_addr));
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(addr = %self.bind_addr, "Rendezvous listener thread panicked");
            }
        }
    }
}

impl Drop for RendezvousListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve<S: HailSink>(
    bind_addr: SocketAddr,
    verifier: &HailVerifier,
    sink: &S,
    gate: &ReadinessGate,
    stop: &AtomicBool,
) {
    let socket = match bind(bind_addr) {
        Ok(socket) => socket,
        Err(err) => {
            error!(addr = %bind_addr, error = %err, "UDP server error");
            gate.fail(ListenerError::Bind {
                addr: bind_addr,
                kind: err.kind(),
                message: err.to_string(),
            });
            return;
        }
    };

    let local_addr = socket.local_addr().unwrap_or(bind_addr);
    if !gate.open(local_addr) {
        // Stopped while binding.
        return;
    }
    info!(addr = %local_addr, "UDP server listening");

    let mut buffer = vec![0u8; MAX_DATAGRAM_BYTES];
    while !stop.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buffer) {
            Ok((len, from)) => handle_datagram(&buffer[..len], from, verifier, sink),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionReset
                ) => {}
            Err(err) => {
                // Per-datagram failures (oversize, ICMP errors) are noise.
                debug!(addr = %local_addr, error = %err, "Ignoring UDP receive error");
                thread::sleep(RECV_ERROR_BACKOFF);
            }
        }
    }
    debug!(addr = %local_addr, "UDP server stopped");
}

fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
    Ok(socket)
}

fn handle_datagram<S: HailSink>(
    payload: &[u8],
    from: SocketAddr,
    verifier: &HailVerifier,
    sink: &S,
) {
    debug!(from = %from, bytes = payload.len(), "Received datagram");
    if verifier.verify(payload) {
        info!(address = %from.ip(), "Tracker requested OTA update");
        sink.admit(from.ip());
    } else {
        debug!(from = %from, "Ignoring datagram without a valid hail");
    }
}
