//! Top-level run sequencing.
//!
//! Stages run strictly in order: open the gateway, bring the rendezvous
//! listener up, hand the gateway its OTA command, then supervise sessions and
//! print progress until the process is stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

use crate::config::OtaConfig;
use crate::error::{HandshakeError, OtaError, SerialError};
use crate::gateway::{GatewayBootstrap, GatewayLink, HandshakeState};
use crate::listener::RendezvousListener;
use crate::pusher::FirmwarePusher;
use crate::registry::SessionRegistry;
use crate::token::{HailVerifier, RunToken};

pub const REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Ends the steady-state loop when raised. The CLI never raises it; the
/// process is stopped externally once the operator sees every session done.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Orchestrator {
    config: OtaConfig,
    token: RunToken,
    registry: SessionRegistry,
    report_interval: Duration,
    shutdown: ShutdownFlag,
}

impl Orchestrator {
    pub fn new(config: OtaConfig, token: RunToken, pusher: Arc<dyn FirmwarePusher>) -> Self {
        let registry = SessionRegistry::new(pusher, config.upload_plan());
        Self {
            config,
            token,
            registry,
            report_interval: REPORT_INTERVAL,
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Runs every stage; returns only on a fatal error or on shutdown.
    pub fn run<L, F>(self, connect_gateway: F) -> Result<(), OtaError>
    where
        L: GatewayLink + 'static,
        F: FnOnce() -> Result<L, SerialError>,
    {
        let link = connect_gateway()?;

        let mut listener = RendezvousListener::start(
            self.config.listen_addr(),
            HailVerifier::new(&self.token),
            self.registry.clone(),
        );
        if let Err(err) = listener.wait_ready() {
            error!(error = %err, "Error starting rendezvous listener");
            return Err(err.into());
        }

        let command = self.config.start_command(&self.token);
        let bootstrap = GatewayBootstrap::start(link, &command);
        if bootstrap.state() == HandshakeState::Error {
            return bootstrap.into_result().map_err(OtaError::from);
        }

        let (handshake_tx, handshake_rx) = mpsc::channel();
        thread::Builder::new()
            .name("gateway-handshake".to_string())
            .spawn(move || {
                let _ = handshake_tx.send(bootstrap.run());
            })
            .map_err(|source| OtaError::Thread {
                name: "gateway-handshake",
                source,
            })?;

        let result = self.supervise(handshake_rx);
        listener.stop();
        result
    }

    fn supervise(
        &self,
        handshake: mpsc::Receiver<Result<(), HandshakeError>>,
    ) -> Result<(), OtaError> {
        let mut handshake = Some(handshake);
        while !self.shutdown.is_triggered() {
            match handshake.as_ref() {
                Some(pending) => match pending.recv_timeout(self.report_interval) {
                    Ok(Ok(())) => handshake = None,
                    Ok(Err(err)) => {
                        error!(error = %err, "Gateway handshake failed");
                        return Err(err.into());
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(HandshakeError::ConnectionLost.into());
                    }
                },
                None => thread::sleep(self.report_interval),
            }

            if let Some(summary) = self.registry.report_summary() {
                info!(sessions = self.registry.len(), "{}", summary);
            }
        }
        info!("Orchestrator shutting down");
        Ok(())
    }
}
