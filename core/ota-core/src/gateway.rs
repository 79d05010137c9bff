//! Gateway bootstrap handshake.
//!
//! Writes the `startotaupdate` command to the gateway and then reads lines
//! until the gateway acknowledges, refuses, or disconnects. Gateways print
//! unsolicited diagnostics, so only the two markers end the wait.
//!
//! ```text
//! AwaitingAcknowledgement --"OTAUPDATESTARTED"--> Started (link closed)
//! AwaitingAcknowledgement --"Unknown command"---> Error   (run aborts)
//! AwaitingAcknowledgement --link closed---------> Error   (run aborts)
//! AwaitingAcknowledgement --any other line------> AwaitingAcknowledgement
//! ```

use std::io;
use tracing::{debug, error, info};
use tracker_ota_protocol::{GatewayReply, StartOtaCommand};

use crate::error::HandshakeError;

/// Line-oriented connection to the gateway.
pub trait GatewayLink: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Next complete line without its terminator; `Ok(None)` once closed.
    fn read_line(&mut self) -> io::Result<Option<String>>;

    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingAcknowledgement,
    Started,
    Error,
}

pub struct GatewayBootstrap<L: GatewayLink> {
    link: Option<L>,
    state: HandshakeState,
    failure: Option<HandshakeError>,
}

impl<L: GatewayLink> GatewayBootstrap<L> {
    /// Sends the OTA command immediately. A failed write is a terminal
    /// [`HandshakeState::Error`], not a silent stall.
    pub fn start(mut link: L, command: &StartOtaCommand) -> Self {
        info!(
            host = %command.host,
            port = command.port,
            ssid = %command.ssid,
            "Putting gateway into OTA mode"
        );

        let mut bootstrap = Self {
            link: None,
            state: HandshakeState::AwaitingAcknowledgement,
            failure: None,
        };
        match link.write_line(&command.to_line()) {
            Ok(()) => bootstrap.link = Some(link),
            Err(err) => {
                error!(error = %err, "Error writing to gateway port");
                link.close();
                bootstrap.fail(HandshakeError::CommandWrite(err));
            }
        }
        bootstrap
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Advances the state machine with one line of gateway output.
    pub fn on_line(&mut self, line: &str) -> HandshakeState {
        if self.state != HandshakeState::AwaitingAcknowledgement {
            return self.state;
        }

        match GatewayReply::classify(line) {
            GatewayReply::Started => {
                info!("Gateway entered OTA mode");
                self.state = HandshakeState::Started;
                self.close_link();
            }
            GatewayReply::UnknownCommand => {
                self.fail(HandshakeError::UnsupportedCommand(line.trim().to_string()));
                self.close_link();
            }
            GatewayReply::Diagnostic if line.trim().is_empty() => {}
            GatewayReply::Diagnostic => {
                debug!(line = %line.trim_end(), "Gateway output");
            }
        }
        self.state
    }

    /// The link closed. Fatal unless the gateway already acknowledged.
    pub fn on_closed(&mut self) -> HandshakeState {
        self.link = None;
        if self.state == HandshakeState::AwaitingAcknowledgement {
            self.fail(HandshakeError::ConnectionLost);
        }
        self.state
    }

    /// Reads from the link until the handshake reaches a terminal state.
    pub fn run(mut self) -> Result<(), HandshakeError> {
        while self.state == HandshakeState::AwaitingAcknowledgement {
            let Some(link) = self.link.as_mut() else {
                self.on_closed();
                break;
            };
            match link.read_line() {
                Ok(Some(line)) => {
                    self.on_line(&line);
                }
                Ok(None) => {
                    self.on_closed();
                }
                Err(err) => {
                    self.close_link();
                    self.fail(HandshakeError::Read(err));
                }
            }
        }
        self.into_result()
    }

    /// Terminal outcome; still-pending handshakes count as a lost link.
    pub fn into_result(mut self) -> Result<(), HandshakeError> {
        match self.state {
            HandshakeState::Started => Ok(()),
            _ => Err(self.failure.take().unwrap_or(HandshakeError::ConnectionLost)),
        }
    }

    fn fail(&mut self, err: HandshakeError) {
        self.state = HandshakeState::Error;
        self.failure = Some(err);
    }

    fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScriptedLink {
        replies: VecDeque<io::Result<Option<String>>>,
        written: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
        refuse_writes: bool,
    }

    impl ScriptedLink {
        fn replying(lines: &[&str]) -> Self {
            Self {
                replies: lines.iter().map(|l| Ok(Some(l.to_string()))).collect(),
                ..Self::default()
            }
        }
    }

    impl GatewayLink for ScriptedLink {
        fn write_line(&mut self, line: &str) -> io::Result<()> {
            if self.refuse_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port gone"));
            }
            self.written.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn read_line(&mut self) -> io::Result<Option<String>> {
            self.replies.pop_front().unwrap_or(Ok(None))
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn command() -> StartOtaCommand {
        StartOtaCommand {
            token: [0xab; 16],
            port: 9000,
            host: Ipv4Addr::new(192, 168, 1, 2),
            ssid: "wifi-ssid".to_string(),
            password: "wifi-password".to_string(),
        }
    }

    #[test]
    fn writes_command_on_start() {
        let link = ScriptedLink::default();
        let written = Arc::clone(&link.written);
        let bootstrap = GatewayBootstrap::start(link, &command());

        assert_eq!(bootstrap.state(), HandshakeState::AwaitingAcknowledgement);
        assert_eq!(*written.lock().unwrap(), vec![command().to_line()]);
    }

    #[test]
    fn tolerates_diagnostics_before_ack() {
        let link = ScriptedLink::replying(&[
            "[ESPNOW] Tracker 2 battery 3.9V",
            "",
            "OTAUPDATESTARTED",
        ]);
        let closed = Arc::clone(&link.closed);

        let result = GatewayBootstrap::start(link, &command()).run();

        assert!(result.is_ok());
        assert!(closed.load(Ordering::SeqCst), "link closed after ack");
    }

    #[test]
    fn unknown_command_is_fatal() {
        let mut bootstrap = GatewayBootstrap::start(ScriptedLink::default(), &command());
        let state = bootstrap.on_line("[CMD] Unknown command: startotaupdate");

        assert_eq!(state, HandshakeState::Error);
        assert!(matches!(
            bootstrap.into_result(),
            Err(HandshakeError::UnsupportedCommand(_))
        ));
    }

    #[test]
    fn closing_before_ack_is_fatal() {
        let link = ScriptedLink::replying(&["booting"]);
        let result = GatewayBootstrap::start(link, &command()).run();
        assert!(matches!(result, Err(HandshakeError::ConnectionLost)));
    }

    #[test]
    fn closing_after_ack_is_harmless() {
        let mut bootstrap = GatewayBootstrap::start(ScriptedLink::default(), &command());
        bootstrap.on_line("OTAUPDATESTARTED");
        assert_eq!(bootstrap.on_closed(), HandshakeState::Started);
        assert!(bootstrap.into_result().is_ok());
    }

    #[test]
    fn lines_after_terminal_state_are_ignored() {
        let mut bootstrap = GatewayBootstrap::start(ScriptedLink::default(), &command());
        bootstrap.on_line("OTAUPDATESTARTED");
        assert_eq!(
            bootstrap.on_line("[CMD] Unknown command"),
            HandshakeState::Started
        );
    }

    #[test]
    fn write_failure_is_observable() {
        let link = ScriptedLink {
            refuse_writes: true,
            ..ScriptedLink::default()
        };
        let closed = Arc::clone(&link.closed);
        let bootstrap = GatewayBootstrap::start(link, &command());

        assert_eq!(bootstrap.state(), HandshakeState::Error);
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(
            bootstrap.run(),
            Err(HandshakeError::CommandWrite(_))
        ));
    }

    #[test]
    fn read_error_is_fatal() {
        let mut link = ScriptedLink::default();
        link.replies
            .push_back(Err(io::Error::new(io::ErrorKind::Other, "device unplugged")));
        let result = GatewayBootstrap::start(link, &command()).run();
        assert!(matches!(result, Err(HandshakeError::Read(_))));
    }
}
