//! Wire formats for tracker OTA delivery.
//!
//! This crate is shared by the orchestrator and by anything that needs to
//! speak to it (test gateways, fake trackers) so the formats cannot drift.
//! It covers three conversations:
//!
//! - the UDP hail a tracker sends to the rendezvous listener,
//! - the line-oriented serial handshake with the gateway dongle,
//! - the ArduinoOTA invitation and authentication exchange ([`espota`]).

use std::fmt;
use std::net::Ipv4Addr;

pub mod espota;

/// Length of the per-run authentication token in bytes.
pub const RUN_TOKEN_LEN: usize = 16;

/// Literal that precedes the run token in every hail datagram.
pub const HAIL_PREFIX: &[u8] = b"OTAREQUEST";

/// Serial command keyword that puts the gateway into OTA broadcast mode.
pub const START_OTA_COMMAND: &str = "startotaupdate";

/// Gateway output acknowledging that the broadcast started.
pub const STARTED_MARKER: &str = "OTAUPDATESTARTED";

/// Gateway output emitted by firmware that predates the OTA command.
pub const UNKNOWN_COMMAND_MARKER: &str = "Unknown command";

pub const GATEWAY_USB_VID: u16 = 0x1209;
pub const GATEWAY_USB_PID: u16 = 0x7690;
pub const GATEWAY_BAUD_RATE: u32 = 115_200;

/// Longest SSID the gateway will forward (802.11 limit).
pub const MAX_SSID_BYTES: usize = 32;
/// Longest WPA passphrase the gateway will forward.
pub const MAX_WIFI_PASSWORD_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("line is not a {START_OTA_COMMAND} command")]
    NotStartCommand,

    #[error("auth token must be {} hex characters followed by a space", RUN_TOKEN_LEN * 2)]
    MalformedToken,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("invalid wifi credentials: {0}")]
    InvalidCredentials(&'static str),
}

/// Builds the exact datagram a tracker sends to announce itself.
pub fn hail_payload(token: &[u8; RUN_TOKEN_LEN]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(HAIL_PREFIX.len() + RUN_TOKEN_LEN);
    payload.extend_from_slice(HAIL_PREFIX);
    payload.extend_from_slice(token);
    payload
}

/// Hex form of [`hail_payload`]; received datagrams are compared against it.
pub fn hail_verification_string(token: &[u8; RUN_TOKEN_LEN]) -> String {
    hex::encode(hail_payload(token))
}

/// The one line written to the gateway to start the OTA broadcast.
///
/// Format: `startotaupdate <32 hex> <port> <ipv4> <ssid>\t<password>\n`.
#[derive(Clone, PartialEq, Eq)]
pub struct StartOtaCommand {
    pub token: [u8; RUN_TOKEN_LEN],
    pub port: u16,
    pub host: Ipv4Addr,
    pub ssid: String,
    pub password: String,
}

impl StartOtaCommand {
    /// Checks the credentials against what the gateway parser can carry.
    pub fn validate_credentials(ssid: &str, password: &str) -> Result<(), ProtocolError> {
        if ssid.is_empty() {
            return Err(ProtocolError::InvalidCredentials("SSID is empty"));
        }
        if ssid.len() > MAX_SSID_BYTES {
            return Err(ProtocolError::InvalidCredentials("SSID exceeds 32 bytes"));
        }
        if password.len() > MAX_WIFI_PASSWORD_BYTES {
            return Err(ProtocolError::InvalidCredentials(
                "password exceeds 64 bytes",
            ));
        }
        let forbidden = |c: char| c == '\t' || c == '\n' || c == '\r';
        if ssid.contains(forbidden) || password.contains(forbidden) {
            return Err(ProtocolError::InvalidCredentials(
                "tab and newline characters are not allowed",
            ));
        }
        Ok(())
    }

    /// Renders the newline-terminated command line.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}\t{}\n",
            START_OTA_COMMAND,
            hex::encode(self.token),
            self.port,
            self.host,
            self.ssid,
            self.password
        )
    }

    /// Parses a command line the way the gateway firmware does.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let params = line
            .strip_prefix(START_OTA_COMMAND)
            .and_then(|rest| rest.strip_prefix(' '))
            .ok_or(ProtocolError::NotStartCommand)?
            .trim_start();

        let token_hex_len = RUN_TOKEN_LEN * 2;
        if params.find(' ') != Some(token_hex_len) {
            return Err(ProtocolError::MalformedToken);
        }
        let mut token = [0u8; RUN_TOKEN_LEN];
        hex::decode_to_slice(&params[..token_hex_len], &mut token)
            .map_err(|_| ProtocolError::MalformedToken)?;

        let remaining = &params[token_hex_len + 1..];
        let (port_str, rest) = remaining
            .split_once(' ')
            .ok_or(ProtocolError::MissingField("host"))?;
        let port = match port_str.trim().parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(ProtocolError::InvalidPort(port_str.to_string())),
        };

        let (host_str, credentials) = rest
            .trim_start()
            .split_once(' ')
            .ok_or(ProtocolError::MissingField("ssid"))?;
        let host = host_str
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|_| ProtocolError::InvalidAddress(host_str.to_string()))?;

        let (ssid, password) = credentials
            .split_once('\t')
            .ok_or(ProtocolError::MissingField("password"))?;

        Ok(Self {
            token,
            port,
            host,
            ssid: ssid.trim().to_string(),
            password: password.trim().to_string(),
        })
    }
}

impl fmt::Debug for StartOtaCommand {
    // Token and passphrase stay out of debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOtaCommand")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("ssid", &self.ssid)
            .finish_non_exhaustive()
    }
}

/// How a line of gateway output bears on the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayReply {
    Started,
    UnknownCommand,
    Diagnostic,
}

impl GatewayReply {
    /// Markers are matched anywhere in the line; gateways prefix their logs.
    pub fn classify(line: &str) -> Self {
        if line.contains(STARTED_MARKER) {
            GatewayReply::Started
        } else if line.contains(UNKNOWN_COMMAND_MARKER) {
            GatewayReply::UnknownCommand
        } else {
            GatewayReply::Diagnostic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: [u8; RUN_TOKEN_LEN] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];

    fn command() -> StartOtaCommand {
        StartOtaCommand {
            token: TOKEN,
            port: 9000,
            host: Ipv4Addr::new(192, 168, 1, 2),
            ssid: "home net".to_string(),
            password: "hunter22".to_string(),
        }
    }

    #[test]
    fn verification_string_is_prefix_then_token() {
        assert_eq!(
            hail_verification_string(&TOKEN),
            "4f544152455155455354\
             00112233445566778899aabbccddeeff"
        );
    }

    #[test]
    fn renders_command_line() {
        assert_eq!(
            command().to_line(),
            "startotaupdate 00112233445566778899aabbccddeeff 9000 192.168.1.2 home net\thunter22\n"
        );
    }

    #[test]
    fn parses_rendered_command() {
        let parsed = StartOtaCommand::parse(&command().to_line()).expect("parse");
        assert_eq!(parsed, command());
    }

    #[test]
    fn rejects_short_token() {
        let err = StartOtaCommand::parse("startotaupdate 0011 9000 10.0.0.1 a\tb").unwrap_err();
        assert_eq!(err, ProtocolError::MalformedToken);
    }

    #[test]
    fn rejects_non_hex_token() {
        let line = format!("startotaupdate {} 9000 10.0.0.1 a\tb", "zz".repeat(16));
        assert_eq!(
            StartOtaCommand::parse(&line).unwrap_err(),
            ProtocolError::MalformedToken
        );
    }

    #[test]
    fn rejects_port_zero() {
        let line = format!("startotaupdate {} 0 10.0.0.1 a\tb", hex::encode(TOKEN));
        assert!(matches!(
            StartOtaCommand::parse(&line),
            Err(ProtocolError::InvalidPort(_))
        ));
    }

    #[test]
    fn requires_tab_between_credentials() {
        let line = format!("startotaupdate {} 9000 10.0.0.1 ssid pass", hex::encode(TOKEN));
        assert_eq!(
            StartOtaCommand::parse(&line).unwrap_err(),
            ProtocolError::MissingField("password")
        );
    }

    #[test]
    fn rejects_other_commands() {
        assert_eq!(
            StartOtaCommand::parse("reboot").unwrap_err(),
            ProtocolError::NotStartCommand
        );
    }

    #[test]
    fn credential_limits() {
        assert!(StartOtaCommand::validate_credentials("net", "").is_ok());
        assert!(StartOtaCommand::validate_credentials("", "pw").is_err());
        assert!(StartOtaCommand::validate_credentials(&"s".repeat(33), "pw").is_err());
        assert!(StartOtaCommand::validate_credentials("net", &"p".repeat(65)).is_err());
        assert!(StartOtaCommand::validate_credentials("net", "a\tb").is_err());
    }

    #[test]
    fn debug_hides_secrets() {
        let rendered = format!("{:?}", command());
        assert!(!rendered.contains("hunter22"));
        assert!(!rendered.contains("00112233"));
    }

    #[test]
    fn classifies_gateway_lines() {
        assert_eq!(GatewayReply::classify("OTAUPDATESTARTED"), GatewayReply::Started);
        assert_eq!(
            GatewayReply::classify("[CMD] Unknown command: startotaupdate"),
            GatewayReply::UnknownCommand
        );
        assert_eq!(
            GatewayReply::classify("[ESPNOW] tracker 3 connected"),
            GatewayReply::Diagnostic
        );
    }
}
