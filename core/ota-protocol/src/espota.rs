//! ArduinoOTA ("espota") invitation and authentication messages.
//!
//! The host invites the device over UDP, optionally answers an MD5 challenge,
//! then the device connects back over TCP to pull the image.

use std::fmt;

/// Invitation command for a flash (application) image.
pub const FLASH_COMMAND: u32 = 0;

/// Default ArduinoOTA port on ESP32 targets.
pub const DEFAULT_OTA_PORT: u16 = 3232;

/// Acknowledgement sent by the device for a successful step.
pub const OK_REPLY: &str = "OK";

const AUTH_PREFIX: &str = "AUTH ";
const AUTH_RESPONSE_CODE: u32 = 200;

/// First datagram of an upload: `<command> <local port> <size> <md5>\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub command: u32,
    pub local_port: u16,
    pub size: u64,
    pub md5: String,
}

impl fmt::Display for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} {} {}",
            self.command, self.local_port, self.size, self.md5
        )
    }
}

/// Device answer to an invitation or to an auth response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    Ok,
    Auth { nonce: String },
    Other(String),
}

impl DeviceReply {
    pub fn parse(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let text = text.trim();
        if text == OK_REPLY {
            return DeviceReply::Ok;
        }
        if let Some(nonce) = text.strip_prefix(AUTH_PREFIX) {
            return DeviceReply::Auth {
                nonce: nonce.trim().to_string(),
            };
        }
        DeviceReply::Other(text.to_string())
    }
}

/// Hex MD5 digest, the only hash the protocol uses.
pub fn md5_hex(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(data))
}

/// Client nonce derived from the image identity and target address.
pub fn client_nonce(file_name: &str, size: u64, file_md5: &str, target: &str) -> String {
    md5_hex(format!("{}{}{}{}", file_name, size, file_md5, target))
}

/// Reply line to an `AUTH <nonce>` challenge.
pub fn auth_response(password: &str, nonce: &str, cnonce: &str) -> String {
    let password_md5 = md5_hex(password);
    let result = md5_hex(format!("{}:{}:{}", password_md5, nonce, cnonce));
    format!("{} {} {}\n", AUTH_RESPONSE_CODE, cnonce, result)
}

/// Final TCP response classification after the image was streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadVerdict {
    Accepted,
    Rejected,
    Pending,
}

/// The device answers `OK` on success and a line starting with `E` on failure.
/// Anything else (per-chunk byte counts) means keep reading.
pub fn upload_verdict(received: &str) -> UploadVerdict {
    if received.contains(OK_REPLY) {
        UploadVerdict::Accepted
    } else if received.contains('E') {
        UploadVerdict::Rejected
    } else {
        UploadVerdict::Pending
    }
}
