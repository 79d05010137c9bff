//! Per-run authentication token and hail verification.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use tracker_ota_protocol::{hail_payload, hail_verification_string, RUN_TOKEN_LEN};

/// Random secret generated once per process run, never persisted.
///
/// Trackers learn it from the gateway broadcast and echo it back in their
/// hail, so a device that was not invited during this run cannot join.
#[derive(Clone, PartialEq, Eq)]
pub struct RunToken([u8; RUN_TOKEN_LEN]);

impl RunToken {
    /// Draws a fresh token from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; RUN_TOKEN_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; RUN_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RUN_TOKEN_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Datagram a tracker must send to be admitted under this token.
    pub fn hail(&self) -> Vec<u8> {
        hail_payload(&self.0)
    }
}

impl fmt::Debug for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RunToken(..)")
    }
}

/// Exact-match check of received datagrams against the run's hail.
#[derive(Debug, Clone)]
pub struct HailVerifier {
    expected: String,
}

impl HailVerifier {
    pub fn new(token: &RunToken) -> Self {
        Self {
            expected: hail_verification_string(token.as_bytes()),
        }
    }

    /// True only when the hex form of `datagram` equals the expected string.
    pub fn verify(&self, datagram: &[u8]) -> bool {
        if datagram.len() * 2 != self.expected.len() {
            return false;
        }
        let received = hex::encode(datagram);
        constant_time_eq(received.as_bytes(), self.expected.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
