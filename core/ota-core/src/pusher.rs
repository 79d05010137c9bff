//! Firmware pusher seam.
//!
//! A pusher performs the byte transfer for one device. It reports through a
//! [`ProgressSink`], which feeds the session's single result channel; the
//! terminal event is sent by the session worker from the pusher's return
//! value, so a pusher cannot forget to report it.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::mpsc;

use crate::error::UploadError;

/// Everything a pusher needs to update one device.
#[derive(Clone)]
pub struct UploadRequest {
    pub image: PathBuf,
    pub target: IpAddr,
    pub port: u16,
    pub password: String,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("image", &self.image)
            .field("target", &self.target)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

pub trait FirmwarePusher: Send + Sync + 'static {
    /// Transfers the image, blocking until the device accepted or rejected it.
    fn upload(&self, request: &UploadRequest, progress: &ProgressSink) -> Result<(), UploadError>;
}

/// One message on a session's result channel.
#[derive(Debug)]
pub enum SessionEvent {
    Progress { sent: u64, total: u64 },
    Status(String),
    Completed,
    Failed(UploadError),
}

/// Sending half of a session's result channel.
///
/// Sends never fail loudly: once the session is purged (timeout) nobody is
/// listening and late events are dropped.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    events: mpsc::Sender<SessionEvent>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, receiver) = mpsc::channel();
        (Self { events }, receiver)
    }

    pub fn progress(&self, sent: u64, total: u64) {
        let _ = self.events.send(SessionEvent::Progress { sent, total });
    }

    pub fn status(&self, text: impl Into<String>) {
        let _ = self.events.send(SessionEvent::Status(text.into()));
    }

    pub(crate) fn finish(self, result: Result<(), UploadError>) {
        let event = match result {
            Ok(()) => SessionEvent::Completed,
            Err(err) => SessionEvent::Failed(err),
        };
        let _ = self.events.send(event);
    }
}
