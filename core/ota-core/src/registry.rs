//! In-flight OTA sessions, one per device address.
//!
//! The registry is the only shared mutable state in a run. Admission, progress
//! and removal are serialized by one mutex; the transfers themselves run on
//! their own threads so a stalled device never blocks a new hail.
//!
//! Each session gets two threads: a worker that calls the pusher and a
//! supervisor that drains the session's result channel into the registry and
//! enforces the optional deadline.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::listener::HailSink;
use crate::pusher::{FirmwarePusher, ProgressSink, SessionEvent, UploadRequest};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// Snapshot of one tracked session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaSession {
    pub id: SessionId,
    pub address: IpAddr,
    pub state: SessionState,
    /// Percent transferred, 0-100, never decreases.
    pub progress: u8,
    pub status: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started(SessionId),
    AlreadyActive(SessionId),
    /// The worker threads could not be spawned; nothing is tracked.
    Refused,
}

/// What every session uploads and where.
#[derive(Clone)]
pub struct UploadPlan {
    pub image: PathBuf,
    pub ota_port: u16,
    pub ota_password: String,
    /// `None` lets a stalled session live forever.
    pub session_timeout: Option<Duration>,
}

impl std::fmt::Debug for UploadPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPlan")
            .field("image", &self.image)
            .field("ota_port", &self.ota_port)
            .field("session_timeout", &self.session_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Sessions {
    next_id: SessionId,
    active: HashMap<IpAddr, OtaSession>,
}

struct Shared {
    sessions: Mutex<Sessions>,
    changed: Condvar,
    pusher: Arc<dyn FirmwarePusher>,
    plan: UploadPlan,
}

/// Cheap, cloneable handle to the run's session table.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl SessionRegistry {
    pub fn new(pusher: Arc<dyn FirmwarePusher>, plan: UploadPlan) -> Self {
        Self {
            shared: Arc::new(Shared {
                sessions: Mutex::new(Sessions::default()),
                changed: Condvar::new(),
                pusher,
                plan,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts an upload for `address` unless one is already in flight.
    ///
    /// Returns without waiting for the transfer. A repeated hail from the same
    /// address is a no-op until that session reaches a terminal state.
    pub fn admit(&self, address: IpAddr) -> Admission {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.active.get(&address) {
            debug!(
                address = %address,
                session_id = existing.id,
                "Session already active; ignoring repeated hail"
            );
            return Admission::AlreadyActive(existing.id);
        }

        let id = sessions.next_id;
        sessions.next_id += 1;
        sessions.active.insert(
            address,
            OtaSession {
                id,
                address,
                state: SessionState::Pending,
                progress: 0,
                status: None,
                started_at: Utc::now(),
            },
        );

        if let Err(err) = self.spawn_session(id, address) {
            warn!(address = %address, error = %err, "Failed to start OTA session");
            sessions.active.remove(&address);
            return Admission::Refused;
        }

        if let Some(session) = sessions.active.get_mut(&address) {
            session.state = SessionState::InProgress;
        }
        info!(address = %address, session_id = id, "Starting OTA session");
        Admission::Started(id)
    }

    fn spawn_session(&self, id: SessionId, address: IpAddr) -> std::io::Result<()> {
        let plan = &self.shared.plan;
        let request = UploadRequest {
            image: plan.image.clone(),
            target: address,
            port: plan.ota_port,
            password: plan.ota_password.clone(),
        };
        let deadline = plan.session_timeout.map(|timeout| Instant::now() + timeout);
        let (sink, events) = ProgressSink::channel();

        let registry = self.clone();
        thread::Builder::new()
            .name(format!("ota-supervise-{}", address))
            .spawn(move || registry.supervise(id, address, events, deadline))?;

        // A worker that fails to spawn drops its sink, so the supervisor
        // above exits on the disconnected channel.
        let pusher = Arc::clone(&self.shared.pusher);
        thread::Builder::new()
            .name(format!("ota-upload-{}", address))
            .spawn(move || {
                let result = pusher.upload(&request, &sink);
                sink.finish(result);
            })?;
        Ok(())
    }

    fn supervise(
        &self,
        id: SessionId,
        address: IpAddr,
        events: Receiver<SessionEvent>,
        deadline: Option<Instant>,
    ) {
        loop {
            let next = match deadline {
                Some(deadline) => {
                    events.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => events.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let outcome = match next {
                Ok(SessionEvent::Progress { sent, total }) => {
                    self.apply_progress(Some(id), address, sent, total);
                    continue;
                }
                Ok(SessionEvent::Status(text)) => {
                    self.apply_status(id, address, text);
                    continue;
                }
                Ok(SessionEvent::Completed) => SessionOutcome::Completed,
                Ok(SessionEvent::Failed(err)) => SessionOutcome::Failed(err.to_string()),
                Err(RecvTimeoutError::Timeout) => SessionOutcome::TimedOut,
                Err(RecvTimeoutError::Disconnected) => SessionOutcome::Failed(
                    "upload task ended without reporting an outcome".to_string(),
                ),
            };
            self.finish(Some(id), address, outcome);
            return;
        }
    }

    /// Records transfer progress for the session at `address`.
    ///
    /// Late events for an address that is no longer tracked are ignored.
    pub fn on_progress(&self, address: IpAddr, sent: u64, total: u64) {
        self.apply_progress(None, address, sent, total);
    }

    /// Removes the session at `address` and logs how it ended.
    pub fn on_terminal(&self, address: IpAddr, outcome: SessionOutcome) -> Option<OtaSession> {
        self.finish(None, address, outcome)
    }

    fn apply_progress(&self, id: Option<SessionId>, address: IpAddr, sent: u64, total: u64) {
        let Some(percent) = progress_percent(sent, total) else {
            return;
        };
        let mut sessions = self.lock();
        if let Some(session) = matching_session(&mut sessions, id, address) {
            session.state = SessionState::InProgress;
            session.progress = session.progress.max(percent);
        }
    }

    fn apply_status(&self, id: SessionId, address: IpAddr, text: String) {
        info!(address = %address, state = %text, "Tracker state");
        let mut sessions = self.lock();
        if let Some(session) = matching_session(&mut sessions, Some(id), address) {
            session.status = Some(text);
        }
    }

    fn finish(
        &self,
        id: Option<SessionId>,
        address: IpAddr,
        outcome: SessionOutcome,
    ) -> Option<OtaSession> {
        let removed = {
            let mut sessions = self.lock();
            let matches = matching_session(&mut sessions, id, address).is_some();
            if matches {
                sessions.active.remove(&address)
            } else {
                None
            }
        };

        let Some(session) = removed else {
            debug!(address = %address, outcome = ?outcome, "Outcome for untracked session ignored");
            return None;
        };
        self.shared.changed.notify_all();

        let elapsed_secs = (Utc::now() - session.started_at).num_seconds();
        match &outcome {
            SessionOutcome::Completed => {
                info!(address = %address, elapsed_secs, "Tracker OTA complete")
            }
            SessionOutcome::Failed(error) => {
                warn!(address = %address, error = %error, progress = session.progress, "Tracker OTA error")
            }
            SessionOutcome::TimedOut => {
                warn!(address = %address, progress = session.progress, elapsed_secs, "Tracker OTA timed out")
            }
        }
        Some(session)
    }

    /// Point-in-time copy of all tracked sessions in admission order.
    pub fn sessions(&self) -> Vec<OtaSession> {
        let sessions = self.lock();
        let mut snapshot: Vec<OtaSession> = sessions.active.values().cloned().collect();
        drop(sessions);
        snapshot.sort_by_key(|session| session.id);
        snapshot
    }

    pub fn get(&self, address: IpAddr) -> Option<OtaSession> {
        self.lock().active.get(&address).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Space-separated `NN%` per session, or `None` when nothing is tracked.
    pub fn report_summary(&self) -> Option<String> {
        let sessions = self.sessions();
        if sessions.is_empty() {
            return None;
        }
        Some(
            sessions
                .iter()
                .map(|session| format!("{}%", session.progress))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }

    /// Blocks until no session is tracked or `timeout` elapses.
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sessions = self.lock();
        while !sessions.active.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            sessions = self
                .shared
                .changed
                .wait_timeout(sessions, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }
}

impl HailSink for SessionRegistry {
    fn admit(&self, address: IpAddr) {
        SessionRegistry::admit(self, address);
    }
}

fn matching_session(
    sessions: &mut Sessions,
    id: Option<SessionId>,
    address: IpAddr,
) -> Option<&mut OtaSession> {
    sessions
        .active
        .get_mut(&address)
        .filter(|session| id.map_or(true, |id| session.id == id))
}

fn progress_percent(sent: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = (sent as f64 / total as f64 * 100.0).round();
    Some(percent.clamp(0.0, 100.0) as u8)
}
