//! ArduinoOTA firmware pusher.
//!
//! Invites the device over UDP, answers its MD5 challenge, then streams the
//! image over the TCP connection the device opens back to us.

use fs_err as fs;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use tracker_ota_protocol::espota::{
    auth_response, client_nonce, md5_hex, upload_verdict, DeviceReply, Invitation, UploadVerdict,
    FLASH_COMMAND,
};

use crate::error::UploadError;
use crate::pusher::{FirmwarePusher, ProgressSink, UploadRequest};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct EspOtaPusher {
    pub invitation_attempts: u32,
    pub reply_timeout: Duration,
    pub auth_timeout: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub confirm_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for EspOtaPusher {
    fn default() -> Self {
        Self {
            invitation_attempts: 10,
            reply_timeout: Duration::from_secs(1),
            auth_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            confirm_timeout: Duration::from_secs(60),
            chunk_size: 1460,
        }
    }
}

impl FirmwarePusher for EspOtaPusher {
    fn upload(&self, request: &UploadRequest, progress: &ProgressSink) -> Result<(), UploadError> {
        let image = fs::read(&request.image).map_err(|source| UploadError::ReadImage {
            path: request.image.clone(),
            source,
        })?;
        let size = image.len() as u64;
        let file_md5 = md5_hex(&image);

        let listener =
            TcpListener::bind(unspecified(request.target)).map_err(socket_error("tcp bind"))?;
        let local_port = listener
            .local_addr()
            .map_err(socket_error("tcp bind"))?
            .port();

        let udp = UdpSocket::bind(unspecified(request.target)).map_err(socket_error("udp bind"))?;
        udp.connect((request.target, request.port))
            .map_err(socket_error("udp connect"))?;

        progress.status("inviting");
        let invitation = Invitation {
            command: FLASH_COMMAND,
            local_port,
            size,
            md5: file_md5.clone(),
        };
        let reply = exchange(
            &udp,
            invitation.to_string().as_bytes(),
            self.invitation_attempts,
            self.reply_timeout,
        )?;

        match reply {
            DeviceReply::Ok => {}
            DeviceReply::Auth { nonce } => {
                progress.status("authenticating");
                let file_name = request
                    .image
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let cnonce = client_nonce(&file_name, size, &file_md5, &request.target.to_string());
                let response = auth_response(&request.password, &nonce, &cnonce);
                match exchange(&udp, response.as_bytes(), 1, self.auth_timeout)? {
                    DeviceReply::Ok => {}
                    other => return Err(UploadError::AuthenticationFailed(reply_text(other))),
                }
            }
            DeviceReply::Other(text) => return Err(UploadError::Rejected(text)),
        }

        progress.status("waiting for device");
        let stream = self.accept(&listener, request.target)?;

        progress.status("uploading");
        self.stream_image(stream, &image, progress)
    }
}

impl EspOtaPusher {
    fn accept(&self, listener: &TcpListener, target: IpAddr) -> Result<TcpStream, UploadError> {
        listener
            .set_nonblocking(true)
            .map_err(socket_error("tcp accept"))?;
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if peer.ip() != target {
                        debug!(peer = %peer, target = %target, "Device connected from another address");
                    }
                    stream
                        .set_nonblocking(false)
                        .map_err(socket_error("tcp accept"))?;
                    return Ok(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(UploadError::ConnectTimeout {
                            secs: self.connect_timeout.as_secs(),
                        });
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => return Err(socket_error("tcp accept")(err)),
            }
        }
    }

    fn stream_image(
        &self,
        mut stream: TcpStream,
        image: &[u8],
        progress: &ProgressSink,
    ) -> Result<(), UploadError> {
        let total = image.len() as u64;
        stream.set_nodelay(true).map_err(socket_error("transfer"))?;
        stream
            .set_read_timeout(Some(self.ack_timeout))
            .map_err(socket_error("transfer"))?;

        let mut sent = 0u64;
        let mut ack = [0u8; 32];
        let mut last_reply = String::new();
        progress.progress(0, total);
        for chunk in image.chunks(self.chunk_size.max(1)) {
            stream.write_all(chunk).map_err(socket_error("transfer"))?;
            sent += chunk.len() as u64;
            progress.progress(sent, total);

            let n = stream.read(&mut ack).map_err(socket_error("transfer"))?;
            if n == 0 {
                return Err(UploadError::Unconfirmed);
            }
            last_reply = String::from_utf8_lossy(&ack[..n]).into_owned();
        }

        progress.status("awaiting confirmation");
        stream
            .set_read_timeout(Some(self.confirm_timeout))
            .map_err(socket_error("confirmation"))?;
        let mut received = last_reply;
        loop {
            match upload_verdict(&received) {
                UploadVerdict::Accepted => return Ok(()),
                UploadVerdict::Rejected => {
                    return Err(UploadError::Device(received.trim().to_string()))
                }
                UploadVerdict::Pending => {}
            }
            let n = stream
                .read(&mut ack)
                .map_err(socket_error("confirmation"))?;
            if n == 0 {
                return Err(UploadError::Unconfirmed);
            }
            received = String::from_utf8_lossy(&ack[..n]).into_owned();
        }
    }
}

/// Sends `payload` up to `attempts` times until the device answers.
fn exchange(
    udp: &UdpSocket,
    payload: &[u8],
    attempts: u32,
    timeout: Duration,
) -> Result<DeviceReply, UploadError> {
    udp.set_read_timeout(Some(timeout))
        .map_err(socket_error("invitation"))?;
    let mut buffer = [0u8; 64];
    for attempt in 1..=attempts {
        udp.send(payload).map_err(socket_error("invitation"))?;
        match udp.recv(&mut buffer) {
            Ok(n) => return Ok(DeviceReply::parse(&buffer[..n])),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!(attempt, error = %err, "No reply from device yet");
            }
            Err(err) => return Err(socket_error("invitation")(err)),
        }
    }
    Err(UploadError::NoResponse { attempts })
}

fn unspecified(target: IpAddr) -> SocketAddr {
    match target {
        IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        IpAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

fn reply_text(reply: DeviceReply) -> String {
    match reply {
        DeviceReply::Ok => "OK".to_string(),
        DeviceReply::Auth { nonce } => format!("unexpected second challenge {}", nonce),
        DeviceReply::Other(text) => text,
    }
}

fn socket_error(stage: &'static str) -> impl Fn(io::Error) -> UploadError {
    move |source| UploadError::Socket { stage, source }
}
