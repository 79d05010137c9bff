//! Serial transport to the gateway dongle, backed by `serialport`.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info};
use tracker_ota_protocol::{GATEWAY_BAUD_RATE, GATEWAY_USB_PID, GATEWAY_USB_VID};

use crate::bootloader::ControlLines;
use crate::error::SerialError;
use crate::gateway::GatewayLink;

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const READ_CHUNK_SIZE: usize = 256;
/// Unterminated gateway output beyond this is discarded.
const MAX_PENDING_BYTES: usize = 4 * 1024;

/// Finds the gateway by USB identity and opens it.
pub fn discover_gateway() -> Result<SerialGateway, SerialError> {
    let ports = serialport::available_ports().map_err(SerialError::Enumerate)?;
    let path = find_gateway_port(&ports).ok_or(SerialError::NotFound {
        vid: GATEWAY_USB_VID,
        pid: GATEWAY_USB_PID,
    })?;
    info!(path = %path, "Found gateway");
    SerialGateway::open(&path)
}

fn find_gateway_port(ports: &[SerialPortInfo]) -> Option<String> {
    ports.iter().find_map(|port| match &port.port_type {
        SerialPortType::UsbPort(usb) if usb.vid == GATEWAY_USB_VID && usb.pid == GATEWAY_USB_PID => {
            Some(port.port_name.clone())
        }
        _ => None,
    })
}

pub struct SerialGateway {
    path: String,
    port: Option<Box<dyn SerialPort>>,
    pending: Vec<u8>,
}

impl SerialGateway {
    pub fn open(path: &str) -> Result<Self, SerialError> {
        let port = serialport::new(path, GATEWAY_BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| SerialError::Open {
                path: path.to_string(),
                source,
            })?;
        debug!(path = %path, baud = GATEWAY_BAUD_RATE, "Gateway port opened");
        Ok(Self {
            path: path.to_string(),
            port: Some(port),
            pending: Vec::new(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn buffer(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > MAX_PENDING_BYTES && !self.pending.contains(&b'\n') {
            debug!(
                path = %self.path,
                bytes = self.pending.len(),
                "Discarding unterminated gateway output"
            );
            self.pending.clear();
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl GatewayLink for SerialGateway {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "gateway port closed"))?;
        port.write_all(line.as_bytes())?;
        port.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            let Some(port) = self.port.as_mut() else {
                return Ok(None);
            };
            match port.read(&mut chunk) {
                Ok(0) => {
                    self.port = None;
                    return Ok(None);
                }
                Ok(n) => self.buffer(&chunk[..n]),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::BrokenPipe
                            | io::ErrorKind::NotConnected
                            | io::ErrorKind::UnexpectedEof
                    ) =>
                {
                    self.port = None;
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(path = %self.path, "Gateway port closed");
        }
    }
}

impl ControlLines for SerialGateway {
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "gateway port closed"))?;
        port.write_data_terminal_ready(dtr)?;
        port.write_request_to_send(rts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb(name: &str, vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        }
    }

    #[test]
    fn picks_port_matching_gateway_identity() {
        let ports = vec![
            SerialPortInfo {
                port_name: "/dev/ttyS0".to_string(),
                port_type: SerialPortType::Unknown,
            },
            usb("/dev/ttyUSB0", 0x10c4, 0xea60),
            usb("/dev/ttyACM0", 0x1209, 0x7690),
        ];
        assert_eq!(find_gateway_port(&ports), Some("/dev/ttyACM0".to_string()));
    }

    #[test]
    fn no_match_when_gateway_absent() {
        let ports = vec![usb("/dev/ttyUSB0", 0x1209, 0x0001)];
        assert_eq!(find_gateway_port(&ports), None);
    }

    #[test]
    fn splits_buffered_lines() {
        let mut gateway = SerialGateway {
            path: "test".to_string(),
            port: None,
            pending: b"first\r\nsecond\npartial".to_vec(),
        };
        assert_eq!(gateway.read_line().unwrap(), Some("first".to_string()));
        assert_eq!(gateway.read_line().unwrap(), Some("second".to_string()));
        assert_eq!(gateway.read_line().unwrap(), None);
    }

    #[test]
    fn unterminated_output_is_bounded() {
        let mut gateway = SerialGateway {
            path: "test".to_string(),
            port: None,
            pending: Vec::new(),
        };
        for _ in 0..64 {
            gateway.buffer(&[b'x'; READ_CHUNK_SIZE]);
            assert!(gateway.pending.len() <= MAX_PENDING_BYTES + READ_CHUNK_SIZE);
        }

        gateway.buffer(b"OTAUPDATESTARTED\n");
        let line = gateway.take_line().expect("line after discard");
        assert!(line.ends_with("OTAUPDATESTARTED"));
        assert!(line.len() <= MAX_PENDING_BYTES + READ_CHUNK_SIZE);
    }
}
