//! Bootloader entry for a directly attached gateway.
//!
//! Uses the esptool reset sequence on the USB-serial control lines (the
//! board inverts them).

use std::io;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::SerialError;

/// Delay between control-line steps.
pub const STEP_DELAY: Duration = Duration::from_millis(100);

pub trait ControlLines {
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlStep {
    pub label: &'static str,
    pub dtr: bool,
    pub rts: bool,
}

pub const BOOTLOADER_SEQUENCE: [ControlStep; 4] = [
    ControlStep {
        label: "step 1",
        dtr: false,
        rts: true,
    },
    ControlStep {
        label: "step 2",
        dtr: true,
        rts: true,
    },
    ControlStep {
        label: "step 3",
        dtr: true,
        rts: false,
    },
    ControlStep {
        label: "step 4",
        dtr: false,
        rts: false,
    },
];

/// Applies [`BOOTLOADER_SEQUENCE`], waiting `step_delay` between steps.
pub fn enter_bootloader<C: ControlLines>(
    lines: &mut C,
    step_delay: Duration,
) -> Result<(), SerialError> {
    for (index, step) in BOOTLOADER_SEQUENCE.iter().enumerate() {
        if index > 0 {
            thread::sleep(step_delay);
        }
        lines
            .set_control_lines(step.dtr, step.rts)
            .map_err(|source| SerialError::ControlLine {
                step: step.label,
                source,
            })?;
        debug!(step = step.label, dtr = step.dtr, rts = step.rts, "Set control lines");
    }
    info!("Gateway should now be in bootloader mode");
    Ok(())
}
