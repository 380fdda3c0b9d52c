//! Pointer output sinks
//!
//! [`UinputPointer`] drives a uinput virtual mouse via mouse-keyboard-input.
//! The reconstruction policies produce absolute positions while uinput
//! speaks relative motion, so the sink keeps the last emitted position and
//! sends the difference.
//!
//! [`TracePointer`] is the fallback when /dev/uinput is not writable;
//! it logs motion instead of applying it so the link can still be
//! exercised.

use aeropoint_protocol::{ButtonFlags, PointerOutput, ProtocolError, Result};
use mouse_keyboard_input::{VirtualDevice, BTN_LEFT, BTN_MIDDLE, BTN_RIGHT};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Virtual mouse backed by uinput
pub struct UinputPointer {
    device: Mutex<VirtualDevice>,
    last: Mutex<Option<(f64, f64)>>,
    held: Mutex<ButtonFlags>,
}

impl UinputPointer {
    /// Create the virtual device. Fails when uinput is missing or the
    /// daemon lacks permission to open it.
    pub fn new() -> Result<Self> {
        let device = VirtualDevice::default().map_err(|e| {
            ProtocolError::PermissionDenied(format!(
                "could not create virtual input device (is /dev/uinput writable?): {}",
                e
            ))
        })?;
        info!("Created virtual input device");

        Ok(Self {
            device: Mutex::new(device),
            last: Mutex::new(None),
            held: Mutex::new(ButtonFlags::default()),
        })
    }
}

impl PointerOutput for UinputPointer {
    fn move_to(&self, x: f64, y: f64) -> Result<()> {
        let mut last = self.last.lock().unwrap();
        let Some((lx, ly)) = *last else {
            // first position just seeds the reference point
            *last = Some((x, y));
            return Ok(());
        };

        let dx = (x - lx).round() as i32;
        let dy = (y - ly).round() as i32;
        *last = Some((x, y));
        drop(last);

        if dx == 0 && dy == 0 {
            return Ok(());
        }

        // uinput's y axis grows downward, opposite the output space
        let mut device = self.device.lock().unwrap();
        device
            .move_mouse(dx, -dy)
            .map_err(|e| ProtocolError::Transport(format!("pointer move failed: {}", e)))
    }

    fn buttons(&self, flags: ButtonFlags) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        if *held == flags {
            return Ok(());
        }
        let previous = *held;
        *held = flags;
        drop(held);

        let mut device = self.device.lock().unwrap();
        for (flag, code) in [
            (ButtonFlags::LEFT, BTN_LEFT),
            (ButtonFlags::RIGHT, BTN_RIGHT),
            (ButtonFlags::MIDDLE, BTN_MIDDLE),
        ] {
            let was = previous.contains(flag);
            let now = flags.contains(flag);
            if !was && now {
                if let Err(e) = device.press(code) {
                    warn!("Failed to press button: {}", e);
                }
            } else if was && !now {
                if let Err(e) = device.release(code) {
                    warn!("Failed to release button: {}", e);
                }
            }
        }
        Ok(())
    }

    fn scroll(&self, amount: i8) -> Result<()> {
        let mut device = self.device.lock().unwrap();
        if let Err(e) = device.smooth_scroll(0, amount as i32) {
            warn!("Failed to scroll: {}", e);
        }
        Ok(())
    }
}

/// Logging-only sink for environments without uinput access
#[derive(Default)]
pub struct TracePointer;

impl PointerOutput for TracePointer {
    fn move_to(&self, x: f64, y: f64) -> Result<()> {
        debug!("pointer -> ({:.1}, {:.1})", x, y);
        Ok(())
    }

    fn buttons(&self, flags: ButtonFlags) -> Result<()> {
        debug!("buttons -> {:#04x}", flags.bits());
        Ok(())
    }

    fn scroll(&self, amount: i8) -> Result<()> {
        debug!("scroll -> {}", amount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_pointer_accepts_everything() {
        let pointer = TracePointer;
        pointer.move_to(10.0, 20.0).unwrap();
        pointer.buttons(ButtonFlags::LEFT).unwrap();
        pointer.scroll(-3).unwrap();
    }
}
