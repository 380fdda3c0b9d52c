//! Relative-pointer report wire codec
//!
//! One sample of button/movement/scroll state travels in one of two sibling
//! binary forms that share fields but differ in delta width:
//!
//! **HID form** (5 or 6 bytes, used on datagram transports where the packet
//! boundary is authoritative):
//!
//! ```text
//! [buttons:u8][dx:i16 LE][dy:i16 LE][scroll:i8]?
//! ```
//!
//! The trailing scroll byte is written only when nonzero; a 5-byte buffer
//! decodes with scroll = 0.
//!
//! **Compact form** (fixed 5 bytes, used on stream transports where a fixed
//! length keeps framing unambiguous):
//!
//! ```text
//! [header:u8][buttons:u8][dx:i8][dy:i8][scroll:i8]
//! ```
//!
//! Compact deltas are clamped to -127..127 on encode. This is a deliberate
//! lossy reduction: a large movement is carried as several successive
//! reports, not one big one.
//!
//! Byte order is little-endian throughout. This is a load-bearing wire
//! contract shared with the handheld implementations, so the tests below
//! assert exact byte sequences.
//!
//! A legacy newline-terminated ASCII form `"MOVE:<dx>,<dy>\n"` is kept for
//! interoperability with older senders on some transports.

use crate::{ProtocolError, Result};

/// Compact-form header marking a movement packet
pub const COMPACT_HEADER_MOVEMENT: u8 = 0x01;

/// Compact-form header marking a control packet
pub const COMPACT_HEADER_CONTROL: u8 = 0x02;

/// Minimum wire length of either binary form
pub const MIN_REPORT_LEN: usize = 5;

/// Button state bitfield
///
/// Bit 0 = left, bit 1 = right, bit 2 = middle, bits 3-7 reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonFlags(pub u8);

impl ButtonFlags {
    pub const LEFT: ButtonFlags = ButtonFlags(0b0000_0001);
    pub const RIGHT: ButtonFlags = ButtonFlags(0b0000_0010);
    pub const MIDDLE: ButtonFlags = ButtonFlags(0b0000_0100);

    /// Raw bitfield value
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Check whether all bits of `other` are set
    pub fn contains(self, other: ButtonFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two button sets
    pub fn union(self, other: ButtonFlags) -> ButtonFlags {
        ButtonFlags(self.0 | other.0)
    }
}

/// Wire form selector for [`MotionReport`] encode/decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// 5-6 byte HID-like form with 16-bit deltas and optional scroll byte
    Hid,

    /// Fixed 5-byte form with 8-bit clamped deltas and a header byte
    Compact,
}

/// Packet class carried in the compact-form header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// Relative movement report
    Movement,

    /// Control data (session-level, routed off the movement path)
    Control,
}

impl PacketClass {
    /// Classify a compact-form header byte
    pub fn from_header(header: u8) -> Result<Self> {
        match header {
            COMPACT_HEADER_MOVEMENT => Ok(PacketClass::Movement),
            COMPACT_HEADER_CONTROL => Ok(PacketClass::Control),
            other => Err(ProtocolError::MalformedReport(format!(
                "unknown compact header 0x{:02X}",
                other
            ))),
        }
    }
}

/// One discrete relative-pointer sample
///
/// Constructed per input sample on the sender, serialized immediately and
/// discarded after send. Deltas are in mickeys (unit-less displacement
/// counts), positive dy meaning "down" by report convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionReport {
    /// Button bitfield
    pub buttons: ButtonFlags,

    /// Horizontal delta
    pub dx: i16,

    /// Vertical delta (positive = down)
    pub dy: i16,

    /// Scroll wheel delta
    pub scroll: i8,
}

impl MotionReport {
    /// Create a report from already-bounded fields
    pub fn new(buttons: ButtonFlags, dx: i16, dy: i16, scroll: i8) -> Self {
        Self {
            buttons,
            dx,
            dy,
            scroll,
        }
    }

    /// Create a report from raw sensor-fusion output, clamping each field
    /// to its representable range
    pub fn clamped(buttons: ButtonFlags, dx: i32, dy: i32, scroll: i32) -> Self {
        Self {
            buttons,
            dx: dx.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            dy: dy.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            scroll: scroll.clamp(i8::MIN as i32, i8::MAX as i32) as i8,
        }
    }

    /// Check whether the report carries no state at all
    pub fn is_idle(&self) -> bool {
        self.buttons.bits() == 0 && self.dx == 0 && self.dy == 0 && self.scroll == 0
    }

    /// Encode into the given wire form
    pub fn encode(&self, form: WireFormat) -> Vec<u8> {
        match form {
            WireFormat::Hid => {
                let mut buf = Vec::with_capacity(6);
                buf.push(self.buttons.bits());
                buf.extend_from_slice(&self.dx.to_le_bytes());
                buf.extend_from_slice(&self.dy.to_le_bytes());
                if self.scroll != 0 {
                    buf.push(self.scroll as u8);
                }
                buf
            }
            WireFormat::Compact => {
                vec![
                    COMPACT_HEADER_MOVEMENT,
                    self.buttons.bits(),
                    clamp_to_i8(self.dx) as u8,
                    clamp_to_i8(self.dy) as u8,
                    self.scroll as u8,
                ]
            }
        }
    }

    /// Decode from the given wire form
    ///
    /// Fails with [`ProtocolError::MalformedReport`] when the buffer is
    /// shorter than the form's minimum length (5 bytes in both forms) or,
    /// for the compact form, when the header byte is not a movement packet.
    pub fn decode(bytes: &[u8], form: WireFormat) -> Result<Self> {
        if bytes.len() < MIN_REPORT_LEN {
            return Err(ProtocolError::MalformedReport(format!(
                "buffer too short: {} bytes, need {}",
                bytes.len(),
                MIN_REPORT_LEN
            )));
        }

        match form {
            WireFormat::Hid => {
                let dx = i16::from_le_bytes([bytes[1], bytes[2]]);
                let dy = i16::from_le_bytes([bytes[3], bytes[4]]);
                let scroll = if bytes.len() >= 6 { bytes[5] as i8 } else { 0 };

                Ok(Self {
                    buttons: ButtonFlags(bytes[0]),
                    dx,
                    dy,
                    scroll,
                })
            }
            WireFormat::Compact => {
                match PacketClass::from_header(bytes[0])? {
                    PacketClass::Movement => {}
                    PacketClass::Control => {
                        return Err(ProtocolError::MalformedReport(
                            "control packet on movement decode path".to_string(),
                        ))
                    }
                }

                Ok(Self {
                    buttons: ButtonFlags(bytes[1]),
                    dx: (bytes[2] as i8) as i16,
                    dy: (bytes[3] as i8) as i16,
                    scroll: bytes[4] as i8,
                })
            }
        }
    }
}

/// Clamp a 16-bit delta into the symmetric compact range
///
/// -128 is excluded so the two directions stay symmetric on the wire.
fn clamp_to_i8(v: i16) -> i8 {
    v.clamp(-127, 127) as i8
}

/// Encode a legacy text movement command
///
/// Produces `"MOVE:<dx>,<dy>\n"` with decimal floating-point deltas.
pub fn encode_legacy(dx: f64, dy: f64) -> Vec<u8> {
    format!("MOVE:{},{}\n", dx, dy).into_bytes()
}

/// Decode a buffer of legacy text movement commands
///
/// Several commands may arrive concatenated in one buffer; the decoder
/// splits on `\n` and silently skips lines that do not parse. Deltas are
/// rounded to the nearest mickey and clamped to 16-bit range.
pub fn decode_legacy(bytes: &[u8]) -> Vec<MotionReport> {
    let text = match std::str::from_utf8(bytes) {
        Ok(t) => t,
        Err(_) => return Vec::new(),
    };

    text.split('\n')
        .filter_map(|line| {
            let args = line.trim().strip_prefix("MOVE:")?;
            let (dx_str, dy_str) = args.split_once(',')?;
            let dx: f64 = dx_str.trim().parse().ok()?;
            let dy: f64 = dy_str.trim().parse().ok()?;

            Some(MotionReport::clamped(
                ButtonFlags::default(),
                dx.round() as i32,
                dy.round() as i32,
                0,
            ))
        })
        .collect()
}
