//! Random serial numbers for issued certificates.

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::SerialNumber;

/// Width of every serial number in bytes.
pub const SERIAL_LEN: usize = 16;

/// A fixed-width certificate serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Serial([u8; SERIAL_LEN]);

impl Serial {
    pub fn as_bytes(&self) -> &[u8; SERIAL_LEN] {
        &self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<Serial> for SerialNumber {
    fn from(serial: Serial) -> Self {
        SerialNumber::from_slice(&serial.0)
    }
}

/// Draws serial numbers from the operating system CSPRNG.
///
/// Uniqueness is probabilistic: nothing is persisted, so several processes
/// sharing one root never need to coordinate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialNumberGenerator;

impl SerialNumberGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn next(&self) -> Serial {
        let mut bytes = [0u8; SERIAL_LEN];
        OsRng.fill_bytes(&mut bytes);
        // Positive DER INTEGER that never loses its leading byte on encode.
        bytes[0] = (bytes[0] & 0x7f) | 0x40;
        Serial(bytes)
    }
}
