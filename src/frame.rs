//! RFC4571-style stream framing
//!
//! Carries a datagram-oriented signaling message over a byte-oriented TCP
//! connection: each frame is a 2-byte big-endian length prefix followed by
//! exactly that many payload bytes.
//!
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (2B) │ Payload (length bytes)          │
//! └─────────────┴─────────────────────────────────┘
//! ```

use std::io::{self, Read, Write};

// ============================================================================
// Constants
// ============================================================================

/// Length of the frame header (2 bytes, big-endian)
pub const HEADER_LEN: usize = 2;

/// Maximum payload a frame can carry (the length field is 16 bits)
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

// ============================================================================
// Frame I/O
// ============================================================================

/// Read one complete frame from a reader.
///
/// Blocks until the full payload has been received. A connection that
/// closes or errors mid-frame yields the underlying `io::Error`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let length = u16::from_be_bytes(header) as usize;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;

    Ok(payload)
}

/// Write one frame (length prefix plus payload) to a writer.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame payload too large: {} bytes", payload.len()),
        ));
    }

    writer.write_all(&(payload.len() as u16).to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
