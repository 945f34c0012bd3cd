//! Byte-safety encoding for the serial link.
//!
//! Bytes below `0x20`, DEL and the marker itself cannot cross the link raw. Each is sent as
//! `ESCAPE_MARKER, value + ESCAPE_OFFSET`. Frames end with `\n`, which therefore never appears
//! inside an encoded frame.

pub const ESCAPE_MARKER: u8 = 0x40;
pub const ESCAPE_OFFSET: u8 = 0x40;
pub const FRAME_DELIMITER: u8 = b'\n';

const DEL: u8 = 0x7f;

fn needs_escape(b: u8) -> bool {
    b < 0x20 || b == ESCAPE_MARKER || b == DEL
}

/// Escape `data` and append the frame delimiter.
pub fn encode_line(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 1);
    for &b in data {
        if needs_escape(b) {
            out.push(ESCAPE_MARKER);
            out.push(b.wrapping_add(ESCAPE_OFFSET));
        } else {
            out.push(b);
        }
    }
    out.push(FRAME_DELIMITER);
    out
}

/// Streaming decoder. Delimiters are dropped; the SAR layer finds boundaries itself.
#[derive(Debug, Default)]
pub struct Unescaper {
    pending_marker: bool,
}

impl Unescaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` into `out`. A marker split across calls is carried over.
    pub fn push(&mut self, bytes: &[u8], out: &mut Vec<u8>) {
        for &b in bytes {
            if b == FRAME_DELIMITER {
                // a marker cut off by the end of a frame is discarded
                self.pending_marker = false;
                continue;
            }
            if self.pending_marker {
                self.pending_marker = false;
                out.push(b.wrapping_sub(ESCAPE_OFFSET));
            } else if b == ESCAPE_MARKER {
                self.pending_marker = true;
            } else {
                out.push(b);
            }
        }
    }
}
