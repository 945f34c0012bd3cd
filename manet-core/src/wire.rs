//! Size-prefixed framing for large-frame links: 4 bytes BE length + payload.

const LEN_SIZE: usize = 4;

/// Largest legal frame. Anything above is treated as a corrupt length.
pub const MAX_FRAME_LEN: u32 = 20 * 1024 * 1024; // 20 MiB

/// Encode one payload into a frame: 4 bytes BE length + payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if payload.is_empty() {
        return Err(FrameEncodeError::Empty);
    }
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("empty frame")]
    Empty,
    #[error("frame of {0} bytes too large")]
    TooLarge(usize),
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; `NeedMore` means try again after more data.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::SizeOutOfBounds(len));
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Error decoding a frame. `SizeOutOfBounds` is fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame length {0} out of bounds")]
    SizeOutOfBounds(u32),
}

/// Accumulates stream bytes and yields whole frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameDecodeError> {
        match decode_frame(&self.buf) {
            Ok((payload, consumed)) => {
                let frame = payload.to_vec();
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
