//! On-disk frame format shared by the WAL, segments and segment indexes.
//!
//! Each frame is `[4-byte CRC32][4-byte length][JSON payload]\n`, integers
//! little-endian. The CRC covers the payload only.

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("frame truncated")]
    Truncated,
}

/// Bytes of framing around each payload.
pub const FRAME_OVERHEAD: usize = 4 + 4 + 1;

/// Largest payload a frame may declare. Longer length headers are treated
/// as a torn frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Serialize `value` into one complete frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(value)?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.push(b'\n');
    Ok(frame)
}

/// Read the next frame. Returns `Ok(None)` at a clean end of input, and
/// `Err(CodecError::Truncated)` if the input ends inside a frame.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, CodecError> {
    let mut crc_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut crc_buf)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Partial => return Err(CodecError::Truncated),
        ReadOutcome::Full => {}
    }
    let expected = u32::from_le_bytes(crc_buf);

    let mut len_buf = [0u8; 4];
    read_body(reader, &mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::Truncated);
    }

    // The length is not covered by the CRC, so grow the buffer with the
    // bytes actually present instead of allocating `len` up front.
    let mut payload = Vec::with_capacity(len.min(64 * 1024));
    let read = reader.by_ref().take(len as u64).read_to_end(&mut payload)?;
    if read < len {
        return Err(CodecError::Truncated);
    }

    let mut nl = [0u8; 1];
    read_body(reader, &mut nl)?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(CodecError::CrcMismatch { expected, actual });
    }

    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Decode a single frame held entirely in `buf`.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    let mut cursor = buf;
    read_frame(&mut cursor)?.ok_or(CodecError::Truncated)
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}

fn read_body<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), CodecError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CodecError::Truncated),
        Err(e) => Err(CodecError::Io(e)),
    }
}
