//! Framing for period table and index files.
//!
//! Every file starts with a six byte header naming its kind,
//! followed by checksummed frames:
//!
//! ```text
//! header: [magic "MSIM"][codec version: 1][kind: 1]
//! frame:  [codec version: 1][payload length: 4 LE][JSON payload][crc32: 4 LE]
//! ```
//!
//! Frames can be skipped without decoding their payload, which is how a table
//! file is scanned for its block offsets on open.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Seek, SeekFrom, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

const CODEC_VERSION: u8 = 1;

const MAGIC: [u8; 4] = *b"MSIM";

/// Largest payload accepted in one frame. A period block of a few million
/// rows stays well below it.
const MAX_PAYLOAD: u32 = 1 << 30;

const PREFIX_LEN: u64 = 5;
const CRC_LEN: u64 = 4;

/// What a file holds, recorded in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Table,
    Index,
}

impl FileKind {
    const fn tag(self) -> u8 {
        match self {
            Self::Table => b'T',
            Self::Index => b'I',
        }
    }
}

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Serializes `value` into one frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(value).map_err(|e| invalid(format!("cannot encode frame: {e}")))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD)
        .ok_or_else(|| invalid(format!("frame payload of {} bytes is too large", payload.len())))?;

    let mut frame = Vec::with_capacity(payload.len() + 9);
    frame.push(CODEC_VERSION);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(frame)
}

/// Reads a frame prefix, returning the payload length.
fn read_prefix(reader: &mut impl Read) -> IoResult<u32> {
    let mut prefix = [0u8; 5];
    reader.read_exact(&mut prefix)?;
    if prefix[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "frame written by codec version {}, this build reads {CODEC_VERSION}",
            prefix[0]
        )));
    }
    let len = u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]);
    if len > MAX_PAYLOAD {
        return Err(invalid(format!("frame payload of {len} bytes is too large")));
    }
    Ok(len)
}

/// Reads and checks one frame, then deserializes its payload.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let len = read_prefix(reader)?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;

    let mut crc = [0u8; 4];
    reader.read_exact(&mut crc)?;
    let stored = u32::from_le_bytes(crc);
    let actual = checksum(&payload);
    if stored != actual {
        return Err(invalid(format!(
            "frame checksum mismatch: stored {stored:08x}, computed {actual:08x}"
        )));
    }

    serde_json::from_slice(&payload).map_err(|e| invalid(format!("cannot decode frame: {e}")))
}

/// Moves past one frame without reading its payload, returning the frame
/// size. A frame running past the end of the stream is `UnexpectedEof`.
pub fn skip<R: Read + Seek>(reader: &mut R) -> IoResult<u64> {
    let start = reader.stream_position()?;
    let len = u64::from(read_prefix(reader)?);
    let end = start + PREFIX_LEN + len + CRC_LEN;
    if end > reader.seek(SeekFrom::End(0))? {
        return Err(IoError::new(ErrorKind::UnexpectedEof, "frame cut short"));
    }
    reader.seek(SeekFrom::Start(end))?;
    Ok(end - start)
}

pub fn write_header(writer: &mut impl Write, kind: FileKind) -> IoResult<()> {
    let mut header = [0u8; 6];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = CODEC_VERSION;
    header[5] = kind.tag();
    writer.write_all(&header)
}

/// Checks the header of a file expected to hold `kind`.
pub fn read_header(reader: &mut impl Read, kind: FileKind) -> IoResult<()> {
    let mut header = [0u8; 6];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(invalid("not a microsim file".to_string()));
    }
    if header[4] > CODEC_VERSION {
        return Err(invalid(format!(
            "file written by codec version {}, this build reads up to {CODEC_VERSION}",
            header[4]
        )));
    }
    if header[5] != kind.tag() {
        return Err(invalid(format!("expected a {kind:?} file")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Column;
    use std::io::Cursor;

    #[test]
    fn test_float_column_keeps_nan() {
        let frame = encode(&Column::Float(vec![1.5, f64::NAN])).unwrap();

        let decoded: Column = decode(&mut Cursor::new(frame)).unwrap();
        let values = decoded.as_floats().unwrap();
        assert!((values[0] - 1.5).abs() < f64::EPSILON);
        assert!(values[1].is_nan());
    }

    #[test]
    fn test_flipped_payload_byte_is_detected() {
        let mut frame = encode(&Column::Int(vec![1, 2, 3])).unwrap();
        frame[8] ^= 0x01;

        let err = decode::<Column>(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_length_is_rejected_before_reading() {
        let mut frame = vec![CODEC_VERSION];
        frame.extend_from_slice(&u32::MAX.to_le_bytes());

        let err = decode::<Column>(&mut Cursor::new(frame)).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_skip_lands_on_next_frame() {
        let mut buf = encode(&Column::Int(vec![1, 2, 3])).unwrap();
        let first = buf.len() as u64;
        buf.extend(encode(&7i64).unwrap());

        let mut cursor = Cursor::new(buf);
        assert_eq!(skip(&mut cursor).unwrap(), first);
        assert_eq!(decode::<i64>(&mut cursor).unwrap(), 7);
    }

    #[test]
    fn test_skip_reports_cut_frame() {
        let mut buf = encode(&Column::Bool(vec![true, false])).unwrap();
        buf.truncate(buf.len() - 3);
        let err = skip(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_header_checks_file_kind() {
        let mut buf = Vec::new();
        write_header(&mut buf, FileKind::Index).unwrap();
        assert_eq!(buf.len(), 6);

        assert!(read_header(&mut Cursor::new(&buf), FileKind::Index).is_ok());
        let err = read_header(&mut Cursor::new(&buf), FileKind::Table).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
