//! LEB128 variable-length integer encoding, plus the length-prefixed byte
//! and string helpers the bundle wire forms are built from.

use crate::error::{Error, Result};

/// Encode an unsigned 64-bit integer as LEB128 into `buf`.
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a LEB128 unsigned 64-bit integer from `buf` starting at `*pos`.
/// Advances `*pos` past the consumed bytes.
pub fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        if *pos >= buf.len() {
            return Err(Error::decode("truncated varint"));
        }
        let byte = buf[*pos];
        *pos += 1;

        let payload = (byte & 0x7F) as u64;
        // shift must stay < 64 and the final payload must fit
        if shift >= 63 && payload > 1 {
            return Err(Error::decode("varint overflow"));
        }
        result |= payload << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Decode a varint and narrow it to `usize`, validating against `limit`
/// (typically a remaining-buffer length) so corrupt counts fail fast instead
/// of triggering huge allocations.
pub fn decode_count(buf: &[u8], pos: &mut usize, limit: usize) -> Result<usize> {
    let value = decode_varint(buf, pos)?;
    if value > limit as u64 {
        return Err(Error::decode(format!("count {} exceeds limit {}", value, limit)));
    }
    Ok(value as usize)
}

/// Encode a length-prefixed byte slice.
pub fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    encode_varint(bytes.len() as u64, buf);
    buf.extend_from_slice(bytes);
}

/// Decode a length-prefixed byte slice, advancing `*pos`.
pub fn decode_bytes<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = decode_count(buf, pos, buf.len() - *pos)?;
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

/// Encode a nul-terminated string. Fails if the string contains a nul byte.
pub fn encode_cstr(s: &str, buf: &mut Vec<u8>) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(Error::usage(format!("name contains a nul byte: {s:?}")));
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

/// Decode a nul-terminated UTF-8 string, advancing `*pos` past the
/// terminator.
pub fn decode_cstr<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a str> {
    let rest = &buf[*pos..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::decode("unterminated name"))?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|e| Error::decode(format!("name is not valid UTF-8: {e}")))?;
    *pos += nul + 1;
    Ok(s)
}
