//! Little-endian primitives shared by the wire codec and the node metadata
//! layout. Writers append to a growable buffer; readers take a slice and
//! return the parsed value together with the remainder, so callers advance
//! the cursor by rebinding.

use crate::{DinoError, DinoResult};

pub fn put8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn put16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Writes a u16 length prefix followed by the raw bytes. Lengths are
/// truncated to 16 bits, same as the wire format mandates.
pub fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    put16(buf, v.len() as u16);
    buf.extend_from_slice(v);
}

pub fn put_str(buf: &mut Vec<u8>, v: &str) {
    put_bytes(buf, v.as_bytes());
}

pub fn get8(b: &[u8]) -> DinoResult<(u8, &[u8])> {
    if b.is_empty() {
        return Err(DinoError::Underflow("u8".to_string()));
    }
    Ok((b[0], &b[1..]))
}

pub fn get16(b: &[u8]) -> DinoResult<(u16, &[u8])> {
    if b.len() < 2 {
        return Err(DinoError::Underflow("u16".to_string()));
    }
    Ok((u16::from_le_bytes([b[0], b[1]]), &b[2..]))
}

pub fn get32(b: &[u8]) -> DinoResult<(u32, &[u8])> {
    if b.len() < 4 {
        return Err(DinoError::Underflow("u32".to_string()));
    }
    Ok((u32::from_le_bytes([b[0], b[1], b[2], b[3]]), &b[4..]))
}

pub fn get64(b: &[u8]) -> DinoResult<(u64, &[u8])> {
    if b.len() < 8 {
        return Err(DinoError::Underflow("u64".to_string()));
    }
    Ok((
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        &b[8..],
    ))
}

pub fn get_bytes(b: &[u8]) -> DinoResult<(Vec<u8>, &[u8])> {
    let (n, b) = get16(b)?;
    let n = n as usize;
    if b.len() < n {
        return Err(DinoError::Underflow(format!(
            "byte slice of length {}",
            n
        )));
    }
    Ok((b[..n].to_vec(), &b[n..]))
}

pub fn get_str(b: &[u8]) -> DinoResult<(String, &[u8])> {
    let (bytes, rest) = get_bytes(b)?;
    let s = String::from_utf8(bytes)
        .map_err(|e| DinoError::DecodeError(format!("invalid utf-8 string: {}", e)))?;
    Ok((s, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_round_trip() {
        let mut buf = Vec::new();
        put8(&mut buf, 0xab);
        put16(&mut buf, 0xcdef);
        put32(&mut buf, 0xdead_beef);
        put64(&mut buf, 0x0123_4567_89ab_cdef);
        let b = &buf[..];
        let (v8, b) = get8(b).unwrap();
        let (v16, b) = get16(b).unwrap();
        let (v32, b) = get32(b).unwrap();
        let (v64, b) = get64(b).unwrap();
        assert_eq!(v8, 0xab);
        assert_eq!(v16, 0xcdef);
        assert_eq!(v32, 0xdead_beef);
        assert_eq!(v64, 0x0123_4567_89ab_cdef);
        assert!(b.is_empty());
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = Vec::new();
        put16(&mut buf, 0x0102);
        assert_eq!(buf, vec![0x02, 0x01]);
    }

    #[test]
    fn test_length_prefixed_round_trip() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"hello");
        put_str(&mut buf, "world");
        put_bytes(&mut buf, b"");
        let b = &buf[..];
        let (v, b) = get_bytes(b).unwrap();
        assert_eq!(v, b"hello");
        let (s, b) = get_str(b).unwrap();
        assert_eq!(s, "world");
        let (empty, b) = get_bytes(b).unwrap();
        assert!(empty.is_empty());
        assert!(b.is_empty());
    }

    #[test]
    fn test_short_input_underflows() {
        assert!(matches!(get64(&[1, 2, 3]), Err(DinoError::Underflow(_))));
        let mut buf = Vec::new();
        put16(&mut buf, 10);
        buf.extend_from_slice(b"abc");
        assert!(matches!(get_bytes(&buf), Err(DinoError::Underflow(_))));
    }
}
