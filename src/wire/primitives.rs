//! Hand-rolled primitive encoding for the control-plane wire format.
//!
//! Little-endian integers, IEEE-754 floats, UTF-8 strings prefixed by a
//! `u32` length, sequences prefixed by a `u32` count, `bool` as `u8`,
//! optionals as `u8 present || payload`. Kept hand-rolled (rather than
//! delegated to `serde`/`bincode`) so that per-field version-skip behaviour
//! (§4.2) stays fully under our control.

use bytes::{Buf, BufMut};

use crate::error::{Error, ErrorKind, Result};

fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(Error::msg(
            ErrorKind::Protocol,
            format!("truncated frame: need {} bytes, have {}", n, buf.len()),
        ));
    }
    Ok(())
}

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.put_u8(v);
}

pub fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn put_bool(out: &mut Vec<u8>, v: bool) {
    out.put_u8(v as u8);
}

pub fn get_bool(buf: &mut &[u8]) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.put_u32_le(v);
}

pub fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.put_u64_le(v);
}

pub fn get_u64(buf: &mut &[u8]) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.put_i64_le(v);
}

pub fn get_i64(buf: &mut &[u8]) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64_le())
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.put_u16_le(v);
}

pub fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn put_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_u32(out, v.len() as u32);
    out.put_slice(v);
}

pub fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    let mut dst = vec![0u8; len];
    buf.copy_to_slice(&mut dst);
    Ok(dst)
}

pub fn put_str(out: &mut Vec<u8>, v: &str) {
    put_bytes(out, v.as_bytes());
}

pub fn get_str(buf: &mut &[u8]) -> Result<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes).map_err(|e| Error::wrapped(ErrorKind::Protocol, e))
}

pub fn put_vec<T>(out: &mut Vec<u8>, items: &[T], mut put_item: impl FnMut(&mut Vec<u8>, &T)) {
    put_u32(out, items.len() as u32);
    for item in items {
        put_item(out, item);
    }
}

pub fn get_vec<T>(
    buf: &mut &[u8],
    mut get_item: impl FnMut(&mut &[u8]) -> Result<T>,
) -> Result<Vec<T>> {
    let count = get_u32(buf)? as usize;
    let mut items = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        items.push(get_item(buf)?);
    }
    Ok(items)
}

pub fn put_option<T>(out: &mut Vec<u8>, v: &Option<T>, put_item: impl FnOnce(&mut Vec<u8>, &T)) {
    match v {
        Some(item) => {
            put_bool(out, true);
            put_item(out, item);
        }
        None => put_bool(out, false),
    }
}

pub fn get_option<T>(
    buf: &mut &[u8],
    get_item: impl FnOnce(&mut &[u8]) -> Result<T>,
) -> Result<Option<T>> {
    if get_bool(buf)? {
        Ok(Some(get_item(buf)?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_primitives() {
        let mut out = Vec::new();
        put_u32(&mut out, 0xdead_beef);
        put_str(&mut out, "hello");
        put_vec(&mut out, &[1u64, 2, 3], |o, v| put_u64(o, *v));
        put_option(&mut out, &Some(42i64), |o, v| put_i64(o, *v));

        let mut cur = &out[..];
        assert_eq!(get_u32(&mut cur).unwrap(), 0xdead_beef);
        assert_eq!(get_str(&mut cur).unwrap(), "hello");
        assert_eq!(
            get_vec(&mut cur, |b| get_u64(b)).unwrap(),
            vec![1u64, 2, 3]
        );
        assert_eq!(get_option(&mut cur, |b| get_i64(b)).unwrap(), Some(42));
        assert!(cur.is_empty());
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut cur = &[1u8, 2][..];
        assert!(get_u32(&mut cur).is_err());
    }
}
