//! Bounds-checked reads over a byte cursor

use crate::error::{Error, Result};
use bytes::Buf;

/// Fail with [`Error::Truncated`] unless `n` bytes remain.
pub(crate) fn ensure(buf: &[u8], n: usize, what: &'static str) -> Result<()> {
    if buf.len() < n {
        return Err(Error::truncated(what, n, buf.len()));
    }
    Ok(())
}

pub(crate) fn read_u8(buf: &mut &[u8], what: &'static str) -> Result<u8> {
    ensure(*buf, 1, what)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut &[u8], what: &'static str) -> Result<u16> {
    ensure(*buf, 2, what)?;
    Ok(buf.get_u16())
}

pub(crate) fn read_u32(buf: &mut &[u8], what: &'static str) -> Result<u32> {
    ensure(*buf, 4, what)?;
    Ok(buf.get_u32())
}

pub(crate) fn read_u64(buf: &mut &[u8], what: &'static str) -> Result<u64> {
    ensure(*buf, 8, what)?;
    Ok(buf.get_u64())
}

pub(crate) fn read_array<const N: usize>(buf: &mut &[u8], what: &'static str) -> Result<[u8; N]> {
    ensure(*buf, N, what)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}
