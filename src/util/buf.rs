use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        anyhow::bail!("length prefix {} exceeds remaining {} bytes", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn put_optional_bytes(buf: &mut impl BufMut, bytes: Option<&[u8]>) {
    match bytes {
        None => buf.put_u8(0),
        Some(bytes) => {
            buf.put_u8(1);
            put_bytes(buf, bytes);
        }
    }
}

pub fn try_get_optional_bytes(buf: &mut impl Buf) -> anyhow::Result<Option<Bytes>> {
    match buf.try_get_u8()? {
        0 => Ok(None),
        1 => Ok(Some(try_get_bytes(buf)?)),
        n => anyhow::bail!("invalid presence marker {}", n),
    }
}

pub fn try_get_array<const N: usize>(buf: &mut impl Buf) -> anyhow::Result<[u8; N]> {
    let mut result = [0u8; N];
    buf.try_copy_to_slice(&mut result)?;
    Ok(result)
}

/// Fixed-layout messages must be consumed completely
pub fn ensure_consumed(buf: &impl Buf) -> anyhow::Result<()> {
    if buf.has_remaining() {
        anyhow::bail!("{} unexpected trailing bytes", buf.remaining());
    }
    Ok(())
}
