//! Offset-based conversions between fixed width integers and their byte representations.
//!
//! The overlay protocol is little endian almost everywhere (header length, pong and push fields,
//!  identifier windows), with a few big endian fields in the extension blocks. All readers widen
//!  bytes as unsigned values: a byte `0xFF` is 255, never -1.
//!
//! The accessors index into the slice directly, so they panic if the slice is too short - callers
//!  work on fixed layouts whose length was validated up front. For reading from an untrusted
//!  stream of bytes, use [crate::util::buf_ext::BufExt] instead.

use anyhow::bail;

macro_rules! at_impl {
    ($getter: ident, $putter: ident, $ty: ty, $from: ident, $to: ident) => {
        pub fn $getter(buf: &[u8], offset: usize) -> $ty {
            let mut raw = [0u8; size_of::<$ty>()];
            raw.copy_from_slice(&buf[offset..offset + size_of::<$ty>()]);
            <$ty>::$from(raw)
        }

        pub fn $putter(buf: &mut [u8], offset: usize, value: $ty) {
            buf[offset..offset + size_of::<$ty>()].copy_from_slice(&value.$to());
        }
    }
}

at_impl!(u16_le_at, put_u16_le_at, u16, from_le_bytes, to_le_bytes);
at_impl!(u32_le_at, put_u32_le_at, u32, from_le_bytes, to_le_bytes);
at_impl!(u64_le_at, put_u64_le_at, u64, from_le_bytes, to_le_bytes);
at_impl!(i16_le_at, put_i16_le_at, i16, from_le_bytes, to_le_bytes);

at_impl!(u16_be_at, put_u16_be_at, u16, from_be_bytes, to_be_bytes);
at_impl!(u32_be_at, put_u32_be_at, u32, from_be_bytes, to_be_bytes);
at_impl!(u64_be_at, put_u64_be_at, u64, from_be_bytes, to_be_bytes);

/// The maximum number of bytes in a minimal encoding
pub const MAX_MINIMAL_LEN: usize = size_of::<u64>();

/// Returns the number of bytes [to_minimal_le] produces for a value: between 1 and 8, zero
///  being encoded as a single zero byte.
pub fn minimal_len(value: u64) -> usize {
    let significant_bits = u64::BITS - value.leading_zeros();
    (significant_bits.div_ceil(8) as usize).max(1)
}

/// Encodes a value in the fewest little endian bytes that can represent it.
pub fn to_minimal_le(value: u64) -> Vec<u8> {
    value.to_le_bytes()[..minimal_len(value)].to_vec()
}

/// Inverse of [to_minimal_le]. Trailing zero bytes are accepted, so a fixed width little endian
///  value of up to eight bytes decodes as well.
pub fn from_minimal_le(bytes: &[u8]) -> anyhow::Result<u64> {
    if bytes.is_empty() {
        bail!("minimal encoding must have at least one byte");
    }
    if bytes.len() > MAX_MINIMAL_LEN {
        bail!("minimal encoding has {} bytes, at most {} are allowed", bytes.len(), MAX_MINIMAL_LEN);
    }

    let mut raw = [0u8; MAX_MINIMAL_LEN];
    raw[..bytes.len()].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}
