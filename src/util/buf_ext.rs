use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::util::byte_order::{from_minimal_le, to_minimal_le, MAX_MINIMAL_LEN};


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow::anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}


/// Checked streaming readers: unlike the [Buf] getters, these return an error instead of
///  panicking when the buffer is exhausted, which is what we want for data received from peers.
pub trait BufExt: Buf {
    get_try_impl!(try_get_u8, u8, get_u8);

    get_try_impl!(try_get_u16_le, u16, get_u16_le);
    get_try_impl!(try_get_u32_le, u32, get_u32_le);
    get_try_impl!(try_get_u64_le, u64, get_u64_le);
    get_try_impl!(try_get_i16_le, i16, get_i16_le);

    get_try_impl!(try_get_u16_be, u16, get_u16);
    get_try_impl!(try_get_u32_be, u32, get_u32);
    get_try_impl!(try_get_u64_be, u64, get_u64);

    fn try_get_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            bail!("buffer underflow");
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    /// reads a minimally encoded value that occupies exactly `len` bytes
    fn try_get_minimal_le(&mut self, len: usize) -> anyhow::Result<u64> {
        if len > MAX_MINIMAL_LEN || self.remaining() < len {
            bail!("buffer underflow or invalid length {} for a minimally encoded value", len);
        }
        let mut raw = [0u8; MAX_MINIMAL_LEN];
        self.copy_to_slice(&mut raw[..len]);
        from_minimal_le(&raw[..len])
    }

    /// Reads bytes up to (and consuming) a NUL terminator. If there is no terminator, the rest of
    ///  the buffer is returned.
    fn get_null_terminated(&mut self) -> Vec<u8> {
        let mut result = Vec::new();
        while self.has_remaining() {
            match self.get_u8() {
                0 => break,
                b => result.push(b),
            }
        }
        result
    }
}

pub trait BufMutExt: BufMut {
    /// writes the minimal encoding of a value, returning the number of bytes written
    fn put_minimal_le(&mut self, value: u64) -> usize {
        let encoded = to_minimal_le(value);
        self.put_slice(&encoded);
        encoded.len()
    }
}


impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
