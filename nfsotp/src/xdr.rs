/// This module implements helper traits for packing and unpacking
/// data in the XDR format (RFC 4506): big-endian 32-bit words, with
/// variable-length data prefixed by its length and zero padded to a
/// 4-byte boundary.
use crate::result::{Error, Result};
use bytes::{Buf, BufMut, Bytes};

const PAD_ZERO: [u8; 4] = [0; 4];

#[inline]
const fn pad_len(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// A trait for packing data in XDR format into a buffer.
pub trait Packer {
    fn pack_uint(&mut self, value: u32);

    fn pack_bool(&mut self, value: bool);

    fn pack_opaque(&mut self, value: &[u8]);

    fn pack_opaque_fixed(&mut self, value: &[u8]);

    fn pack_string(&mut self, value: &str);

    fn pack_array<I, F>(&mut self, array: &[I], pack_fn: F)
    where
        F: Fn(&mut Self, &I),
    {
        self.pack_uint(array.len() as u32);
        for item in array {
            pack_fn(self, item);
        }
    }
}

impl<Buffer: BufMut> Packer for Buffer {
    #[inline]
    fn pack_uint(&mut self, value: u32) {
        self.put_u32(value)
    }

    #[inline]
    fn pack_bool(&mut self, value: bool) {
        self.put_u32(value as u32)
    }

    #[inline]
    fn pack_opaque(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.pack_opaque_fixed(value);
    }

    #[inline]
    fn pack_opaque_fixed(&mut self, value: &[u8]) {
        self.put_slice(value);
        self.put_slice(&PAD_ZERO[..pad_len(value.len())])
    }

    #[inline]
    fn pack_string(&mut self, value: &str) {
        self.pack_opaque(value.as_bytes())
    }
}

/// A trait for unpacking XDR from a buffer.
///
/// Every method checks the remaining length first, so truncated or
/// lying input yields `Error::Decode` instead of a panic.
pub trait Unpacker {
    fn unpack_uint(&mut self) -> Result<u32>;

    #[inline]
    fn unpack_bool(&mut self) -> Result<bool> {
        match self.unpack_uint()? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(Error::decode(format!("invalid bool {}", n))),
        }
    }

    fn unpack_opaque(&mut self) -> Result<Bytes>;

    fn unpack_opaque_fixed(&mut self, nbytes: usize) -> Result<Bytes>;

    fn unpack_string(&mut self) -> Result<String> {
        let bytes = self.unpack_opaque()?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn unpack_vec<I, F>(&mut self, unpack_fn: F) -> Result<Vec<I>>
    where
        F: Fn(&mut Self) -> Result<I>;
}

impl<Buffer: Buf> Unpacker for Buffer {
    #[inline]
    fn unpack_uint(&mut self) -> Result<u32> {
        if self.remaining() >= 4 {
            Ok(self.get_u32())
        } else {
            Err(Error::decode(format!(
                "need 4 bytes for uint, {} remaining",
                self.remaining()
            )))
        }
    }

    #[inline]
    fn unpack_opaque(&mut self) -> Result<Bytes> {
        let len = self.unpack_uint()? as usize;
        self.unpack_opaque_fixed(len)
    }

    #[inline]
    fn unpack_opaque_fixed(&mut self, nbytes: usize) -> Result<Bytes> {
        let padded = nbytes + pad_len(nbytes);
        if self.remaining() < padded {
            return Err(Error::decode(format!(
                "opaque of {} bytes exceeds the {} remaining",
                nbytes,
                self.remaining()
            )));
        }

        let ret = self.copy_to_bytes(nbytes);
        self.advance(padded - nbytes);
        Ok(ret)
    }

    fn unpack_vec<I, F>(&mut self, unpack_fn: F) -> Result<Vec<I>>
    where
        F: Fn(&mut Self) -> Result<I>,
    {
        let len = self.unpack_uint()? as usize;
        // every element occupies at least one word
        if len > self.remaining() / 4 {
            return Err(Error::decode(format!(
                "array of {} elements exceeds the {} bytes remaining",
                len,
                self.remaining()
            )));
        }

        let mut result = Vec::with_capacity(len);
        for _ in 0..len {
            result.push(unpack_fn(self)?);
        }

        Ok(result)
    }
}

/// Trait that allows packing objects into a buffer.
pub trait PackTo<B> {
    /// Pack `self` into `buf`
    fn pack_to(&self, buf: &mut B);
}

/// Trait that allows unpacking objects from a buffer
pub trait UnpackFrom<B> {
    fn unpack_from(buf: &mut B) -> Result<Self>
    where
        Self: Sized;
}

impl<B: Packer> PackTo<B> for u32 {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_uint(*self)
    }
}

impl<B: Packer> PackTo<B> for bool {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_bool(*self)
    }
}

impl<B: Packer> PackTo<B> for &str {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_string(self)
    }
}

impl<B: Packer> PackTo<B> for String {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_string(self)
    }
}

impl<B: Packer> PackTo<B> for Bytes {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_opaque(self.as_ref())
    }
}

/// Procedures without arguments
impl<B> PackTo<B> for () {
    fn pack_to(&self, _buf: &mut B) {}
}

// Note: explicitly NOT implemented for u8.  XDR has no "byte" type, a
// byte string is always `opaque` and is carried here as `Bytes`.
impl<T: PackTo<B>, B: Packer> PackTo<B> for Vec<T> {
    fn pack_to(&self, buf: &mut B) {
        buf.pack_uint(self.len() as u32);
        for item in self.iter() {
            item.pack_to(buf);
        }
    }
}

impl<B: Unpacker> UnpackFrom<B> for u32 {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        buf.unpack_uint()
    }
}

impl<B: Unpacker> UnpackFrom<B> for bool {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        buf.unpack_bool()
    }
}

impl<B: Unpacker> UnpackFrom<B> for Bytes {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        buf.unpack_opaque()
    }
}

impl<B: Unpacker> UnpackFrom<B> for String {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        buf.unpack_string()
    }
}

impl<T: UnpackFrom<B>, B: Unpacker> UnpackFrom<B> for Vec<T> {
    fn unpack_from(buf: &mut B) -> Result<Self> {
        buf.unpack_vec(|buf| T::unpack_from(buf))
    }
}
