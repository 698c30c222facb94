use anyhow::anyhow;


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}


/// Checked reads for the little-endian, mostly fixed-width data the Crazyflie puts on the wire.
pub trait BufExt: bytes::Buf {
    get_try_impl!(try_read_u8, u8, get_u8);
    get_try_impl!(try_read_u16_le, u16, get_u16_le);
    get_try_impl!(try_read_u32_le, u32, get_u32_le);
    get_try_impl!(try_read_u64_le, u64, get_u64_le);

    get_try_impl!(try_read_i8, i8, get_i8);
    get_try_impl!(try_read_i16_le, i16, get_i16_le);
    get_try_impl!(try_read_i32_le, i32, get_i32_le);
    get_try_impl!(try_read_i64_le, i64, get_i64_le);

    get_try_impl!(try_read_f32_le, f32, get_f32_le);
    get_try_impl!(try_read_f64_le, f64, get_f64_le);

    /// Reads either a single byte or a u16 LE, depending on the protocol generation. TOC indices
    ///  and parameter ids are one byte wide in the first protocol generation and two bytes in v2.
    fn try_read_id(&mut self, wide: bool) -> anyhow::Result<u16> {
        if wide {
            self.try_read_u16_le()
        }
        else {
            Ok(self.try_read_u8()?.into())
        }
    }

    /// Reads a null-terminated string. The firmware sends ISO-8859-1, which maps byte-for-byte
    ///  onto the first 256 code points. A missing terminator at the end of the buffer is tolerated.
    fn try_read_cstring(&mut self) -> anyhow::Result<String> {
        let mut result = String::new();
        while self.has_remaining() {
            match self.get_u8() {
                0 => return Ok(result),
                b => result.push(b as char),
            }
        }
        if result.is_empty() {
            return Err(anyhow!("buffer underflow"));
        }
        Ok(result)
    }

    /// reads a string written by [BufMutExt::put_string]
    fn try_read_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_read_u16_le()? as usize;
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow"));
        }
        let mut buf = vec![0u8; len];
        self.copy_to_slice(&mut buf);
        Ok(String::from_utf8(buf)?)
    }
}

pub trait BufMutExt: bytes::BufMut {
    fn put_id(&mut self, id: u16, wide: bool) {
        if wide {
            self.put_u16_le(id);
        }
        else {
            self.put_u8((id & 0xff) as u8);
        }
    }

    fn put_string(&mut self, s: &str) {
        self.put_u16_le(s.len() as u16); //TODO reject strings longer than u16::MAX
        self.put_slice(s.as_bytes());
    }
}


impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}
