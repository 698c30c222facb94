use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf_ext::BufExt;


/// The shapes a log variable or parameter can have on the wire. All values are little endian;
///  `F16` is an IEEE half-precision float that is kept as its raw bits.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ValueType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
}
impl ValueType {
    pub fn size(&self) -> usize {
        match self {
            ValueType::U8 | ValueType::I8 => 1,
            ValueType::U16 | ValueType::I16 | ValueType::F16 => 2,
            ValueType::U32 | ValueType::I32 | ValueType::F32 => 4,
            ValueType::U64 | ValueType::I64 | ValueType::F64 => 8,
        }
    }

    pub fn decode(&self, buf: &mut impl Buf) -> anyhow::Result<TocValue> {
        Ok(match self {
            ValueType::U8 => TocValue::U8(buf.try_read_u8()?),
            ValueType::U16 => TocValue::U16(buf.try_read_u16_le()?),
            ValueType::U32 => TocValue::U32(buf.try_read_u32_le()?),
            ValueType::U64 => TocValue::U64(buf.try_read_u64_le()?),
            ValueType::I8 => TocValue::I8(buf.try_read_i8()?),
            ValueType::I16 => TocValue::I16(buf.try_read_i16_le()?),
            ValueType::I32 => TocValue::I32(buf.try_read_i32_le()?),
            ValueType::I64 => TocValue::I64(buf.try_read_i64_le()?),
            ValueType::F16 => TocValue::F16(buf.try_read_u16_le()?),
            ValueType::F32 => TocValue::F32(buf.try_read_f32_le()?),
            ValueType::F64 => TocValue::F64(buf.try_read_f64_le()?),
        })
    }
}


#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TocValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    /// raw bits of a half-precision float
    F16(u16),
    F32(f32),
    F64(f64),
}
impl TocValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TocValue::U8(_) => ValueType::U8,
            TocValue::U16(_) => ValueType::U16,
            TocValue::U32(_) => ValueType::U32,
            TocValue::U64(_) => ValueType::U64,
            TocValue::I8(_) => ValueType::I8,
            TocValue::I16(_) => ValueType::I16,
            TocValue::I32(_) => ValueType::I32,
            TocValue::I64(_) => ValueType::I64,
            TocValue::F16(_) => ValueType::F16,
            TocValue::F32(_) => ValueType::F32,
            TocValue::F64(_) => ValueType::F64,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match *self {
            TocValue::U8(v) => buf.put_u8(v),
            TocValue::U16(v) => buf.put_u16_le(v),
            TocValue::U32(v) => buf.put_u32_le(v),
            TocValue::U64(v) => buf.put_u64_le(v),
            TocValue::I8(v) => buf.put_i8(v),
            TocValue::I16(v) => buf.put_i16_le(v),
            TocValue::I32(v) => buf.put_i32_le(v),
            TocValue::I64(v) => buf.put_i64_le(v),
            TocValue::F16(v) => buf.put_u16_le(v),
            TocValue::F32(v) => buf.put_f32_le(v),
            TocValue::F64(v) => buf.put_f64_le(v),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.value_type().size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// numeric value for display and arithmetic, with half-precision floats expanded
    pub fn as_f64(&self) -> f64 {
        match *self {
            TocValue::U8(v) => v as f64,
            TocValue::U16(v) => v as f64,
            TocValue::U32(v) => v as f64,
            TocValue::U64(v) => v as f64,
            TocValue::I8(v) => v as f64,
            TocValue::I16(v) => v as f64,
            TocValue::I32(v) => v as f64,
            TocValue::I64(v) => v as f64,
            TocValue::F16(bits) => f16_to_f64(bits),
            TocValue::F32(v) => v as f64,
            TocValue::F64(v) => v,
        }
    }
}
impl Display for TocValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            TocValue::U8(v) => write!(f, "{}", v),
            TocValue::U16(v) => write!(f, "{}", v),
            TocValue::U32(v) => write!(f, "{}", v),
            TocValue::U64(v) => write!(f, "{}", v),
            TocValue::I8(v) => write!(f, "{}", v),
            TocValue::I16(v) => write!(f, "{}", v),
            TocValue::I32(v) => write!(f, "{}", v),
            TocValue::I64(v) => write!(f, "{}", v),
            TocValue::F16(_) => write!(f, "{}", self.as_f64()),
            TocValue::F32(v) => write!(f, "{}", v),
            TocValue::F64(v) => write!(f, "{}", v),
        }
    }
}

fn f16_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let mantissa = (bits & 0x3ff) as f64;

    match exponent {
        0 => sign * mantissa * 2f64.powi(-24),
        0x1f if mantissa == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f64.powi(exponent - 15),
    }
}


/// Type codes of log variables, as announced in the log TOC
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum LogVarType {
    U8 = 1,
    U16 = 2,
    U32 = 3,
    I8 = 4,
    I16 = 5,
    I32 = 6,
    Float = 7,
    Fp16 = 8,
}
impl LogVarType {
    pub const ACCESS_FLAG: u8 = 0x10;

    pub fn value_type(&self) -> ValueType {
        match self {
            LogVarType::U8 => ValueType::U8,
            LogVarType::U16 => ValueType::U16,
            LogVarType::U32 => ValueType::U32,
            LogVarType::I8 => ValueType::I8,
            LogVarType::I16 => ValueType::I16,
            LogVarType::I32 => ValueType::I32,
            LogVarType::Float => ValueType::F32,
            LogVarType::Fp16 => ValueType::F16,
        }
    }
}

/// Type codes of parameters. The parameter TOC carries them in the low nibble of the type
///  byte, with additional flags in the high nibble.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ParamVarType {
    I8 = 0x00,
    I16 = 0x01,
    I32 = 0x02,
    I64 = 0x03,
    Fp16 = 0x05,
    Float = 0x06,
    Double = 0x07,
    U8 = 0x08,
    U16 = 0x09,
    U32 = 0x0A,
    U64 = 0x0B,
}
impl ParamVarType {
    pub const TYPE_MASK: u8 = 0x0f;
    pub const READ_ONLY_FLAG: u8 = 0x40;

    pub fn value_type(&self) -> ValueType {
        match self {
            ParamVarType::I8 => ValueType::I8,
            ParamVarType::I16 => ValueType::I16,
            ParamVarType::I32 => ValueType::I32,
            ParamVarType::I64 => ValueType::I64,
            ParamVarType::Fp16 => ValueType::F16,
            ParamVarType::Float => ValueType::F32,
            ParamVarType::Double => ValueType::F64,
            ParamVarType::U8 => ValueType::U8,
            ParamVarType::U16 => ValueType::U16,
            ParamVarType::U32 => ValueType::U32,
            ParamVarType::U64 => ValueType::U64,
        }
    }
}
