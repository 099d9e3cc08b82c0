//! Integer codecs for C types without a dedicated semantic type

use super::{Codec, CodecContext, TypeKey};
use crate::error::{config_error, Result};
use crate::layout::SemanticType;
use crate::logging::log_codec_conversion;
use crate::value::{CustomValue, Value};

pub const UINT8: TypeKey = TypeKey::from_static("uint8");
pub const UINT16: TypeKey = TypeKey::from_static("uint16");
pub const UINT32: TypeKey = TypeKey::from_static("uint32");
pub const SIZE_T: TypeKey = TypeKey::from_static("size_t");
pub const OFF_T: TypeKey = TypeKey::from_static("off_t");

/// Fixed-width integer carried as a custom value
///
/// Unsigned codecs hold a `u64` payload, signed ones an `i64`. Values are
/// range-checked on the way out and masked on the way in.
#[derive(Debug, Clone)]
pub struct IntegerCodec {
    key: TypeKey,
    bits: u32,
    signed: bool,
}

impl IntegerCodec {
    pub fn new(key: TypeKey, bits: u32, signed: bool) -> Self {
        debug_assert!(matches!(bits, 8 | 16 | 32 | 64));
        Self { key, bits, signed }
    }

    pub fn uint8() -> Self {
        Self::new(UINT8, 8, false)
    }

    pub fn uint16() -> Self {
        Self::new(UINT16, 16, false)
    }

    pub fn uint32() -> Self {
        Self::new(UINT32, 32, false)
    }

    /// Pointer-width unsigned
    pub fn size_t() -> Self {
        Self::new(SIZE_T, usize::BITS, false)
    }

    /// 64-bit signed file offset
    pub fn off_t() -> Self {
        Self::new(OFF_T, 64, true)
    }

    pub fn builtins() -> Vec<Self> {
        vec![
            Self::uint8(),
            Self::uint16(),
            Self::uint32(),
            Self::size_t(),
            Self::off_t(),
        ]
    }

    #[inline]
    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    /// A host value of this codec's type
    pub fn value(&self, n: i128) -> Result<Value> {
        self.check_range(n)?;
        Ok(self.wrap(n))
    }

    fn wrap(&self, n: i128) -> Value {
        if self.signed {
            Value::Custom(CustomValue::new(self.key.clone(), n as i64))
        } else {
            Value::Custom(CustomValue::new(self.key.clone(), n as u64))
        }
    }

    fn range(&self) -> (i128, i128) {
        if self.signed {
            let half = 1i128 << (self.bits - 1);
            (-half, half - 1)
        } else {
            (0, (1i128 << self.bits) - 1)
        }
    }

    fn check_range(&self, n: i128) -> Result<()> {
        let (min, max) = self.range();
        if n < min || n > max {
            return Err(config_error!("{n} is out of range for {}", self.key));
        }
        Ok(())
    }

    fn payload(&self, value: &Value) -> Result<i128> {
        match value {
            Value::Custom(custom) if custom.key() == &self.key => custom
                .downcast_ref::<u64>()
                .map(|v| i128::from(*v))
                .or_else(|| custom.downcast_ref::<i64>().map(|v| i128::from(*v)))
                .ok_or_else(|| config_error!("{} value does not carry an integer", self.key)),
            other => other
                .as_i64()
                .map(i128::from)
                .ok_or_else(|| config_error!("expected {} value, found {other:?}", self.key)),
        }
    }
}

impl Codec for IntegerCodec {
    fn native_type(&self) -> SemanticType {
        match self.bits {
            8 => SemanticType::Int8,
            16 => SemanticType::Int16,
            32 => SemanticType::Int32,
            _ => SemanticType::Int64,
        }
    }

    fn to_native(&self, value: &Value, _ctx: CodecContext<'_>) -> Result<Value> {
        let n = self.payload(value)?;
        self.check_range(n)?;
        log_codec_conversion(self.key.as_str(), "to_native");
        // Truncating casts keep the two's complement bit pattern
        Ok(match self.bits {
            8 => Value::Int8(n as i8),
            16 => Value::Int16(n as i16),
            32 => Value::Int32(n as i32),
            _ => Value::Int64(n as i64),
        })
    }

    fn from_native(&self, raw: Value, _ctx: CodecContext<'_>) -> Result<Value> {
        let bits = raw
            .as_i64()
            .ok_or_else(|| config_error!("expected integer for {}, found {raw:?}", self.key))?;
        log_codec_conversion(self.key.as_str(), "from_native");
        let n = if self.signed {
            i128::from(bits)
        } else if self.bits == 64 {
            i128::from(bits as u64)
        } else {
            i128::from((bits as u64) & ((1u64 << self.bits) - 1))
        };
        Ok(self.wrap(n))
    }

    fn default_value(&self) -> Value {
        self.wrap(0)
    }
}
