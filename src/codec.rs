use std::fmt;

use thiserror::Error;
pub use tokio_modbus::{Address, Quantity};

/// 16-bit value stored in a Modbus register.
pub type Word = u16;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("expected {expected} registers for {ty}, got {actual}")]
    WordCount {
        ty: DataType,
        expected: Quantity,
        actual: usize,
    },
    #[error("value {value} cannot be encoded as {ty}")]
    TypeMismatch { ty: DataType, value: Value },
}

/// Register-backed data type. Multi-register types are packed in
/// big-endian word order, as all Alfen tables are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// UTF-8 string of up to the given number of bytes, zero-padded.
    Str(u16),
    U16,
    I16,
    U32,
    U64,
    F32,
    F64,
}

impl DataType {
    /// Number of registers a value of this type occupies.
    pub const fn quantity(self) -> Quantity {
        match self {
            DataType::Str(n_bytes) => (n_bytes + 1) / 2,
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::F32 => 2,
            DataType::U64 | DataType::F64 => 4,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Str(n_bytes) => write!(f, "str({n_bytes})"),
            DataType::U16 => write!(f, "u16"),
            DataType::I16 => write!(f, "i16"),
            DataType::U32 => write!(f, "u32"),
            DataType::U64 => write!(f, "u64"),
            DataType::F32 => write!(f, "f32"),
            DataType::F64 => write!(f, "f64"),
        }
    }
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    U16(u16),
    I16(i16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Value {
    /// Numeric view; `None` for strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Str(_) => None,
            Value::U16(v) => Some(f64::from(*v)),
            Value::I16(v) => Some(f64::from(*v)),
            Value::U32(v) => Some(f64::from(*v)),
            Value::U64(v) => Some(*v as f64),
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
        }
    }
}

/// Decode a numeric value from big-endian-ordered `Word`s.
pub trait Decode: Sized {
    fn from_be_words(words: &[Word]) -> Option<Self>;
}

macro_rules! impl_decode {
    ($num_type:ty) => {
        impl Decode for $num_type {
            fn from_be_words(words: &[Word]) -> Option<Self> {
                let bytes = words
                    .iter()
                    .copied()
                    .flat_map(u16::to_be_bytes)
                    .collect::<Vec<u8>>();
                let array = bytes.try_into().ok()?;
                Some(<$num_type>::from_be_bytes(array))
            }
        }
    };
}

impl_decode!(i16);
impl_decode!(u16);
impl_decode!(u32);
impl_decode!(u64);
impl_decode!(f32);
impl_decode!(f64);

/// Encode a numeric value into big-endian-ordered `Word`s.
pub trait Encode {
    fn to_be_words(self) -> Vec<Word>;
}

macro_rules! impl_encode {
    ($num_type:ty) => {
        impl Encode for $num_type {
            fn to_be_words(self) -> Vec<Word> {
                self.to_be_bytes()
                    .chunks(2)
                    .map(|chunk| {
                        let array = chunk.try_into().expect("unexpected encoding error");
                        u16::from_be_bytes(array)
                    })
                    .collect()
            }
        }
    };
}

impl_encode!(i16);
impl_encode!(u16);
impl_encode!(u32);
impl_encode!(u64);
impl_encode!(f32);
impl_encode!(f64);

/// Encode `value` as `ty` into `ty.quantity()` registers.
///
/// Over-long strings are truncated to the declared byte length (at a char
/// boundary) before encoding; they never spill into neighbouring fields.
pub fn encode(ty: DataType, value: &Value) -> Result<Vec<Word>, CodecError> {
    match (ty, value) {
        (DataType::Str(n_bytes), Value::Str(s)) => Ok(encode_str(s, n_bytes)),
        (DataType::U16, Value::U16(v)) => Ok(v.to_be_words()),
        (DataType::I16, Value::I16(v)) => Ok(v.to_be_words()),
        (DataType::U32, Value::U32(v)) => Ok(v.to_be_words()),
        (DataType::U64, Value::U64(v)) => Ok(v.to_be_words()),
        (DataType::F32, Value::F32(v)) => Ok(v.to_be_words()),
        (DataType::F64, Value::F64(v)) => Ok(v.to_be_words()),
        _ => Err(CodecError::TypeMismatch {
            ty,
            value: value.clone(),
        }),
    }
}

/// Decode `ty.quantity()` registers into a [`Value`].
///
/// The register count must match exactly; a short or long slice is a caller
/// contract violation, never zero-filled.
pub fn decode(ty: DataType, words: &[Word]) -> Result<Value, CodecError> {
    let expected = ty.quantity();
    if words.len() != expected as usize {
        return Err(CodecError::WordCount {
            ty,
            expected,
            actual: words.len(),
        });
    }
    let word_count_error = || CodecError::WordCount {
        ty,
        expected,
        actual: words.len(),
    };

    let value = match ty {
        DataType::Str(n_bytes) => Value::Str(decode_str(words, n_bytes)),
        DataType::U16 => Value::U16(words[0]),
        // Values >= 0x8000 reinterpreted as negative via two's complement.
        DataType::I16 => Value::I16(words[0] as i16),
        DataType::U32 => Value::U32(u32::from_be_words(words).ok_or_else(word_count_error)?),
        DataType::U64 => Value::U64(u64::from_be_words(words).ok_or_else(word_count_error)?),
        DataType::F32 => Value::F32(f32::from_be_words(words).ok_or_else(word_count_error)?),
        DataType::F64 => Value::F64(f64::from_be_words(words).ok_or_else(word_count_error)?),
    };
    Ok(value)
}

fn encode_str(s: &str, n_bytes: u16) -> Vec<Word> {
    let mut limit = (n_bytes as usize).min(s.len());
    while !s.is_char_boundary(limit) {
        limit -= 1;
    }
    let mut bytes = s.as_bytes()[..limit].to_vec();
    bytes.resize(DataType::Str(n_bytes).quantity() as usize * 2, 0);
    bytes
        .chunks(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect()
}

fn decode_str(words: &[Word], n_bytes: u16) -> String {
    let mut bytes = words
        .iter()
        .copied()
        .flat_map(u16::to_be_bytes)
        .collect::<Vec<u8>>();
    bytes.truncate(n_bytes as usize);
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
