//! Column encoding pipeline (BinaryCIF encodings).
//!
//! A column is a dense [`TypedArray`]. An [`Encoder`] is an ordered chain
//! of [`EncodingStep`]s; the output of step *k* is the input of step *k+1*
//! and the chain must terminate in a byte buffer. The result is an
//! [`EncodedData`]: the bytes plus the ordered list of [`Encoding`]
//! descriptors needed to reverse the chain (see [`decoder::decode`]).
//!
//! ## Data type codes
//!
//! ```text
//! Int8 = 1   Int16 = 2   Int32 = 3
//! Uint8 = 4  Uint16 = 5  Uint32 = 6
//! Float32 = 32           Float64 = 33
//! ```
//!
//! All multi-byte values are little-endian.

pub mod encoder;
pub mod decoder;
pub mod classifier;

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, ServerError};

pub use encoder::{CoordinatePrecision, Encoder, EncodingStep};
pub use decoder::decode;

// ============================================================================
// Data types
// ============================================================================

/// Element type of a typed array, serialized as its BinaryCIF code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Uint8,
    Uint16,
    Uint32,
    Float32,
    Float64,
}

impl DataType {
    pub fn code(self) -> i32 {
        match self {
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 3,
            DataType::Uint8 => 4,
            DataType::Uint16 => 5,
            DataType::Uint32 => 6,
            DataType::Float32 => 32,
            DataType::Float64 => 33,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(DataType::Int8),
            2 => Some(DataType::Int16),
            3 => Some(DataType::Int32),
            4 => Some(DataType::Uint8),
            5 => Some(DataType::Uint16),
            6 => Some(DataType::Uint32),
            32 => Some(DataType::Float32),
            33 => Some(DataType::Float64),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn byte_size(self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    pub fn is_signed_integer(self) -> bool {
        matches!(self, DataType::Int8 | DataType::Int16 | DataType::Int32)
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct CodeVisitor;

        impl<'de> Visitor<'de> for CodeVisitor {
            type Value = DataType;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a BinaryCIF data type code")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<DataType, E> {
                DataType::from_code(v)
                    .ok_or_else(|| E::custom(format!("unknown data type code {}", v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<DataType, E> {
                self.visit_i64(v as i64)
            }
        }

        deserializer.deserialize_i64(CodeVisitor)
    }
}

// ============================================================================
// Typed arrays
// ============================================================================

/// A dense column of values, one variant per element type.
///
/// `Str` holds `None` for rows whose value is not present; every numeric
/// variant stores a zero placeholder for such rows instead.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Str(Vec<Option<String>>),
}

macro_rules! read_le {
    ($bytes:expr, $t:ty, $n:expr) => {
        $bytes
            .chunks_exact($n)
            .map(|c| {
                let mut buf = [0u8; $n];
                buf.copy_from_slice(c);
                <$t>::from_le_bytes(buf)
            })
            .collect::<Vec<$t>>()
    };
}

impl TypedArray {
    pub fn len(&self) -> usize {
        match self {
            TypedArray::Int8(v) => v.len(),
            TypedArray::Int16(v) => v.len(),
            TypedArray::Int32(v) => v.len(),
            TypedArray::Uint8(v) => v.len(),
            TypedArray::Uint16(v) => v.len(),
            TypedArray::Uint32(v) => v.len(),
            TypedArray::Float32(v) => v.len(),
            TypedArray::Float64(v) => v.len(),
            TypedArray::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type, `None` for string arrays.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            TypedArray::Int8(_) => Some(DataType::Int8),
            TypedArray::Int16(_) => Some(DataType::Int16),
            TypedArray::Int32(_) => Some(DataType::Int32),
            TypedArray::Uint8(_) => Some(DataType::Uint8),
            TypedArray::Uint16(_) => Some(DataType::Uint16),
            TypedArray::Uint32(_) => Some(DataType::Uint32),
            TypedArray::Float32(_) => Some(DataType::Float32),
            TypedArray::Float64(_) => Some(DataType::Float64),
            TypedArray::Str(_) => None,
        }
    }

    /// Widen an integer array to i64. `None` for float and string arrays.
    pub fn to_i64(&self) -> Option<Vec<i64>> {
        match self {
            TypedArray::Int8(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TypedArray::Int16(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TypedArray::Int32(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TypedArray::Uint8(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TypedArray::Uint16(v) => Some(v.iter().map(|&x| x as i64).collect()),
            TypedArray::Uint32(v) => Some(v.iter().map(|&x| x as i64).collect()),
            _ => None,
        }
    }

    /// Widen any numeric array to f64. `None` for string arrays.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            TypedArray::Float32(v) => Some(v.iter().map(|&x| x as f64).collect()),
            TypedArray::Float64(v) => Some(v.clone()),
            TypedArray::Str(_) => None,
            other => other
                .to_i64()
                .map(|v| v.into_iter().map(|x| x as f64).collect()),
        }
    }

    /// Narrow i64 values into an array of the given type (wrapping, like a
    /// typed-array store).
    pub fn from_i64(data_type: DataType, values: Vec<i64>) -> TypedArray {
        let it = values.into_iter();
        match data_type {
            DataType::Int8 => TypedArray::Int8(it.map(|x| x as i8).collect()),
            DataType::Int16 => TypedArray::Int16(it.map(|x| x as i16).collect()),
            DataType::Int32 => TypedArray::Int32(it.map(|x| x as i32).collect()),
            DataType::Uint8 => TypedArray::Uint8(it.map(|x| x as u8).collect()),
            DataType::Uint16 => TypedArray::Uint16(it.map(|x| x as u16).collect()),
            DataType::Uint32 => TypedArray::Uint32(it.map(|x| x as u32).collect()),
            DataType::Float32 => TypedArray::Float32(it.map(|x| x as f32).collect()),
            DataType::Float64 => TypedArray::Float64(it.map(|x| x as f64).collect()),
        }
    }

    /// Store f64 values into an array of the given type, rounding for
    /// integer targets.
    pub fn from_f64(data_type: DataType, values: Vec<f64>) -> TypedArray {
        match data_type {
            DataType::Float32 => TypedArray::Float32(values.into_iter().map(|x| x as f32).collect()),
            DataType::Float64 => TypedArray::Float64(values),
            int_type => TypedArray::from_i64(
                int_type,
                values.into_iter().map(|x| x.round() as i64).collect(),
            ),
        }
    }

    /// Little-endian byte image. `None` for string arrays.
    pub fn to_le_bytes(&self) -> Option<Vec<u8>> {
        let bytes = match self {
            TypedArray::Int8(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TypedArray::Int16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TypedArray::Int32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TypedArray::Uint8(v) => v.clone(),
            TypedArray::Uint16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TypedArray::Uint32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TypedArray::Float32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TypedArray::Float64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TypedArray::Str(_) => return None,
        };
        Some(bytes)
    }

    /// Parse a little-endian byte image of the given type.
    pub fn from_le_bytes(data_type: DataType, bytes: &[u8]) -> Result<TypedArray> {
        if bytes.len() % data_type.byte_size() != 0 {
            return Err(ServerError::encode(format!(
                "{} bytes is not a whole number of {:?} elements",
                bytes.len(),
                data_type
            )));
        }

        Ok(match data_type {
            DataType::Int8 => TypedArray::Int8(bytes.iter().map(|&b| b as i8).collect()),
            DataType::Int16 => TypedArray::Int16(read_le!(bytes, i16, 2)),
            DataType::Int32 => TypedArray::Int32(read_le!(bytes, i32, 4)),
            DataType::Uint8 => TypedArray::Uint8(bytes.to_vec()),
            DataType::Uint16 => TypedArray::Uint16(read_le!(bytes, u16, 2)),
            DataType::Uint32 => TypedArray::Uint32(read_le!(bytes, u32, 4)),
            DataType::Float32 => TypedArray::Float32(read_le!(bytes, f32, 4)),
            DataType::Float64 => TypedArray::Float64(read_le!(bytes, f64, 8)),
        })
    }
}

// ============================================================================
// Encoding descriptors (wire format)
// ============================================================================

/// One reversible transform applied to a column, with the parameters the
/// decoder needs. Serialized as a map tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Encoding {
    ByteArray {
        #[serde(rename = "type")]
        data_type: DataType,
    },
    #[serde(rename_all = "camelCase")]
    FixedPoint { factor: f64, src_type: DataType },
    #[serde(rename_all = "camelCase")]
    IntervalQuantization {
        min: f64,
        max: f64,
        num_steps: i32,
        src_type: DataType,
    },
    #[serde(rename_all = "camelCase")]
    RunLength { src_type: DataType, src_size: i32 },
    #[serde(rename_all = "camelCase")]
    Delta { origin: i32, src_type: DataType },
    #[serde(rename_all = "camelCase")]
    IntegerPacking {
        byte_count: i32,
        is_unsigned: bool,
        src_size: i32,
    },
    #[serde(rename_all = "camelCase")]
    StringArray {
        data_encoding: Vec<Encoding>,
        string_data: String,
        offset_encoding: Vec<Encoding>,
        #[serde(with = "serde_bytes")]
        offsets: Vec<u8>,
    },
}

/// Sealed output of an encoder chain: bytes plus the chain that made them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedData {
    pub encoding: Vec<Encoding>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl EncodedData {
    /// Encoded payload size in bytes (excluding descriptors).
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}
