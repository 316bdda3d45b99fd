//! Reverse of [`Encoder::encode`](super::Encoder::encode).
//!
//! Used by the tests and by clients that want to check a payload; the
//! server itself never decodes.

use super::encoder::packing_limits;
use super::{DataType, EncodedData, Encoding, TypedArray};
use crate::error::{Result, ServerError};

/// Decode an encoded column back into a typed array.
pub fn decode(encoded: &EncodedData) -> Result<TypedArray> {
    decode_chain(&encoded.encoding, &encoded.data)
}

enum Stage {
    Bytes(Vec<u8>),
    Array(TypedArray),
}

fn decode_chain(encodings: &[Encoding], data: &[u8]) -> Result<TypedArray> {
    let mut stage = Stage::Bytes(data.to_vec());

    for encoding in encodings.iter().rev() {
        stage = match (encoding, stage) {
            (Encoding::ByteArray { data_type }, Stage::Bytes(bytes)) => {
                Stage::Array(TypedArray::from_le_bytes(*data_type, &bytes)?)
            }
            (
                Encoding::StringArray {
                    data_encoding,
                    string_data,
                    offset_encoding,
                    offsets,
                },
                Stage::Bytes(bytes),
            ) => Stage::Array(decode_strings(
                data_encoding,
                string_data,
                offset_encoding,
                offsets,
                &bytes,
            )?),
            (Encoding::FixedPoint { factor, src_type }, Stage::Array(array)) => {
                let values = require_f64(&array, "FixedPoint")?;
                Stage::Array(TypedArray::from_f64(
                    *src_type,
                    values.into_iter().map(|v| v / factor).collect(),
                ))
            }
            (
                Encoding::IntervalQuantization { min, max, num_steps, src_type },
                Stage::Array(array),
            ) => {
                let values = require_f64(&array, "IntervalQuantization")?;
                if *num_steps < 2 {
                    return Err(ServerError::encode(format!(
                        "IntervalQuantization needs at least 2 steps, got {}",
                        num_steps
                    )));
                }
                let step = (max - min) / (*num_steps - 1) as f64;
                Stage::Array(TypedArray::from_f64(
                    *src_type,
                    values.into_iter().map(|v| min + step * v).collect(),
                ))
            }
            (Encoding::RunLength { src_type, src_size }, Stage::Array(array)) => {
                let pairs = require_i64(&array, "RunLength")?;
                let expected = declared_size(*src_size, "RunLength")?;
                let mut output = Vec::with_capacity(expected.min(pairs.len() / 2));
                for pair in pairs.chunks_exact(2) {
                    let count = usize::try_from(pair[1].max(0)).unwrap_or(usize::MAX);
                    if count > expected - output.len() {
                        return Err(ServerError::encode(format!(
                            "RunLength expands past the declared {} values",
                            expected
                        )));
                    }
                    output.extend(std::iter::repeat(pair[0]).take(count));
                }
                if output.len() != expected {
                    return Err(ServerError::encode(format!(
                        "RunLength expanded to {} values, expected {}",
                        output.len(),
                        src_size
                    )));
                }
                Stage::Array(TypedArray::from_i64(*src_type, output))
            }
            (Encoding::Delta { origin, src_type }, Stage::Array(array)) => {
                let deltas = require_i64(&array, "Delta")?;
                let mut output = Vec::with_capacity(deltas.len());
                let mut current = *origin as i64;
                for (i, d) in deltas.into_iter().enumerate() {
                    if i > 0 {
                        current = current
                            .checked_add(d)
                            .ok_or_else(|| ServerError::encode("Delta overflows a 64-bit accumulator"))?;
                    }
                    output.push(current);
                }
                Stage::Array(TypedArray::from_i64(*src_type, output))
            }
            (
                Encoding::IntegerPacking { byte_count, is_unsigned, src_size },
                Stage::Array(array),
            ) => {
                let packed = require_i64(&array, "IntegerPacking")?;
                let (upper, lower) = packing_limits(*byte_count, *is_unsigned);
                let expected = declared_size(*src_size, "IntegerPacking")?;
                let mut output = Vec::with_capacity(expected.min(packed.len()));
                let mut acc = 0i64;
                for value in packed {
                    acc = acc
                        .checked_add(value)
                        .ok_or_else(|| ServerError::encode("IntegerPacking overflows a 64-bit accumulator"))?;
                    if value != upper && (value != lower || *is_unsigned) {
                        output.push(acc);
                        acc = 0;
                    }
                }
                if output.len() != expected {
                    return Err(ServerError::encode(format!(
                        "IntegerPacking unpacked to {} values, expected {}",
                        output.len(),
                        src_size
                    )));
                }
                Stage::Array(TypedArray::from_i64(DataType::Int32, output))
            }
            (encoding, Stage::Bytes(_)) => {
                return Err(ServerError::encode(format!(
                    "{} expects an array input but the chain is still at bytes",
                    kind_name(encoding)
                )))
            }
            (encoding, Stage::Array(_)) => {
                return Err(ServerError::encode(format!(
                    "{} expects a byte input but the chain is already decoded",
                    kind_name(encoding)
                )))
            }
        };
    }

    match stage {
        Stage::Array(array) => Ok(array),
        Stage::Bytes(_) => Err(ServerError::encode("encoding list is empty")),
    }
}

/// Element count a descriptor claims; negative counts are malformed.
fn declared_size(src_size: i32, kind: &str) -> Result<usize> {
    usize::try_from(src_size)
        .map_err(|_| ServerError::encode(format!("{} declares a negative size {}", kind, src_size)))
}

fn decode_strings(
    data_encoding: &[Encoding],
    string_data: &str,
    offset_encoding: &[Encoding],
    offsets: &[u8],
    indices: &[u8],
) -> Result<TypedArray> {
    let offsets = require_i64(&decode_chain(offset_encoding, offsets)?, "StringArray offsets")?;
    let indices = require_i64(&decode_chain(data_encoding, indices)?, "StringArray indices")?;

    let mut dictionary = Vec::with_capacity(offsets.len().saturating_sub(1));
    for w in offsets.windows(2) {
        let piece = string_data
            .get(w[0] as usize..w[1] as usize)
            .ok_or_else(|| ServerError::encode("StringArray offset is not on a character boundary"))?;
        dictionary.push(piece.to_string());
    }

    let values = indices
        .into_iter()
        .map(|idx| {
            if idx < 0 {
                Ok(None)
            } else {
                dictionary
                    .get(idx as usize)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| ServerError::encode(format!("StringArray index {} out of range", idx)))
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TypedArray::Str(values))
}

fn require_i64(array: &TypedArray, step: &str) -> Result<Vec<i64>> {
    array
        .to_i64()
        .ok_or_else(|| ServerError::encode(format!("{} decode needs integer input", step)))
}

fn require_f64(array: &TypedArray, step: &str) -> Result<Vec<f64>> {
    array
        .to_f64()
        .ok_or_else(|| ServerError::encode(format!("{} decode needs numeric input", step)))
}

fn kind_name(encoding: &Encoding) -> &'static str {
    match encoding {
        Encoding::ByteArray { .. } => "ByteArray",
        Encoding::FixedPoint { .. } => "FixedPoint",
        Encoding::IntervalQuantization { .. } => "IntervalQuantization",
        Encoding::RunLength { .. } => "RunLength",
        Encoding::Delta { .. } => "Delta",
        Encoding::IntegerPacking { .. } => "IntegerPacking",
        Encoding::StringArray { .. } => "StringArray",
    }
}
