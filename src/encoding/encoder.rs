//! Composable encoder chains.
//!
//! ```
//! use modelserver::encoding::{Encoder, EncodingStep, TypedArray};
//!
//! let encoder = Encoder::by(EncodingStep::FixedPoint { factor: 1000.0 })
//!     .and(EncodingStep::Delta)
//!     .and(EncodingStep::IntegerPacking);
//!
//! let encoded = encoder.encode(TypedArray::Float64(vec![1.5, 1.501, 1.502])).unwrap();
//! assert_eq!(encoded.encoding.len(), 4); // FixedPoint, Delta, IntegerPacking, ByteArray
//! ```

use std::collections::HashMap;

use super::{DataType, EncodedData, Encoding, TypedArray};
use crate::error::{Result, ServerError};

/// A single transform in an encoder chain.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodingStep {
    /// Terminal: raw little-endian bytes of any numeric array.
    ByteArray,
    /// Float -> Int32 via `round(value * factor)`.
    FixedPoint { factor: f64 },
    /// Float -> Int32 bucket index over `[min, max]` in `num_steps` steps.
    IntervalQuantization { min: f64, max: f64, num_steps: i32 },
    /// Integer -> Int32 `(value, count)` pairs.
    RunLength,
    /// Signed integer -> same type, first element 0, rest differences.
    Delta,
    /// Terminal: Int32 -> 1 or 2 byte elements when that is smaller.
    IntegerPacking,
    /// Terminal: strings -> dictionary + index column.
    StringArray,
}

/// Precision of coordinate fixed-point recipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatePrecision {
    /// One decimal digit.
    Low,
    /// Three decimal digits.
    High,
}

#[derive(Debug)]
enum Stage {
    Array(TypedArray),
    Bytes(Vec<u8>),
}

struct StepOutput {
    encodings: Vec<Encoding>,
    data: Stage,
}

/// Ordered chain of encoding steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoder {
    steps: Vec<EncodingStep>,
}

impl Encoder {
    /// Start a chain with one step.
    pub fn by(step: EncodingStep) -> Self {
        Self { steps: vec![step] }
    }

    /// Append a step; its input is the previous step's output.
    pub fn and(mut self, step: EncodingStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[EncodingStep] {
        &self.steps
    }

    /// Run the chain over one column.
    ///
    /// Fails if a step gets an input type it cannot handle, if a step
    /// follows a terminal step, or if the chain does not end in bytes.
    pub fn encode(&self, data: TypedArray) -> Result<EncodedData> {
        let mut encodings = Vec::with_capacity(self.steps.len() + 1);
        let mut stage = Stage::Array(data);

        for step in &self.steps {
            let input = match stage {
                Stage::Array(array) => array,
                Stage::Bytes(_) => {
                    return Err(ServerError::encode(format!(
                        "{:?} cannot follow a step that already produced bytes",
                        step
                    )))
                }
            };
            let output = step.apply(input)?;
            encodings.extend(output.encodings);
            stage = output.data;
        }

        match stage {
            Stage::Bytes(data) => Ok(EncodedData { encoding: encodings, data }),
            Stage::Array(array) => Err(ServerError::encode(format!(
                "encoding chain must end in bytes, last output was {:?}",
                array.data_type()
            ))),
        }
    }

    // ========================================================================
    // Standard recipes
    // ========================================================================

    /// Cartesian coordinates: fixed point, delta, integer packing.
    pub fn coordinates(precision: CoordinatePrecision) -> Self {
        let factor = match precision {
            CoordinatePrecision::Low => 10.0,
            CoordinatePrecision::High => 1000.0,
        };
        Encoder::by(EncodingStep::FixedPoint { factor })
            .and(EncodingStep::Delta)
            .and(EncodingStep::IntegerPacking)
    }

    /// Occupancy / temperature factors: two decimals, delta, run-length.
    pub fn quality() -> Self {
        Encoder::by(EncodingStep::FixedPoint { factor: 100.0 })
            .and(EncodingStep::Delta)
            .and(EncodingStep::RunLength)
            .and(EncodingStep::IntegerPacking)
    }

    /// Monotonic identifiers and sequence numbers.
    pub fn sequential_ids() -> Self {
        Encoder::by(EncodingStep::Delta)
            .and(EncodingStep::RunLength)
            .and(EncodingStep::IntegerPacking)
    }

    /// Plain text.
    pub fn text() -> Self {
        Encoder::by(EncodingStep::StringArray)
    }

    /// Raw numeric passthrough (Int32 or Float64 byte image).
    pub fn raw() -> Self {
        Encoder::by(EncodingStep::ByteArray)
    }
}

// ============================================================================
// Step implementations
// ============================================================================

impl EncodingStep {
    fn apply(&self, data: TypedArray) -> Result<StepOutput> {
        match self {
            EncodingStep::ByteArray => byte_array(data),
            EncodingStep::FixedPoint { factor } => fixed_point(data, *factor),
            EncodingStep::IntervalQuantization { min, max, num_steps } => {
                interval_quantization(data, *min, *max, *num_steps)
            }
            EncodingStep::RunLength => run_length(data),
            EncodingStep::Delta => delta(data),
            EncodingStep::IntegerPacking => integer_packing(data),
            EncodingStep::StringArray => string_array(data),
        }
    }
}

fn byte_array(data: TypedArray) -> Result<StepOutput> {
    let data_type = data
        .data_type()
        .ok_or_else(|| ServerError::encode("ByteArray cannot encode string data"))?;
    let bytes = data
        .to_le_bytes()
        .ok_or_else(|| ServerError::encode("ByteArray cannot encode string data"))?;

    Ok(StepOutput {
        encodings: vec![Encoding::ByteArray { data_type }],
        data: Stage::Bytes(bytes),
    })
}

fn float_input(data: &TypedArray, step: &str) -> Result<(DataType, Vec<f64>)> {
    match data.data_type() {
        Some(dt) if dt.is_float() => Ok((dt, data.to_f64().unwrap_or_default())),
        other => Err(ServerError::encode(format!(
            "{} requires Float32 or Float64 input, got {:?}",
            step, other
        ))),
    }
}

fn fixed_point(data: TypedArray, factor: f64) -> Result<StepOutput> {
    let (src_type, values) = float_input(&data, "FixedPoint")?;
    let output = values
        .iter()
        .map(|&v| {
            let scaled = (v * factor).round();
            if (i32::MIN as f64..=i32::MAX as f64).contains(&scaled) {
                Ok(scaled as i32)
            } else {
                Err(ServerError::encode(format!(
                    "FixedPoint value {} scaled by {} does not fit in Int32",
                    v, factor
                )))
            }
        })
        .collect::<Result<Vec<i32>>>()?;

    Ok(StepOutput {
        encodings: vec![Encoding::FixedPoint { factor, src_type }],
        data: Stage::Array(TypedArray::Int32(output)),
    })
}

fn interval_quantization(data: TypedArray, min: f64, max: f64, num_steps: i32) -> Result<StepOutput> {
    if num_steps < 2 || !(max > min) {
        return Err(ServerError::encode(format!(
            "IntervalQuantization needs max > min and at least 2 steps (min={}, max={}, steps={})",
            min, max, num_steps
        )));
    }
    let (src_type, values) = float_input(&data, "IntervalQuantization")?;
    let step = (max - min) / (num_steps - 1) as f64;

    let output: Vec<i32> = values
        .iter()
        .map(|&v| {
            if v <= min {
                0
            } else if v >= max {
                num_steps - 1
            } else {
                ((v - min) / step).round() as i32
            }
        })
        .collect();

    Ok(StepOutput {
        encodings: vec![Encoding::IntervalQuantization { min, max, num_steps, src_type }],
        data: Stage::Array(TypedArray::Int32(output)),
    })
}

fn integer_input(data: &TypedArray, step: &str) -> Result<(DataType, Vec<i64>)> {
    match (data.data_type(), data.to_i64()) {
        (Some(dt), Some(values)) => Ok((dt, values)),
        (dt, _) => Err(ServerError::encode(format!(
            "{} requires integer input, got {:?}",
            step, dt
        ))),
    }
}

fn run_length(data: TypedArray) -> Result<StepOutput> {
    let (src_type, values) = integer_input(&data, "RunLength")?;
    let mut output: Vec<i32> = Vec::new();

    if let Some(&first) = values.first() {
        let mut current = first;
        let mut count = 0i32;
        for &value in &values {
            if value == current {
                count += 1;
            } else {
                output.push(current as i32);
                output.push(count);
                current = value;
                count = 1;
            }
        }
        output.push(current as i32);
        output.push(count);
    }

    Ok(StepOutput {
        encodings: vec![Encoding::RunLength {
            src_type,
            src_size: values.len() as i32,
        }],
        data: Stage::Array(TypedArray::Int32(output)),
    })
}

fn delta(data: TypedArray) -> Result<StepOutput> {
    let (src_type, values) = integer_input(&data, "Delta")?;
    if !src_type.is_signed_integer() {
        return Err(ServerError::encode(format!(
            "Delta requires Int8, Int16 or Int32 input, got {:?}",
            src_type
        )));
    }

    let origin = values.first().copied().unwrap_or(0);
    let mut output = Vec::with_capacity(values.len());
    if !values.is_empty() {
        output.push(0);
        output.extend(values.windows(2).map(|w| w[1] - w[0]));
    }

    Ok(StepOutput {
        encodings: vec![Encoding::Delta {
            origin: origin as i32,
            src_type,
        }],
        data: Stage::Array(TypedArray::from_i64(src_type, output)),
    })
}

// ── Integer packing ─────────────────────────────────────────────────

struct Packing {
    is_signed: bool,
    bytes_per_element: usize,
}

/// Number of packed elements needed when values are split into chunks
/// bounded by `upper` (and `-upper - 1` for negatives).
fn packing_size(values: &[i32], upper: i64) -> usize {
    let lower = -upper - 1;
    values
        .iter()
        .map(|&v| {
            let v = v as i64;
            if v == 0 {
                1
            } else if v > 0 {
                let chunks = (v + upper - 1) / upper;
                (chunks + i64::from(v % upper == 0)) as usize
            } else {
                let chunks = (v + lower + 1) / lower;
                (chunks + i64::from(v % lower == 0)) as usize
            }
        })
        .sum()
}

fn determine_packing(values: &[i32]) -> Packing {
    let is_signed = values.iter().any(|&v| v < 0);
    let (limit8, limit16) = if is_signed { (0x7F, 0x7FFF) } else { (0xFF, 0xFFFF) };
    let size8 = packing_size(values, limit8);
    let size16 = packing_size(values, limit16);

    let bytes_per_element = if values.len() * 4 < size16 * 2 {
        4
    } else if size16 * 2 < size8 {
        2
    } else {
        1
    };

    Packing { is_signed, bytes_per_element }
}

/// `(upper, lower)` continuation markers for a packed element width.
pub(crate) fn packing_limits(byte_count: i32, is_unsigned: bool) -> (i64, i64) {
    match (byte_count, is_unsigned) {
        (1, false) => (0x7F, -0x80),
        (1, true) => (0xFF, 0),
        (2, false) => (0x7FFF, -0x8000),
        _ => (0xFFFF, 0),
    }
}

fn integer_packing(data: TypedArray) -> Result<StepOutput> {
    let values = match data {
        TypedArray::Int32(values) => values,
        other => {
            return Err(ServerError::encode(format!(
                "IntegerPacking requires Int32 input, got {:?}",
                other.data_type()
            )))
        }
    };

    let packing = determine_packing(&values);
    if packing.bytes_per_element == 4 {
        // Packing would not shrink the column; store it as plain Int32.
        return byte_array(TypedArray::Int32(values));
    }

    let is_unsigned = !packing.is_signed;
    let byte_count = packing.bytes_per_element as i32;
    let (upper, lower) = packing_limits(byte_count, is_unsigned);

    let mut packed: Vec<i64> = Vec::with_capacity(values.len());
    for &v in &values {
        let mut value = v as i64;
        if value >= 0 {
            while value >= upper {
                packed.push(upper);
                value -= upper;
            }
        } else {
            while value <= lower {
                packed.push(lower);
                value -= lower;
            }
        }
        packed.push(value);
    }

    let packed_type = match (byte_count, is_unsigned) {
        (1, false) => DataType::Int8,
        (1, true) => DataType::Uint8,
        (2, false) => DataType::Int16,
        _ => DataType::Uint16,
    };
    let bytes = byte_array(TypedArray::from_i64(packed_type, packed))?;

    let mut encodings = vec![Encoding::IntegerPacking {
        byte_count,
        is_unsigned,
        src_size: values.len() as i32,
    }];
    encodings.extend(bytes.encodings);

    Ok(StepOutput { encodings, data: bytes.data })
}

// ── String array ────────────────────────────────────────────────────

fn string_array(data: TypedArray) -> Result<StepOutput> {
    let strings = match data {
        TypedArray::Str(strings) => strings,
        other => {
            return Err(ServerError::encode(format!(
                "StringArray requires string input, got {:?}",
                other.data_type()
            )))
        }
    };

    let mut index: HashMap<&str, i32> = HashMap::new();
    let mut string_data = String::new();
    let mut offsets: Vec<i32> = vec![0];
    let mut output: Vec<i32> = Vec::with_capacity(strings.len());

    for value in &strings {
        let Some(s) = value.as_deref() else {
            output.push(-1);
            continue;
        };
        let idx = match index.get(s) {
            Some(&idx) => idx,
            None => {
                let idx = (offsets.len() - 1) as i32;
                string_data.push_str(s);
                offsets.push(string_data.len() as i32);
                index.insert(s, idx);
                idx
            }
        };
        output.push(idx);
    }

    let encoded_offsets = Encoder::by(EncodingStep::Delta)
        .and(EncodingStep::IntegerPacking)
        .encode(TypedArray::Int32(offsets))?;
    let encoded_output = Encoder::by(EncodingStep::Delta)
        .and(EncodingStep::RunLength)
        .and(EncodingStep::IntegerPacking)
        .encode(TypedArray::Int32(output))?;

    Ok(StepOutput {
        encodings: vec![Encoding::StringArray {
            data_encoding: encoded_output.encoding,
            string_data,
            offset_encoding: encoded_offsets.encoding,
            offsets: encoded_offsets.data,
        }],
        data: Stage::Bytes(encoded_output.data),
    })
}
