//! Pick an encoder for a column by trying candidate chains and keeping the
//! one with the smallest output.

use super::{Encoder, EncodingStep, TypedArray};

/// Largest number of decimal digits a float column may carry and still be
/// stored as fixed point.
const MAX_FIXED_POINT_DIGITS: i32 = 6;

const FIXED_POINT_TOLERANCE: f64 = 1e-6;

fn integer_candidates() -> Vec<Encoder> {
    vec![
        Encoder::by(EncodingStep::ByteArray),
        Encoder::by(EncodingStep::IntegerPacking),
        Encoder::by(EncodingStep::Delta).and(EncodingStep::IntegerPacking),
        Encoder::by(EncodingStep::RunLength).and(EncodingStep::IntegerPacking),
        Encoder::by(EncodingStep::Delta)
            .and(EncodingStep::RunLength)
            .and(EncodingStep::IntegerPacking),
    ]
}

/// Smallest integer chain for an Int32 column.
pub fn classify_ints(values: &[i32]) -> Encoder {
    let mut best: Option<(usize, Encoder)> = None;

    for candidate in integer_candidates() {
        let size = match candidate.encode(TypedArray::Int32(values.to_vec())) {
            Ok(encoded) => encoded.byte_len(),
            Err(_) => continue,
        };
        match &best {
            Some((best_size, _)) if *best_size <= size => {}
            _ => best = Some((size, candidate)),
        }
    }

    best.map(|(_, encoder)| encoder).unwrap_or_else(Encoder::raw)
}

/// Fixed point with the fewest decimal digits that represent every value,
/// followed by the best integer chain; plain Float64 bytes otherwise.
pub fn classify_floats(values: &[f64]) -> Encoder {
    let Some(digits) = decimal_digits(values) else {
        return Encoder::raw();
    };

    let factor = 10f64.powi(digits);
    let scaled: Vec<i32> = values.iter().map(|v| (v * factor).round() as i32).collect();

    let mut encoder = Encoder::by(EncodingStep::FixedPoint { factor });
    for step in classify_ints(&scaled).steps() {
        encoder = encoder.and(step.clone());
    }
    encoder
}

pub fn classify_strings() -> Encoder {
    Encoder::text()
}

fn decimal_digits(values: &[f64]) -> Option<i32> {
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }

    (0..=MAX_FIXED_POINT_DIGITS).find(|&d| {
        let factor = 10f64.powi(d);
        values.iter().all(|&v| {
            let scaled = v * factor;
            scaled.abs() < i32::MAX as f64 && (scaled - scaled.round()).abs() < FIXED_POINT_TOLERANCE
        })
    })
}

#[cfg(test)]
mod classifier_tests {
    use super::*;
    use crate::encoding::{decode, Encoding};

    #[test]
    fn test_constant_ints_prefer_run_length() {
        let values = vec![1; 1000];
        let encoder = classify_ints(&values);
        assert!(encoder.steps().contains(&EncodingStep::RunLength));
    }

    #[test]
    fn test_sequential_ints_prefer_delta() {
        let values: Vec<i32> = (1000..3000).collect();
        let encoder = classify_ints(&values);
        assert_eq!(encoder.steps()[0], EncodingStep::Delta);
    }

    #[test]
    fn test_empty_ints_still_encode() {
        let encoder = classify_ints(&[]);
        assert!(encoder.encode(TypedArray::Int32(vec![])).is_ok());
    }

    #[test]
    fn test_floats_with_three_decimals() {
        let values = vec![12.345, -3.1, 0.007];
        let encoder = classify_floats(&values);
        assert_eq!(encoder.steps()[0], EncodingStep::FixedPoint { factor: 1000.0 });

        let encoded = encoder.encode(TypedArray::Float64(values.clone())).unwrap();
        match decode(&encoded).unwrap() {
            TypedArray::Float64(v) => {
                for (a, b) in v.iter().zip(values.iter()) {
                    assert!((a - b).abs() < 1e-9);
                }
            }
            other => panic!("Expected Float64, got {:?}", other),
        }
    }

    #[test]
    fn test_whole_floats_use_factor_one() {
        let encoder = classify_floats(&[1.0, 2.0, 3.0]);
        assert_eq!(encoder.steps()[0], EncodingStep::FixedPoint { factor: 1.0 });
    }

    #[test]
    fn test_high_precision_floats_stay_raw() {
        let values = vec![std::f64::consts::PI, std::f64::consts::E];
        let encoder = classify_floats(&values);
        let encoded = encoder.encode(TypedArray::Float64(values)).unwrap();
        assert_eq!(
            encoded.encoding,
            vec![Encoding::ByteArray { data_type: crate::encoding::DataType::Float64 }]
        );
    }

    #[test]
    fn test_non_finite_floats_stay_raw() {
        assert_eq!(classify_floats(&[1.0, f64::NAN]), Encoder::raw());
    }
}
