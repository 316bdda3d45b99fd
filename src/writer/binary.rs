//! Binary (BinaryCIF-style) writer.
//!
//! Every field of a category becomes one dense column, encoded with the
//! field's recipe (or a recipe picked from the data), plus an optional
//! presence mask. The finished container is MessagePack:
//!
//! ```text
//! { encoder, version, dataBlocks: [ { header, categories: [
//!     { name: "_atom_site", rowCount, columns: [ { name, data, mask } ] } ] } ] }
//! ```

use serde::{Deserialize, Serialize};

use super::sink::OutputSink;
use super::{OutputFormat, Writer, FORMAT_VERSION};
use crate::encoding::classifier::{classify_floats, classify_ints, classify_strings};
use crate::encoding::{EncodedData, Encoder, EncodingStep, TypedArray};
use crate::error::{Result, ServerError};
use crate::model::{collect_instances, CategoryInstance, CategoryProvider, Context, FieldKind, Presence};

// ============================================================================
// Container
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedFile {
    pub encoder: String,
    pub version: String,
    pub data_blocks: Vec<EncodedDataBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedDataBlock {
    pub header: String,
    pub categories: Vec<EncodedCategory>,
}

impl EncodedDataBlock {
    pub fn category(&self, name: &str) -> Option<&EncodedCategory> {
        self.categories
            .iter()
            .find(|c| c.name.strip_prefix('_') == Some(name) || c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedCategory {
    /// Category name with its leading `_`.
    pub name: String,
    pub row_count: u32,
    pub columns: Vec<EncodedColumn>,
}

impl EncodedCategory {
    pub fn column(&self, name: &str) -> Option<&EncodedColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedColumn {
    pub name: String,
    #[serde(rename = "data")]
    pub encoded_data: EncodedData,
    /// Present only if some row is not [`Presence::Present`].
    #[serde(rename = "mask")]
    pub encoded_mask: Option<EncodedData>,
}

// ============================================================================
// Writer
// ============================================================================

pub struct BinaryWriter {
    /// Live container; `None` once sealed.
    file: Option<EncodedFile>,
    encoded: Option<Vec<u8>>,
}

impl BinaryWriter {
    pub fn new(encoder_tag: impl Into<String>) -> Self {
        Self {
            file: Some(EncodedFile {
                encoder: encoder_tag.into(),
                version: FORMAT_VERSION.to_string(),
                data_blocks: Vec::new(),
            }),
            encoded: None,
        }
    }

    /// Sealed bytes, if `encode` has run.
    pub fn encoded(&self) -> Option<&[u8]> {
        self.encoded.as_deref()
    }
}

impl Writer for BinaryWriter {
    fn start_data_block(&mut self, header: &str) -> Result<()> {
        let file = self.file.as_mut().ok_or(ServerError::WriterSealed)?;
        let header: String = header
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();
        file.data_blocks.push(EncodedDataBlock {
            header,
            categories: Vec::new(),
        });
        Ok(())
    }

    fn write_category<'p>(&mut self, provider: &'p dyn CategoryProvider, contexts: &[Context<'p>]) -> Result<()> {
        let file = self.file.as_mut().ok_or(ServerError::WriterSealed)?;
        let block = file.data_blocks.last_mut().ok_or(ServerError::NoDataBlock)?;

        let instances = collect_instances(provider, contexts);
        let total_rows: usize = instances.iter().map(|i| i.row_count).sum();
        if total_rows == 0 {
            return Ok(());
        }

        let descriptor = instances[0].descriptor.clone();
        let columns = (0..descriptor.fields.len())
            .map(|field| encode_field(&instances, field, total_rows))
            .collect::<Result<Vec<_>>>()?;

        block.categories.push(EncodedCategory {
            name: format!("_{}", descriptor.name),
            row_count: total_rows as u32,
            columns,
        });
        Ok(())
    }

    fn encode(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return if self.encoded.is_some() {
                Ok(())
            } else {
                Err(ServerError::WriterSealed)
            };
        };
        let bytes = rmp_serde::to_vec_named(&file).map_err(|e| ServerError::encode(e.to_string()))?;
        self.encoded = Some(bytes);
        Ok(())
    }

    fn flush(&mut self, sink: &mut dyn OutputSink) -> Result<()> {
        let bytes = self.encoded.as_ref().ok_or(ServerError::NotEncoded)?;
        sink.write_bytes(bytes).map_err(ServerError::Flush)
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Binary
    }
}

/// Build the dense value array and mask for one field across all
/// instances, then encode both.
fn encode_field(instances: &[CategoryInstance<'_>], field: usize, total_rows: usize) -> Result<EncodedColumn> {
    let descriptor = &instances[0].descriptor;
    let field_desc = &descriptor.fields[field];

    let mut mask: Vec<u8> = Vec::with_capacity(total_rows);
    let rows = || {
        instances
            .iter()
            .flat_map(|inst| (0..inst.row_count).map(move |row| (inst, row)))
    };

    let values = match field_desc.kind {
        FieldKind::Str => {
            let mut values: Vec<Option<String>> = Vec::with_capacity(total_rows);
            for (inst, row) in rows() {
                let presence = inst.presence(field, row);
                mask.push(presence.code());
                values.push(match presence {
                    Presence::Present => Some(inst.data.string_value(field, row).into_owned()),
                    _ => None,
                });
            }
            TypedArray::Str(values)
        }
        FieldKind::Int => {
            let mut values: Vec<i32> = Vec::with_capacity(total_rows);
            for (inst, row) in rows() {
                let presence = inst.presence(field, row);
                mask.push(presence.code());
                values.push(match presence {
                    Presence::Present => inst.data.int_value(field, row),
                    _ => 0,
                });
            }
            TypedArray::Int32(values)
        }
        FieldKind::Float => {
            let mut values: Vec<f64> = Vec::with_capacity(total_rows);
            for (inst, row) in rows() {
                let presence = inst.presence(field, row);
                mask.push(presence.code());
                values.push(match presence {
                    Presence::Present => inst.data.float_value(field, row),
                    _ => 0.0,
                });
            }
            TypedArray::Float64(values)
        }
    };

    let encoder = match &field_desc.encoder {
        Some(encoder) => encoder.clone(),
        None => default_encoder(&values),
    };
    let encoded_data = encoder.encode(values).map_err(|e| {
        ServerError::encode(format!("{}.{}: {}", descriptor.name, field_desc.name, e))
    })?;

    let all_present = mask.iter().all(|&m| m == Presence::Present.code());
    let encoded_mask = if all_present {
        None
    } else {
        Some(encode_mask(&mask)?)
    };

    Ok(EncodedColumn {
        name: field_desc.name.clone(),
        encoded_data,
        encoded_mask,
    })
}

/// Recipe for fields that do not name one.
fn default_encoder(values: &TypedArray) -> Encoder {
    match values {
        TypedArray::Str(_) => classify_strings(),
        TypedArray::Int32(v) => classify_ints(v),
        TypedArray::Float64(v) => classify_floats(v),
        _ => Encoder::raw(),
    }
}

/// Encode a presence mask as run-length + packing or as a flat byte array,
/// whichever is strictly smaller; ties keep the flat array.
pub fn encode_mask(mask: &[u8]) -> Result<EncodedData> {
    let flat = Encoder::raw().encode(TypedArray::Uint8(mask.to_vec()))?;
    let run_length = Encoder::by(EncodingStep::RunLength)
        .and(EncodingStep::IntegerPacking)
        .encode(TypedArray::Uint8(mask.to_vec()))?;

    if run_length.byte_len() < flat.byte_len() {
        Ok(run_length)
    } else {
        Ok(flat)
    }
}

#[cfg(test)]
mod binary_writer_tests {
    use super::*;
    use crate::encoding::{decode, DataType, Encoding};
    use crate::model::{Cell, CategoryDescriptor, FieldDescriptor, StaticTable};
    use crate::writer::text::TextWriter;

    fn table() -> StaticTable {
        StaticTable::new(CategoryDescriptor::new(
            "atom",
            vec![
                FieldDescriptor::int("id"),
                FieldDescriptor::float("x"),
                FieldDescriptor::str("name").with_presence(),
            ],
        ))
        .row(vec![Cell::Int(1), Cell::Float(1.5), "CA".into()])
        .row(vec![Cell::Int(2), Cell::Float(2.25), Cell::Absent(Presence::Unknown)])
        .row(vec![Cell::Int(3), Cell::Float(-0.5), "CB".into()])
    }

    fn write(tables: &[&StaticTable]) -> EncodedFile {
        let mut writer = BinaryWriter::new("test");
        writer.start_data_block("blk").unwrap();
        for t in tables {
            writer.write_category(*t, &[]).unwrap();
        }
        writer.encode().unwrap();
        let mut out: Vec<u8> = Vec::new();
        writer.flush(&mut out).unwrap();
        rmp_serde::from_slice(&out).unwrap()
    }

    #[test]
    fn test_container_layout() {
        let file = write(&[&table()]);
        assert_eq!(file.encoder, "test");
        assert_eq!(file.version, "0.3.0");
        assert_eq!(file.data_blocks[0].header, "BLK");

        let category = &file.data_blocks[0].categories[0];
        assert_eq!(category.name, "_atom");
        assert_eq!(category.row_count, 3);
        assert_eq!(category.columns.len(), 3);
    }

    #[test]
    fn test_columns_decode() {
        let file = write(&[&table()]);
        let category = file.data_blocks[0].category("atom").unwrap();

        let ids = decode(&category.column("id").unwrap().encoded_data).unwrap();
        assert_eq!(ids, TypedArray::Int32(vec![1, 2, 3]));

        match decode(&category.column("x").unwrap().encoded_data).unwrap() {
            TypedArray::Float64(v) => assert_eq!(v, vec![1.5, 2.25, -0.5]),
            other => panic!("Expected Float64, got {:?}", other),
        }

        let names = decode(&category.column("name").unwrap().encoded_data).unwrap();
        assert_eq!(
            names,
            TypedArray::Str(vec![Some("CA".to_string()), None, Some("CB".to_string())])
        );
    }

    #[test]
    fn test_mask_only_when_needed() {
        let file = write(&[&table()]);
        let category = &file.data_blocks[0].categories[0];

        assert!(category.column("id").unwrap().encoded_mask.is_none());
        let mask = category.column("name").unwrap().encoded_mask.as_ref().unwrap();
        assert_eq!(decode(mask).unwrap(), TypedArray::Uint8(vec![0, 2, 0]));
    }

    #[test]
    fn test_short_mask_stays_flat() {
        let mask = encode_mask(&[0, 1]).unwrap();
        assert_eq!(mask.encoding, vec![Encoding::ByteArray { data_type: DataType::Uint8 }]);
    }

    #[test]
    fn test_encode_mask_uses_run_length_when_smaller() {
        let mut values = vec![0u8; 200];
        values[100] = 1;
        let mask = encode_mask(&values).unwrap();
        assert!(matches!(mask.encoding[0], Encoding::RunLength { .. }));
        assert_eq!(decode(&mask).unwrap(), TypedArray::Uint8(values));
    }

    #[test]
    fn test_bad_recipe_is_encode_error() {
        let table = StaticTable::new(CategoryDescriptor::new(
            "t",
            vec![FieldDescriptor::str("v").with_encoder(Encoder::by(EncodingStep::Delta))],
        ))
        .row(vec!["a".into()]);

        let mut writer = BinaryWriter::new("test");
        writer.start_data_block("x").unwrap();
        match writer.write_category(&table, &[]) {
            Err(ServerError::Encode(msg)) => assert!(msg.starts_with("t.v")),
            other => panic!("Expected Encode error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_sealed_writer_rejects_writes() {
        let mut writer = BinaryWriter::new("test");
        writer.start_data_block("x").unwrap();
        writer.encode().unwrap();
        assert!(writer.encoded().is_some());
        assert!(matches!(writer.start_data_block("y"), Err(ServerError::WriterSealed)));
        assert!(matches!(writer.write_category(&table(), &[]), Err(ServerError::WriterSealed)));
    }

    #[test]
    fn test_single_row_category_renders_as_record_in_text() {
        let single = StaticTable::new(CategoryDescriptor::new("one", vec![FieldDescriptor::int("n")]))
            .row(vec![Cell::Int(7)]);

        let mut text = TextWriter::new(64);
        text.start_data_block("x").unwrap();
        text.write_category(&single, &[]).unwrap();
        text.encode().unwrap();
        let mut out: Vec<u8> = Vec::new();
        text.flush(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(!out.contains("loop_"));

        let file = write(&[&single]);
        assert_eq!(file.data_blocks[0].categories[0].row_count, 1);
    }
}
