use crate::cif::{self, DataBlock};
use crate::error::LoadError;

/// Cache weight per byte of source text, covering the parsed form.
const SIZE_EXPANSION_FACTOR: usize = 3;

/// Trimmed, lower-cased source id used as the cache and coalescing key.
pub fn normalize_key(source_id: &str) -> String {
    source_id.trim().to_lowercase()
}

/// One model of a structure: its number and the `atom_site` rows that
/// belong to it, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub model_num: i32,
    pub atom_rows: Vec<usize>,
}

/// A parsed source. Never mutated after construction.
#[derive(Debug)]
pub struct SourceDocument {
    pub key: String,
    pub source_id: String,
    pub raw_size: usize,
    pub block: DataBlock,
    pub models: Vec<Model>,
}

impl SourceDocument {
    /// Parse source text and keep its first data block.
    pub fn from_text(source_id: &str, text: &str) -> Result<Self, LoadError> {
        let file = cif::parse(text).map_err(|e| LoadError::parse(source_id, e.to_string()))?;
        let block = file
            .blocks
            .into_iter()
            .next()
            .ok_or_else(|| LoadError::parse(source_id, "source contains no data blocks"))?;

        let models = split_models(&block);

        Ok(Self {
            key: normalize_key(source_id),
            source_id: source_id.to_string(),
            raw_size: text.len(),
            block,
            models,
        })
    }

    /// Approximate in-memory footprint, used as the cache weight.
    pub fn approximate_size(&self) -> usize {
        self.raw_size * SIZE_EXPANSION_FACTOR
    }

    pub fn model(&self, model_num: i32) -> Option<&Model> {
        self.models.iter().find(|m| m.model_num == model_num)
    }
}

/// Group atom rows by `pdbx_PDB_model_num`, ordered by first appearance.
fn split_models(block: &DataBlock) -> Vec<Model> {
    let Some(atoms) = block.category("atom_site") else {
        return Vec::new();
    };

    let Some(column) = atoms.column("pdbx_PDB_model_num") else {
        return vec![Model {
            model_num: 1,
            atom_rows: (0..atoms.row_count).collect(),
        }];
    };

    let mut models: Vec<Model> = Vec::new();
    for row in 0..atoms.row_count {
        let num = column.value(row).trim().parse::<i32>().unwrap_or(1);
        // Rows of one model are almost always contiguous.
        match models.last_mut() {
            Some(last) if last.model_num == num => last.atom_rows.push(row),
            _ => match models.iter_mut().find(|m| m.model_num == num) {
                Some(model) => model.atom_rows.push(row),
                None => models.push(Model {
                    model_num: num,
                    atom_rows: vec![row],
                }),
            },
        }
    }
    models
}

#[cfg(test)]
mod document_tests {
    use super::*;

    const TWO_MODELS: &str = "data_2mdl
loop_
_atom_site.id
_atom_site.pdbx_PDB_model_num
1 1
2 1
3 2
4 2
5 1
";

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  1CBS \n"), "1cbs");
    }

    #[test]
    fn test_from_text_splits_models() {
        let doc = SourceDocument::from_text("2MDL", TWO_MODELS).unwrap();
        assert_eq!(doc.key, "2mdl");
        assert_eq!(doc.models.len(), 2);
        assert_eq!(doc.model(1).unwrap().atom_rows, vec![0, 1, 4]);
        assert_eq!(doc.model(2).unwrap().atom_rows, vec![2, 3]);
    }

    #[test]
    fn test_single_model_without_model_column() {
        let doc = SourceDocument::from_text("x", "data_x\nloop_\n_atom_site.id\n1\n2\n").unwrap();
        assert_eq!(doc.models, vec![Model { model_num: 1, atom_rows: vec![0, 1] }]);
    }

    #[test]
    fn test_approximate_size_is_three_times_raw() {
        let doc = SourceDocument::from_text("x", TWO_MODELS).unwrap();
        assert_eq!(doc.raw_size, TWO_MODELS.len());
        assert_eq!(doc.approximate_size(), TWO_MODELS.len() * 3);
    }

    #[test]
    fn test_zero_blocks_is_parse_error() {
        let err = SourceDocument::from_text("empty", "# nothing here\n").unwrap_err();
        assert!(err.is_parse());
        assert!(err.to_string().contains("no data blocks"));
    }

    #[test]
    fn test_malformed_is_parse_error() {
        let err = SourceDocument::from_text("bad", "data_x\nloop_\n").unwrap_err();
        assert!(err.is_parse());
        assert_eq!(err.source_id(), "bad");
    }
}
