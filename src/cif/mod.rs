//! CIF text documents: data blocks, categories and columns.
//!
//! Only the subset of STAR syntax used by coordinate files is accepted:
//! `data_` blocks, `loop_` tables and single items. Save frames and
//! `global_` blocks are rejected.

mod parser;

use std::collections::HashMap;

use thiserror::Error;

use crate::model::Presence;

pub use parser::parse;

/// Malformed CIF text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CifFile {
    pub blocks: Vec<DataBlock>,
}

/// One `data_` block. Categories keep the order they appear in.
#[derive(Debug, Clone)]
pub struct DataBlock {
    pub header: String,
    categories: Vec<Category>,
    index: HashMap<String, usize>,
}

impl DataBlock {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            categories: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn category(&self, name: &str) -> Option<&Category> {
        self.index.get(name).map(|&i| &self.categories[i])
    }

    pub(crate) fn category_mut(&mut self, name: &str) -> Option<&mut Category> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.categories[i]),
            None => None,
        }
    }

    pub(crate) fn push_category(&mut self, category: Category) {
        self.index.insert(category.name.clone(), self.categories.len());
        self.categories.push(category);
    }
}

/// A table of columns sharing one row count. `name` has no leading `_`.
#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub row_count: usize,
    pub columns: Vec<Column>,
    pub(crate) from_loop: bool,
}

impl Category {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Column values as written in the source. Rows that were `.` or `?`
/// hold an empty string and the matching [`Presence`].
#[derive(Debug, Clone, Default)]
pub struct Column {
    pub name: String,
    values: Vec<String>,
    presence: Vec<Presence>,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            presence: Vec::new(),
        }
    }

    pub fn push(&mut self, value: impl Into<String>, presence: Presence) {
        self.values.push(value.into());
        self.presence.push(presence);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, row: usize) -> &str {
        self.values.get(row).map(String::as_str).unwrap_or("")
    }

    pub fn presence(&self, row: usize) -> Presence {
        self.presence.get(row).copied().unwrap_or(Presence::NotSpecified)
    }

    /// True if any row is `.` or `?`.
    pub fn has_absent_values(&self) -> bool {
        self.presence.iter().any(|&p| p != Presence::Present)
    }

    pub fn present_values(&self) -> impl Iterator<Item = &str> {
        self.values
            .iter()
            .zip(self.presence.iter())
            .filter(|(_, p)| **p == Presence::Present)
            .map(|(v, _)| v.as_str())
    }
}
