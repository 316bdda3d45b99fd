//! Category model shared by both writers.
//!
//! A [`CategoryDescriptor`] names a table and its ordered fields. A
//! [`CategoryProvider`] binds that descriptor to concrete data once per
//! [`Context`], producing a [`CategoryInstance`]. Writers only ever see
//! instances: they ask each field for its presence first and only read the
//! value when the row is [`Presence::Present`].

pub mod source;

use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::encoding::Encoder;
use crate::source::Model;

// ============================================================================
// Presence
// ============================================================================

/// Three-state nullability of a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Presence {
    Present,
    /// `.` in CIF: intentionally left out.
    NotSpecified,
    /// `?` in CIF: not determined.
    Unknown,
}

impl Presence {
    /// Mask code used by the binary format.
    pub fn code(self) -> u8 {
        match self {
            Presence::Present => 0,
            Presence::NotSpecified => 1,
            Presence::Unknown => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Presence::Present),
            1 => Some(Presence::NotSpecified),
            2 => Some(Presence::Unknown),
            _ => None,
        }
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Which accessor the binary writer uses for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Fields without presence are always treated as present.
    pub has_presence: bool,
    /// Binary recipe. `None` lets the writer pick one from the data.
    pub encoder: Option<Encoder>,
}

impl FieldDescriptor {
    pub fn str(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Str)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            has_presence: false,
            encoder: None,
        }
    }

    pub fn with_presence(mut self) -> Self {
        self.has_presence = true;
        self
    }

    pub fn with_encoder(mut self, encoder: Encoder) -> Self {
        self.encoder = Some(encoder);
        self
    }
}

/// A named table shared by every instance of that category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl CategoryDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

// ============================================================================
// Data access
// ============================================================================

/// Row accessors for one bound category. `field` indexes the descriptor's
/// field list.
pub trait CategoryData {
    fn string_value(&self, field: usize, row: usize) -> Cow<'_, str>;

    fn int_value(&self, field: usize, row: usize) -> i32 {
        self.string_value(field, row).trim().parse().unwrap_or(0)
    }

    fn float_value(&self, field: usize, row: usize) -> f64 {
        self.string_value(field, row).trim().parse().unwrap_or(0.0)
    }

    fn presence(&self, _field: usize, _row: usize) -> Presence {
        Presence::Present
    }
}

impl<T: CategoryData + ?Sized> CategoryData for &T {
    fn string_value(&self, field: usize, row: usize) -> Cow<'_, str> {
        (**self).string_value(field, row)
    }

    fn int_value(&self, field: usize, row: usize) -> i32 {
        (**self).int_value(field, row)
    }

    fn float_value(&self, field: usize, row: usize) -> f64 {
        (**self).float_value(field, row)
    }

    fn presence(&self, field: usize, row: usize) -> Presence {
        (**self).presence(field, row)
    }
}

/// One binding of a descriptor to data, produced per context.
pub struct CategoryInstance<'a> {
    pub descriptor: Arc<CategoryDescriptor>,
    pub data: Box<dyn CategoryData + 'a>,
    pub row_count: usize,
}

impl<'a> CategoryInstance<'a> {
    pub fn new(
        descriptor: Arc<CategoryDescriptor>,
        data: impl CategoryData + 'a,
        row_count: usize,
    ) -> Self {
        Self {
            descriptor,
            data: Box::new(data),
            row_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Presence of a value; fields declared without presence are always
    /// present and their data is never asked.
    pub fn presence(&self, field: usize, row: usize) -> Presence {
        if self.descriptor.fields[field].has_presence {
            self.data.presence(field, row)
        } else {
            Presence::Present
        }
    }
}

/// What a provider is asked to render: optionally one model and the rows
/// of that model a query matched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context<'a> {
    pub model: Option<&'a Model>,
    pub rows: Option<&'a [usize]>,
}

impl<'a> Context<'a> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn for_model(model: &'a Model) -> Self {
        Self {
            model: Some(model),
            rows: Some(model.atom_rows.as_slice()),
        }
    }
}

pub trait CategoryProvider {
    fn provide<'p>(&'p self, ctx: &Context<'p>) -> CategoryInstance<'p>;
}

/// Invoke `provider` once per context (once with an empty context if there
/// are none) and drop instances with no rows.
pub fn collect_instances<'p>(
    provider: &'p dyn CategoryProvider,
    contexts: &[Context<'p>],
) -> Vec<CategoryInstance<'p>> {
    let instances: Vec<CategoryInstance<'p>> = if contexts.is_empty() {
        vec![provider.provide(&Context::empty())]
    } else {
        contexts.iter().map(|ctx| provider.provide(ctx)).collect()
    };

    instances.into_iter().filter(|i| i.row_count > 0).collect()
}

// ============================================================================
// Static tables
// ============================================================================

/// A value in a [`StaticTable`].
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Str(String),
    Int(i32),
    Float(f64),
    Absent(Presence),
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Str(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Str(v)
    }
}

impl From<i32> for Cell {
    fn from(v: i32) -> Self {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

/// Small in-memory category, used for response metadata and error
/// documents. Ignores the context.
#[derive(Debug, Clone)]
pub struct StaticTable {
    descriptor: Arc<CategoryDescriptor>,
    rows: Vec<Vec<Cell>>,
}

impl StaticTable {
    pub fn new(descriptor: CategoryDescriptor) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            rows: Vec::new(),
        }
    }

    pub fn row(mut self, cells: Vec<Cell>) -> Self {
        self.rows.push(cells);
        self
    }

    pub fn descriptor(&self) -> &Arc<CategoryDescriptor> {
        &self.descriptor
    }

    fn cell(&self, field: usize, row: usize) -> &Cell {
        static MISSING: Cell = Cell::Absent(Presence::NotSpecified);
        self.rows
            .get(row)
            .and_then(|r| r.get(field))
            .unwrap_or(&MISSING)
    }
}

impl CategoryData for StaticTable {
    fn string_value(&self, field: usize, row: usize) -> Cow<'_, str> {
        match self.cell(field, row) {
            Cell::Str(s) => Cow::Borrowed(s),
            Cell::Int(v) => Cow::Owned(v.to_string()),
            Cell::Float(v) => Cow::Owned(v.to_string()),
            Cell::Absent(_) => Cow::Borrowed(""),
        }
    }

    fn int_value(&self, field: usize, row: usize) -> i32 {
        match self.cell(field, row) {
            Cell::Int(v) => *v,
            Cell::Float(v) => v.round() as i32,
            Cell::Str(s) => s.trim().parse().unwrap_or(0),
            Cell::Absent(_) => 0,
        }
    }

    fn float_value(&self, field: usize, row: usize) -> f64 {
        match self.cell(field, row) {
            Cell::Int(v) => *v as f64,
            Cell::Float(v) => *v,
            Cell::Str(s) => s.trim().parse().unwrap_or(0.0),
            Cell::Absent(_) => 0.0,
        }
    }

    fn presence(&self, field: usize, row: usize) -> Presence {
        match self.cell(field, row) {
            Cell::Absent(p) => *p,
            _ => Presence::Present,
        }
    }
}

impl CategoryProvider for StaticTable {
    fn provide<'p>(&'p self, _ctx: &Context<'p>) -> CategoryInstance<'p> {
        CategoryInstance::new(self.descriptor.clone(), self, self.rows.len())
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;

    fn residues() -> StaticTable {
        StaticTable::new(CategoryDescriptor::new(
            "residue",
            vec![
                FieldDescriptor::int("id"),
                FieldDescriptor::str("name").with_presence(),
            ],
        ))
        .row(vec![Cell::Int(1), "ALA".into()])
        .row(vec![Cell::Int(2), Cell::Absent(Presence::NotSpecified)])
    }

    #[test]
    fn test_presence_codes() {
        for p in [Presence::Present, Presence::NotSpecified, Presence::Unknown] {
            assert_eq!(Presence::from_code(p.code()), Some(p));
        }
        assert_eq!(Presence::Present.code(), 0);
        assert_eq!(Presence::from_code(9), None);
    }

    #[test]
    fn test_static_table_accessors() {
        let table = residues();
        let instance = table.provide(&Context::empty());

        assert_eq!(instance.row_count, 2);
        assert_eq!(instance.data.int_value(0, 1), 2);
        assert_eq!(instance.data.string_value(1, 0), "ALA");
        assert_eq!(instance.presence(1, 1), Presence::NotSpecified);
    }

    #[test]
    fn test_presence_ignored_without_flag() {
        let table = StaticTable::new(CategoryDescriptor::new("t", vec![FieldDescriptor::str("v")]))
            .row(vec![Cell::Absent(Presence::Unknown)]);
        let instance = table.provide(&Context::empty());
        assert_eq!(instance.presence(0, 0), Presence::Present);
    }

    #[test]
    fn test_collect_instances_without_contexts() {
        let table = residues();
        let instances = collect_instances(&table, &[]);
        assert_eq!(instances.len(), 1);
    }

    #[test]
    fn test_collect_instances_drops_empty() {
        let empty = StaticTable::new(CategoryDescriptor::new("t", vec![FieldDescriptor::str("v")]));
        assert!(collect_instances(&empty, &[]).is_empty());
    }

    #[test]
    fn test_collect_instances_per_context() {
        let table = residues();
        let model = Model { model_num: 1, atom_rows: vec![0] };
        let contexts = [Context::for_model(&model), Context::empty()];
        assert_eq!(collect_instances(&table, &contexts).len(), 2);
    }
}
