//! Provider that re-exposes a parsed source category.

use std::borrow::Cow;
use std::sync::Arc;

use super::{
    CategoryData, CategoryDescriptor, CategoryInstance, CategoryProvider, Context, FieldDescriptor,
    FieldKind, Presence,
};
use crate::cif::{Category, Column};
use crate::encoding::{CoordinatePrecision, Encoder};

/// Exposes a source [`Category`] as-is. When `follows_rows` is set the
/// context's row selection is applied (used for per-model atom tables).
pub struct SourceCategory<'d> {
    descriptor: Arc<CategoryDescriptor>,
    category: &'d Category,
    follows_rows: bool,
}

impl<'d> SourceCategory<'d> {
    pub fn new(category: &'d Category) -> Self {
        Self {
            descriptor: Arc::new(describe(category)),
            category,
            follows_rows: false,
        }
    }

    pub fn with_row_selection(mut self) -> Self {
        self.follows_rows = true;
        self
    }

    pub fn descriptor(&self) -> &Arc<CategoryDescriptor> {
        &self.descriptor
    }
}

impl<'d> CategoryProvider for SourceCategory<'d> {
    fn provide<'p>(&'p self, ctx: &Context<'p>) -> CategoryInstance<'p> {
        let rows = if self.follows_rows { ctx.rows } else { None };
        let row_count = rows.map_or(self.category.row_count, <[usize]>::len);
        let view = RowView {
            category: self.category,
            rows,
        };
        CategoryInstance::new(self.descriptor.clone(), view, row_count)
    }
}

struct RowView<'p> {
    category: &'p Category,
    rows: Option<&'p [usize]>,
}

impl<'p> RowView<'p> {
    fn source_row(&self, row: usize) -> usize {
        match self.rows {
            Some(rows) => rows[row],
            None => row,
        }
    }
}

impl<'p> CategoryData for RowView<'p> {
    fn string_value(&self, field: usize, row: usize) -> Cow<'_, str> {
        Cow::Borrowed(self.category.columns[field].value(self.source_row(row)))
    }

    fn presence(&self, field: usize, row: usize) -> Presence {
        self.category.columns[field].presence(self.source_row(row))
    }
}

// ============================================================================
// Column classification
// ============================================================================

/// Build a descriptor whose fields mirror the category's columns.
pub fn describe(category: &Category) -> CategoryDescriptor {
    let fields = category
        .columns
        .iter()
        .map(|column| {
            let kind = column_kind(column);
            let mut field = match kind {
                FieldKind::Int => FieldDescriptor::int(column.name.clone()),
                FieldKind::Float => FieldDescriptor::float(column.name.clone()),
                FieldKind::Str => FieldDescriptor::str(column.name.clone()),
            };
            if column.has_absent_values() {
                field = field.with_presence();
            }
            if let Some(encoder) = known_recipe(&category.name, &column.name, kind) {
                field = field.with_encoder(encoder);
            }
            field
        })
        .collect();

    CategoryDescriptor::new(category.name.clone(), fields)
}

/// Int if every present value round-trips through i32, Float if every
/// present value parses as a number, Str otherwise (or if nothing is
/// present).
fn column_kind(column: &Column) -> FieldKind {
    let mut any = false;
    let mut all_int = true;
    let mut all_float = true;

    for value in column.present_values() {
        any = true;
        if all_int && value.parse::<i32>().map_or(true, |v| v.to_string() != value) {
            all_int = false;
        }
        if all_float && !value.parse::<f64>().map_or(false, f64::is_finite) {
            all_float = false;
        }
        if !all_int && !all_float {
            return FieldKind::Str;
        }
    }

    match (any, all_int, all_float) {
        (false, _, _) => FieldKind::Str,
        (true, true, _) => FieldKind::Int,
        (true, false, true) => FieldKind::Float,
        _ => FieldKind::Str,
    }
}

/// Fixed recipes for the atom table columns whose shape is known ahead of
/// time; everything else is classified from its data.
fn known_recipe(category: &str, field: &str, kind: FieldKind) -> Option<Encoder> {
    if category != "atom_site" {
        return None;
    }
    match (field, kind) {
        ("Cartn_x" | "Cartn_y" | "Cartn_z", FieldKind::Float) => {
            Some(Encoder::coordinates(CoordinatePrecision::High))
        }
        ("occupancy" | "B_iso_or_equiv", FieldKind::Float) => Some(Encoder::quality()),
        ("id" | "label_seq_id" | "auth_seq_id", FieldKind::Int) => Some(Encoder::sequential_ids()),
        _ => None,
    }
}
