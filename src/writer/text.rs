//! CIF text writer.
//!
//! ```text
//! data_1ABC
//! #
//! _entry.id 1ABC
//! #
//! loop_
//! _atom_site.id
//! _atom_site.label_comp_id
//! 1 ALA
//! 2 GLY
//! #
//! ```

use super::sink::{BufferedText, OutputSink};
use super::{OutputFormat, Writer};
use crate::error::{Result, ServerError};
use crate::model::{collect_instances, CategoryInstance, CategoryProvider, Context, Presence};

pub struct TextWriter {
    buffer: BufferedText,
    has_block: bool,
    sealed: bool,
}

impl TextWriter {
    pub fn new(chunk_capacity: usize) -> Self {
        Self {
            buffer: BufferedText::new(chunk_capacity),
            has_block: false,
            sealed: false,
        }
    }

    fn write_single_record(&mut self, instance: &CategoryInstance<'_>) {
        let category = &instance.descriptor.name;
        let width = instance
            .descriptor
            .fields
            .iter()
            .map(|f| category.chars().count() + f.name.chars().count() + 2)
            .max()
            .unwrap_or(0)
            + 1;

        for (i, field) in instance.descriptor.fields.iter().enumerate() {
            let key = format!("_{}.{}", category, field.name);
            self.buffer.write_padded_right(&key, width);
            self.write_value(instance, i, 0);
            self.buffer.write("\n");
        }
    }

    fn write_loop(&mut self, instances: &[CategoryInstance<'_>]) {
        let descriptor = &instances[0].descriptor;

        self.buffer.write("loop_\n");
        for field in &descriptor.fields {
            self.buffer.write("_");
            self.buffer.write(&descriptor.name);
            self.buffer.write(".");
            self.buffer.write(&field.name);
            self.buffer.write("\n");
        }

        for instance in instances {
            for row in 0..instance.row_count {
                for i in 0..instance.descriptor.fields.len() {
                    self.write_value(instance, i, row);
                }
                self.buffer.write("\n");
            }
        }
    }

    fn write_value(&mut self, instance: &CategoryInstance<'_>, field: usize, row: usize) {
        match instance.presence(field, row) {
            Presence::NotSpecified => self.buffer.write(". "),
            Presence::Unknown => self.buffer.write("? "),
            Presence::Present => {
                let value = instance.data.string_value(field, row);
                write_escaped(&mut self.buffer, &value);
            }
        }
    }
}

/// Render one present value followed by its separator.
fn write_escaped(buffer: &mut BufferedText, value: &str) {
    if value.is_empty() {
        buffer.write(". ");
        return;
    }

    if value.contains('\n') {
        write_text_field(buffer, value);
        return;
    }

    let has_single = value.contains('\'');
    let has_double = value.contains('"');
    if has_single && has_double {
        write_text_field(buffer, value);
        return;
    }

    if has_single {
        buffer.write("\"");
        buffer.write(value);
        buffer.write("\" ");
    } else if has_double || needs_quotes(value) {
        buffer.write("'");
        buffer.write(value);
        buffer.write("' ");
    } else {
        buffer.write(value);
        buffer.write(" ");
    }
}

fn write_text_field(buffer: &mut BufferedText, value: &str) {
    buffer.write("\n;");
    buffer.write(value);
    buffer.write("\n; ");
}

const RESERVED_PREFIXES: [&str; 5] = ["data_", "loop_", "save_", "global_", "stop_"];

fn needs_quotes(value: &str) -> bool {
    if value == "." || value == "?" {
        return true;
    }
    if value.chars().any(char::is_whitespace) {
        return true;
    }
    if matches!(value.as_bytes()[0], b'_' | b'#' | b'$' | b';' | b'[' | b']') {
        return true;
    }
    let lower = value.to_ascii_lowercase();
    RESERVED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

impl Writer for TextWriter {
    fn start_data_block(&mut self, header: &str) -> Result<()> {
        if self.sealed {
            return Err(ServerError::WriterSealed);
        }
        let header: String = header
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();

        self.buffer.write("data_");
        self.buffer.write(&header);
        self.buffer.write("\n#\n");
        self.has_block = true;
        Ok(())
    }

    fn write_category<'p>(&mut self, provider: &'p dyn CategoryProvider, contexts: &[Context<'p>]) -> Result<()> {
        if self.sealed {
            return Err(ServerError::WriterSealed);
        }
        if !self.has_block {
            return Err(ServerError::NoDataBlock);
        }

        let instances = collect_instances(provider, contexts);
        let total_rows: usize = instances.iter().map(|i| i.row_count).sum();
        if total_rows == 0 {
            return Ok(());
        }

        if total_rows == 1 {
            self.write_single_record(&instances[0]);
        } else {
            self.write_loop(&instances);
        }
        self.buffer.write("#\n");
        Ok(())
    }

    fn encode(&mut self) -> Result<()> {
        self.sealed = true;
        self.buffer.finalize();
        Ok(())
    }

    fn flush(&mut self, sink: &mut dyn OutputSink) -> Result<()> {
        if !self.sealed {
            return Err(ServerError::NotEncoded);
        }
        self.buffer.write_to(sink).map_err(ServerError::Flush)
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::Text
    }
}
