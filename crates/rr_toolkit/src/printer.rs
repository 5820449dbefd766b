//! Output rendering for records: JSON, column-aligned text, or wide text.

use std::collections::BTreeMap;
use std::io::{self, Write};

/// One output row, keyed by column name.
pub type Record = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON array, or one object per line when itemised.
    #[default]
    Json,
    /// Aligned table restricted to the command's preferred columns.
    Text,
    /// Aligned table with every column.
    Wide,
}

pub struct Printer<W: Write = io::Stdout> {
    format: OutputFormat,
    pretty: bool,
    skip_headers: bool,
    itemise: bool,
    dest: W,
}

impl Printer<io::Stdout> {
    pub fn stdout(format: OutputFormat, pretty: bool) -> Self {
        Self::new(format, pretty, io::stdout())
    }
}

impl<W: Write> Printer<W> {
    pub fn new(format: OutputFormat, pretty: bool, dest: W) -> Self {
        Self {
            format,
            pretty,
            skip_headers: false,
            itemise: false,
            dest,
        }
    }

    /// Suppress the table header row.
    pub fn skip_headers(mut self, skip: bool) -> Self {
        self.skip_headers = skip;
        self
    }

    /// Emit JSON records one per line instead of as one array.
    pub fn itemise(mut self, itemise: bool) -> Self {
        self.itemise = itemise;
        self
    }

    pub fn into_inner(self) -> W {
        self.dest
    }

    /// Render `records`. `columns` is the preferred column order; `text`
    /// shows only those, `wide` appends any remaining keys.
    pub fn print(&mut self, records: &[Record], columns: &[&str]) -> io::Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(records),
            OutputFormat::Text | OutputFormat::Wide => self.print_table(records, columns),
        }
    }

    fn print_json(&mut self, records: &[Record]) -> io::Result<()> {
        if self.itemise {
            for record in records {
                let line = self.encode(record)?;
                writeln!(self.dest, "{line}")?;
            }
        } else {
            let body = self.encode(&records)?;
            writeln!(self.dest, "{body}")?;
        }
        self.dest.flush()
    }

    fn encode<T: serde::Serialize + ?Sized>(&self, value: &T) -> io::Result<String> {
        let encoded = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        encoded.map_err(io::Error::other)
    }

    fn print_table(&mut self, records: &[Record], columns: &[&str]) -> io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let headers = self.table_columns(records, columns);
        let rows = records
            .iter()
            .map(|record| {
                headers
                    .iter()
                    .map(|column| record.get(column).cloned().unwrap_or_default())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let mut widths = headers
            .iter()
            .map(|h| if self.skip_headers { 0 } else { h.len() })
            .collect::<Vec<_>>();
        for row in &rows {
            for (idx, cell) in row.iter().enumerate() {
                widths[idx] = widths[idx].max(cell.len());
            }
        }

        if !self.skip_headers {
            let header_row = headers
                .iter()
                .map(|h| h.to_uppercase())
                .collect::<Vec<_>>();
            write_row(&mut self.dest, &header_row, &widths)?;
        }
        for row in &rows {
            write_row(&mut self.dest, row, &widths)?;
        }
        self.dest.flush()
    }

    fn table_columns(&self, records: &[Record], preferred: &[&str]) -> Vec<String> {
        let mut columns = preferred.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        // Text keeps the preferred set; wide (or no preference) shows everything.
        if self.format == OutputFormat::Wide || columns.is_empty() {
            for record in records {
                for key in record.keys() {
                    if !columns.iter().any(|c| c == key) {
                        columns.push(key.clone());
                    }
                }
            }
        }
        columns
    }
}

fn write_row<W: Write>(dest: &mut W, cells: &[String], widths: &[usize]) -> io::Result<()> {
    let mut line = String::new();
    for (idx, cell) in cells.iter().enumerate() {
        if idx > 0 {
            line.push_str("  ");
        }
        line.push_str(&format!("{:width$}", cell, width = widths[idx]));
    }
    writeln!(dest, "{}", line.trim_end())
}
