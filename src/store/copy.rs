//! Tab-delimited staging buffer and its copy into an item table.
//!
//! Rows are rendered in text-copy format: one line per row, fields separated
//! by tabs, `\N` for null, and backslash escapes for backslash, tab, CR and LF
//! inside values.

use rusqlite::Transaction;
use rusqlite::params_from_iter;
use rusqlite::types::Value;

use crate::error::IngestError;

pub const NULL_SENTINEL: &str = "\\N";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CopyValue<'a> {
    Null,
    Text(&'a str),
    Int(i64),
    Real(f64),
    Bool(bool),
}

impl<'a> From<&'a str> for CopyValue<'a> {
    fn from(value: &'a str) -> Self {
        CopyValue::Text(value)
    }
}

impl<'a> From<Option<&'a str>> for CopyValue<'a> {
    fn from(value: Option<&'a str>) -> Self {
        value.map_or(CopyValue::Null, CopyValue::Text)
    }
}

impl From<Option<bool>> for CopyValue<'_> {
    fn from(value: Option<bool>) -> Self {
        value.map_or(CopyValue::Null, CopyValue::Bool)
    }
}

impl From<Option<f64>> for CopyValue<'_> {
    fn from(value: Option<f64>) -> Self {
        value.map_or(CopyValue::Null, CopyValue::Real)
    }
}

#[derive(Debug, Clone)]
pub struct StagingBuffer {
    table: &'static str,
    columns: &'static [&'static str],
    buf: String,
    rows: usize,
}

impl StagingBuffer {
    pub fn new(table: &'static str, columns: &'static [&'static str]) -> Self {
        Self {
            table,
            columns,
            buf: String::new(),
            rows: 0,
        }
    }

    pub fn push_row(&mut self, values: &[CopyValue<'_>]) -> Result<(), IngestError> {
        if values.len() != self.columns.len() {
            return Err(IngestError::Insert(format!(
                "{} expects {} columns, got {}",
                self.table,
                self.columns.len(),
                values.len()
            )));
        }

        for (idx, value) in values.iter().enumerate() {
            if idx > 0 {
                self.buf.push('\t');
            }
            match value {
                CopyValue::Null => self.buf.push_str(NULL_SENTINEL),
                CopyValue::Text(text) => escape_into(&mut self.buf, text),
                CopyValue::Int(number) => self.buf.push_str(&number.to_string()),
                CopyValue::Real(number) => self.buf.push_str(&number.to_string()),
                CopyValue::Bool(flag) => self.buf.push(if *flag { '1' } else { '0' }),
            }
        }
        self.buf.push('\n');
        self.rows += 1;
        Ok(())
    }

}

/// Streams the staged rows into `buffer.table` inside the caller's
/// transaction. Returns the number of rows copied.
pub fn copy_in(tx: &Transaction<'_>, buffer: &StagingBuffer) -> Result<usize, IngestError> {
    if buffer.rows == 0 {
        return Ok(0);
    }

    let placeholders = (1..=buffer.columns.len())
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        buffer.table,
        buffer.columns.join(", "),
        placeholders
    );
    let mut statement = tx.prepare_cached(&sql)?;

    let mut copied = 0;
    for (line_no, line) in buffer.buf.lines().enumerate() {
        let values = line.split('\t').map(decode_field).collect::<Vec<Value>>();
        if values.len() != buffer.columns.len() {
            return Err(IngestError::Insert(format!(
                "{} staging line {} has {} fields, expected {}",
                buffer.table,
                line_no + 1,
                values.len(),
                buffer.columns.len()
            )));
        }
        statement
            .execute(params_from_iter(values.iter()))
            .map_err(|err| {
                IngestError::Insert(format!(
                    "{} staging line {}: {err}",
                    buffer.table,
                    line_no + 1
                ))
            })?;
        copied += 1;
    }

    Ok(copied)
}

fn escape_into(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

fn decode_field(field: &str) -> Value {
    if field == NULL_SENTINEL {
        return Value::Null;
    }

    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Value::Text(out)
}
