//! In-memory tables and the CSV codec behind the historical store.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Missing,
    Number(f64),
    Text(String),
}

impl Cell {
    /// Interprets one raw CSV field. Empty fields and `NaN` are missing.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
            return Self::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(value) => Self::Number(value),
            Err(_) => Self::Text(raw.to_string()),
        }
    }

    pub fn is_missing(&self) -> bool {
        match self {
            Self::Missing => true,
            Self::Number(value) => value.is_nan(),
            Self::Text(_) => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) if !value.is_nan() => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn to_field(&self) -> String {
        match self {
            Self::Missing => String::new(),
            Self::Number(value) if value.is_nan() => String::new(),
            Self::Number(value) => value.to_string(),
            Self::Text(value) => value.clone(),
        }
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<Option<f64>> for Cell {
    fn from(value: Option<f64>) -> Self {
        value.map(Self::Number).unwrap_or(Self::Missing)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("file {path} has no header record")]
    MissingHeader { path: String },
    #[error("row has {found} cells, table has {expected} columns")]
    RowWidth { found: usize, expected: usize },
    #[error("duplicate column name '{0}'")]
    DuplicateColumn(String),
    #[error("invalid output path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Result<Self, TableError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(TableError::DuplicateColumn(column.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_set(&self) -> HashSet<&str> {
        self.columns.iter().map(String::as_str).collect()
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                found: row.len(),
                expected: self.columns.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|cells| cells.get(idx))
    }

    /// Values of one column; cells that are not numbers come back as `None`.
    pub fn numeric_column(&self, column: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.column_index(column)?;
        Some(self.rows.iter().map(|row| row[idx].as_f64()).collect())
    }

    pub fn missing_cells(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .filter(|cell| cell.is_missing())
            .count()
    }

    /// Projects onto `columns`; columns this table lacks are filled with `Missing`.
    pub fn select(&self, columns: &[String]) -> Table {
        let indices: Vec<Option<usize>> = columns
            .iter()
            .map(|column| self.column_index(column))
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|idx| idx.map(|i| row[i].clone()).unwrap_or(Cell::Missing))
                    .collect()
            })
            .collect();
        Table {
            columns: columns.to_vec(),
            rows,
        }
    }

    /// Appends `other`'s rows, matched by column name.
    pub fn concat(&mut self, other: &Table) {
        let aligned = other.select(&self.columns);
        self.rows.extend(aligned.rows);
    }

    /// Stable ascending sort on a datetime column; unparsable values sort first.
    pub fn sort_by_datetime(&mut self, column: &str) {
        let Some(idx) = self.column_index(column) else {
            return;
        };
        let mut keyed: Vec<(Option<NaiveDateTime>, Vec<Cell>)> = self
            .rows
            .drain(..)
            .map(|row| (parse_datetime_cell(&row[idx]), row))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        self.rows = keyed.into_iter().map(|(_, row)| row).collect();
    }

    /// Drops rows whose `column` does not parse as a datetime; returns how many.
    pub fn retain_parsable_datetimes(&mut self, column: &str) -> usize {
        let Some(idx) = self.column_index(column) else {
            let dropped = self.rows.len();
            self.rows.clear();
            return dropped;
        };
        let before = self.rows.len();
        self.rows
            .retain(|row| parse_datetime_cell(&row[idx]).is_some());
        before - self.rows.len()
    }

    pub fn last_row(&self) -> Option<&[Cell]> {
        self.rows.last().map(Vec::as_slice)
    }
}

/// Columns of `incoming` that `existing` also has, in `incoming`'s order.
pub fn common_columns(existing: &[String], incoming: &[String]) -> Vec<String> {
    let existing: HashSet<&str> = existing.iter().map(String::as_str).collect();
    incoming
        .iter()
        .filter(|column| existing.contains(column.as_str()))
        .cloned()
        .collect()
}

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.naive_utc());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

pub fn parse_datetime_cell(cell: &Cell) -> Option<NaiveDateTime> {
    cell.as_text().and_then(parse_datetime)
}

pub fn format_datetime(value: NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLine {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LenientParse {
    pub table: Table,
    pub skipped: Vec<SkippedLine>,
}

/// Reads only the header record.
pub fn probe_header(path: &Path) -> Result<Vec<String>, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if header.is_empty() || header.iter().all(|name| name.trim().is_empty()) {
        return Err(TableError::MissingHeader {
            path: path.display().to_string(),
        });
    }
    Ok(header)
}

/// Best-effort read: over-wide or undecodable rows are skipped and reported,
/// short rows are padded with `Missing`.
pub fn read_lenient(path: &Path) -> Result<LenientParse, TableError> {
    let header = probe_header(path)?;
    let mut table = Table::new(header)?;
    let width = table.columns.len();

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut skipped = Vec::new();
    let mut record = csv::ByteRecord::new();
    loop {
        let line = reader.position().line() + 1;
        match reader.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(err) => {
                skipped.push(SkippedLine {
                    line,
                    reason: err.to_string(),
                });
                continue;
            }
        }

        let line = record.position().map(|pos| pos.line()).unwrap_or(line);
        if record.len() > width {
            skipped.push(SkippedLine {
                line,
                reason: format!("expected {width} fields, saw {}", record.len()),
            });
            continue;
        }

        let mut row = Vec::with_capacity(width);
        let mut undecodable = false;
        for field in record.iter() {
            match std::str::from_utf8(field) {
                Ok(text) => row.push(Cell::parse(text)),
                Err(_) => {
                    undecodable = true;
                    break;
                }
            }
        }
        if undecodable {
            skipped.push(SkippedLine {
                line,
                reason: "field is not valid UTF-8".to_string(),
            });
            continue;
        }
        if row.len() == 1 && row[0].is_missing() && width > 1 {
            // Blank line.
            continue;
        }
        row.resize(width, Cell::Missing);
        table.rows.push(row);
    }

    if !skipped.is_empty() {
        debug!(
            component = "table",
            event = "table.read.skipped_lines",
            path = %path.display(),
            skipped = skipped.len(),
            first_line = skipped[0].line
        );
    }

    Ok(LenientParse { table, skipped })
}

pub fn encode_csv(table: &Table, include_header: bool) -> Result<Vec<u8>, TableError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if include_header {
        writer.write_record(&table.columns)?;
    }
    for row in &table.rows {
        writer.write_record(row.iter().map(Cell::to_field))?;
    }
    writer
        .into_inner()
        .map_err(|err| TableError::Io(err.into_error()))
}

/// Replaces `path` with header + rows via a temp file and rename.
pub fn write_table(path: &Path, table: &Table) -> Result<(), TableError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let bytes = encode_csv(table, true)?;
    write_atomic(path, &bytes)
}

/// Appends rows without a header, laid out in `header_order`.
pub fn append_rows(path: &Path, table: &Table, header_order: &[String]) -> Result<(), TableError> {
    let aligned = table.select(header_order);
    let bytes = encode_csv(&aligned, false)?;

    let existing_len = fs::metadata(path)?.len();
    let mut file = fs::OpenOptions::new().append(true).open(path)?;
    if existing_len > 0 && !ends_with_newline(path)? {
        file.write_all(b"\n")?;
    }
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TableError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| TableError::InvalidPath(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

fn ends_with_newline(path: &Path) -> Result<bool, TableError> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
