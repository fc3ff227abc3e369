//! Ingestion: raw tabular bytes → ordered list of normalized records.
//!
//! Pipeline:
//! 1. Reject HTML payloads (an export URL that lost its sharing permission
//!    serves a login/error page with a 200 status)
//! 2. Tokenize as quoted CSV; quoted cells may span lines
//! 3. Locate the header row by its sentinel first cell, discarding any
//!    title/banner rows above it
//! 4. Clean each data row: drop blank rows and rows without a primary value,
//!    pad/truncate to header width, trim and collapse whitespace
//!
//! Same bytes + same sentinel always yield the same records.

use super::record::Record;
use crate::error::CacheError;
use tracing::{debug, warn};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const HTML_MARKERS: [&[u8]; 2] = [b"<!doctype html", b"<html"];

/// Result of parsing a table, with the detected header and row accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTable {
    /// Trimmed header cells, in source order. May contain duplicates.
    pub header: Vec<String>,
    /// Zero-based index of the header row among all tokenized rows.
    pub header_row: usize,
    pub records: Vec<Record>,
    /// Data rows dropped as blank or missing a primary value.
    pub skipped_rows: usize,
}

/// Parse raw bytes into records, locating the header by `sentinel`.
pub fn parse(bytes: &[u8], sentinel: &str) -> Result<Vec<Record>, CacheError> {
    parse_table(bytes, sentinel).map(|table| table.records)
}

/// Parse raw bytes into a [`ParsedTable`].
pub fn parse_table(bytes: &[u8], sentinel: &str) -> Result<ParsedTable, CacheError> {
    if looks_like_html(bytes) {
        return Err(CacheError::InvalidPayload(
            "received HTML instead of CSV (is the sheet shared publicly?)".into(),
        ));
    }

    let sentinel = sentinel.trim();
    let rows = tokenize(bytes)?;

    let header_row = rows
        .iter()
        .position(|row| row.first().is_some_and(|cell| cell.trim() == sentinel))
        .ok_or_else(|| CacheError::MalformedTable {
            sentinel: sentinel.to_string(),
        })?;

    let header: Vec<String> = rows[header_row]
        .iter()
        .map(|cell| cell.trim().to_string())
        .collect();
    warn_on_duplicate_columns(&header);

    let data_rows = &rows[header_row + 1..];
    let mut records = Vec::with_capacity(data_rows.len());
    let mut skipped_rows = 0;

    for row in data_rows {
        match clean_row(row, &header) {
            Some(record) => records.push(record),
            None => skipped_rows += 1,
        }
    }

    if records.is_empty() {
        return Err(CacheError::EmptyResult {
            rows_after_header: data_rows.len(),
        });
    }

    debug!(
        header_row,
        columns = header.len(),
        records = records.len(),
        skipped_rows,
        "parsed table"
    );

    Ok(ParsedTable {
        header,
        header_row,
        records,
        skipped_rows,
    })
}

/// Split bytes into rows of raw (untrimmed) cells.
fn tokenize(bytes: &[u8]) -> Result<Vec<Vec<String>>, CacheError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for result in reader.byte_records() {
        let record =
            result.map_err(|e| CacheError::InvalidPayload(format!("csv tokenization: {e}")))?;
        rows.push(
            record
                .iter()
                .map(|cell| String::from_utf8_lossy(cell).into_owned())
                .collect(),
        );
    }
    Ok(rows)
}

/// Normalize one data row against the header, or `None` if the row is skipped.
fn clean_row(row: &[String], header: &[String]) -> Option<Record> {
    if row.iter().all(|cell| cell.trim().is_empty()) {
        return None;
    }
    if row.first().map_or(true, |cell| cell.trim().is_empty()) {
        return None;
    }

    let cells = row
        .iter()
        .map(|cell| normalize_cell(cell))
        .chain(std::iter::repeat(String::new()))
        .take(header.len());

    Some(Record::from_pairs(header.iter().cloned().zip(cells)))
}

/// Trim and collapse every whitespace run (line breaks included) to one space.
fn normalize_cell(cell: &str) -> String {
    cell.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(bytes: &[u8]) -> bool {
    HTML_MARKERS.iter().any(|marker| {
        bytes
            .windows(marker.len())
            .any(|window| window.eq_ignore_ascii_case(marker))
    })
}

fn warn_on_duplicate_columns(header: &[String]) {
    for (i, name) in header.iter().enumerate() {
        if header[..i].contains(name) {
            warn!(column = %name, "duplicate header column; later values overwrite earlier ones");
        }
    }
}
