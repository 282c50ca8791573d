//! Tabular row source and result sinks
//!
//! Jobs read a CSV source table once up front and append two result columns
//! (extracted phones, reply summary) on the way out. Results are shipped as
//! spreadsheets (partial artifacts mid-run, a final workbook at the end);
//! a plain CSV sink exists for callers that want machine-readable output.

use crate::error::{Error, Result};
use rust_xlsxwriter::{Format, FormatAlign, Workbook};
use std::path::Path;

/// Header of the extracted-phones result column
pub const PHONES_COLUMN: &str = "phones";
/// Header of the reply-summary result column
pub const SUMMARY_COLUMN: &str = "summary";

/// Column widths are content-driven but never wider than this (characters)
const MAX_COLUMN_WIDTH: f64 = 60.0;

/// A fully loaded source table.
///
/// Tables are small relative to the cost of processing them (every row is a
/// paid, rate-limited call), so the whole file is held in memory for the life
/// of the job.
#[derive(Clone, Debug)]
pub struct SourceTable {
    /// Column headers, in file order
    pub headers: Vec<String>,
    /// Data rows, each padded/truncated to the header width
    pub rows: Vec<Vec<String>>,
    /// Index of the lookup key column within `headers`
    pub key_index: usize,
}

impl SourceTable {
    /// The lookup key of row `i`, trimmed
    pub fn key(&self, i: usize) -> &str {
        self.rows[i]
            .get(self.key_index)
            .map(String::as_str)
            .unwrap_or("")
            .trim()
    }
}

/// Read a CSV file and locate the lookup key column.
///
/// The key column is matched case-insensitively after trimming, so
/// `" Tax_ID "` in the file satisfies a configured `tax_id`. Rows shorter
/// than the header are padded with empty cells.
pub fn read_csv(path: &Path, key_column: &str) -> Result<SourceTable> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let wanted = key_column.trim().to_lowercase();
    let key_index = headers
        .iter()
        .position(|h| h.to_lowercase() == wanted)
        .ok_or_else(|| Error::MissingColumn {
            column: key_column.to_string(),
        })?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row: Vec<String> = record.iter().map(str::to_string).collect();
        row.resize(headers.len(), String::new());
        rows.push(row);
    }

    tracing::info!(
        path = %path.display(),
        rows = rows.len(),
        key_column = %headers[key_index],
        "source table loaded"
    );

    Ok(SourceTable {
        headers,
        rows,
        key_index,
    })
}

/// Write the first `covered` rows plus their results as a spreadsheet.
///
/// Source columns come first, then the two result columns. Every column gets
/// an auto width (longest cell plus padding, capped) and every cell wraps
/// with top vertical alignment so multi-line summaries stay readable.
pub fn write_snapshot_xlsx(
    path: &Path,
    table: &SourceTable,
    extracted: &[String],
    summaries: &[String],
    covered: usize,
) -> Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();

    let cell_format = Format::new().set_text_wrap().set_align(FormatAlign::Top);
    let header_format = Format::new().set_bold().set_align(FormatAlign::Top);

    let mut columns: Vec<&str> = table.headers.iter().map(String::as_str).collect();
    columns.push(PHONES_COLUMN);
    columns.push(SUMMARY_COLUMN);

    let mut widths: Vec<usize> = Vec::with_capacity(columns.len());
    for (col, header) in columns.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, &header_format)?;
        widths.push(header.chars().count());
    }

    for row in 0..covered.min(table.rows.len()) {
        for (col, cell) in table.rows[row].iter().enumerate() {
            sheet.write_string_with_format((row + 1) as u32, col as u16, cell, &cell_format)?;
            widths[col] = widths[col].max(cell.chars().count());
        }
        let phones = extracted.get(row).map(String::as_str).unwrap_or("");
        let summary = summaries.get(row).map(String::as_str).unwrap_or("");
        let phones_col = table.headers.len() as u16;
        sheet.write_string_with_format((row + 1) as u32, phones_col, phones, &cell_format)?;
        sheet.write_string_with_format((row + 1) as u32, phones_col + 1, summary, &cell_format)?;
        widths[phones_col as usize] = widths[phones_col as usize].max(phones.chars().count());
        widths[phones_col as usize + 1] =
            widths[phones_col as usize + 1].max(summary.chars().count());
    }

    for (col, max_chars) in widths.iter().enumerate() {
        sheet.set_column_width(col as u16, auto_width(*max_chars))?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    workbook.save(path)?;
    tracing::debug!(path = %path.display(), rows = covered, "spreadsheet written");
    Ok(())
}

/// Write the full table plus result columns as CSV.
pub fn write_result_csv(
    path: &Path,
    table: &SourceTable,
    extracted: &[String],
    summaries: &[String],
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;

    let mut header = table.headers.clone();
    header.push(PHONES_COLUMN.to_string());
    header.push(SUMMARY_COLUMN.to_string());
    writer.write_record(&header)?;

    for (i, row) in table.rows.iter().enumerate() {
        let mut out = row.clone();
        out.push(extracted.get(i).cloned().unwrap_or_default());
        out.push(summaries.get(i).cloned().unwrap_or_default());
        writer.write_record(&out)?;
    }
    writer.flush()?;
    Ok(())
}

/// Longest cell content plus padding, capped
fn auto_width(max_chars: usize) -> f64 {
    ((max_chars + 2) as f64).min(MAX_COLUMN_WIDTH)
}
