use std::path::Path;

use calamine::{Data, Reader};
use regex::Regex;

use crate::error::Result;
use crate::models::RawTable;

// ---------------------------------------------------------------------------
// Cell coercion
// ---------------------------------------------------------------------------

/// Excel epoch is 1899-12-30 (accounting for the 1900 leap year bug).
pub fn excel_serial_to_date(serial: f64) -> String {
    let base = chrono::NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or_default();
    let date = base + chrono::Duration::days(serial as i64);
    date.format("%Y/%m/%d").to_string()
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(serial) => excel_serial_to_date(serial.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Header-row fallback
// ---------------------------------------------------------------------------

/// Auto-generated header cells produced by exports that never had a real
/// header row ("Unnamed: 3", "Column1", or plain blanks).
fn is_placeholder_header(cell: &str) -> bool {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return true;
    }
    let re = Regex::new(r"(?i)^(unnamed|column|field)[\s:._]*\d*$").ok();
    re.map(|re| re.is_match(trimmed)).unwrap_or(false)
}

fn mostly_placeholders(headers: &[String]) -> bool {
    if headers.is_empty() {
        return true;
    }
    let anonymous = headers.iter().filter(|h| is_placeholder_header(h)).count();
    anonymous * 2 >= headers.len()
}

/// Split raw rows into header + body. If at least half the header cells are
/// anonymous placeholders, retry with the next row as header, at most once.
fn table_from_rows(mut rows: Vec<Vec<String>>) -> Option<RawTable> {
    rows.retain(|r| r.iter().any(|c| !c.trim().is_empty()));
    if rows.is_empty() {
        return None;
    }
    let headers = rows.remove(0);
    if mostly_placeholders(&headers) && !rows.is_empty() {
        let retry = rows.remove(0);
        if !mostly_placeholders(&retry) {
            return Some(RawTable {
                headers: retry,
                rows,
            });
        }
        return None;
    }
    if mostly_placeholders(&headers) {
        return None;
    }
    Some(RawTable { headers, rows })
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

fn read_csv_tables(path: &Path) -> Result<Vec<RawTable>> {
    let file = std::fs::File::open(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(std::io::BufReader::new(file));
    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        rows.push(record.iter().map(|c| c.trim().to_string()).collect());
    }
    Ok(table_from_rows(rows).into_iter().collect())
}

fn read_workbook_tables(path: &Path) -> Result<Vec<RawTable>> {
    let mut workbook = calamine::open_workbook_auto(path)?;
    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    let mut tables = Vec::new();
    for name in sheet_names {
        let Ok(range) = workbook.worksheet_range(&name) else {
            continue;
        };
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect();
        if let Some(table) = table_from_rows(rows) {
            tables.push(table);
        }
    }
    Ok(tables)
}

/// Read every sheet of a ledger file into string tables. CSV yields one
/// table, workbooks one per non-empty sheet.
pub fn read_tables(path: &Path) -> Result<Vec<RawTable>> {
    let is_csv = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    if is_csv {
        read_csv_tables(path)
    } else {
        read_workbook_tables(path)
    }
}
