use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use rust_xlsxwriter::Workbook;
use walkdir::WalkDir;

use crate::error::Result;
use crate::models::CanonicalRecord;

// ---------------------------------------------------------------------------
// Output layout
// ---------------------------------------------------------------------------

const COMPANY_DIR: &str = "_company";
const MARKER_FILE: &str = "_last_updated";

pub const RECORD_HEADERS: &[&str] = &[
    "部署", "元請け", "日付", "取引先", "品目", "分類", "数量", "単価", "金額",
    "伝票番号", "注文番号", "元ファイル",
];

const COMPANY_HEADERS: &[&str] = &[
    "部署", "年月", "元請け", "日付", "取引先", "品目", "分類", "数量", "単価", "金額",
    "伝票番号", "注文番号", "元ファイル",
];

const SUMMARY_HEADERS: &[&str] = &["年月", "部署", "部署別合計金額"];

const RECORD_NUMERIC_COLS: &[usize] = &[6, 7, 8];
const COMPANY_NUMERIC_COLS: &[usize] = &[7, 8, 9];
const SUMMARY_NUMERIC_COLS: &[usize] = &[2];

fn records_basename(dept: &str, period: &str) -> String {
    format!("{dept}_{period}_records")
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn fmt_number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        v.to_string()
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(fmt_number).unwrap_or_default()
}

fn record_row(r: &CanonicalRecord) -> Vec<String> {
    vec![
        r.department.clone(),
        r.company.clone(),
        r.date.clone(),
        r.entity.clone(),
        r.item.clone(),
        r.classification.label().to_string(),
        fmt_opt(r.quantity),
        fmt_opt(r.unit_price),
        fmt_number(r.amount),
        r.voucher_no.clone(),
        r.order_no.clone(),
        r.source_file.clone(),
    ]
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

fn write_csv(path: &Path, headers: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(headers)?;
    for row in rows {
        wtr.write_record(row)?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_xlsx(
    path: &Path,
    headers: &[&str],
    rows: &[Vec<String>],
    numeric_cols: &[usize],
) -> Result<()> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    for (col, header) in headers.iter().enumerate() {
        worksheet.write_string(0, col as u16, *header)?;
    }
    for (row_idx, row) in rows.iter().enumerate() {
        for (col, value) in row.iter().enumerate() {
            let r = (row_idx + 1) as u32;
            if numeric_cols.contains(&col) && !value.is_empty() {
                if let Ok(n) = value.parse::<f64>() {
                    worksheet.write_number(r, col as u16, n)?;
                    continue;
                }
            }
            worksheet.write_string(r, col as u16, value)?;
        }
    }
    workbook.save(path)?;
    Ok(())
}

/// Full replacement of one department/period's artifacts. Rows are sorted
/// under a total order so an identical record set always produces identical
/// bytes, whatever order the files were read in.
pub fn write_group(
    out_root: &Path,
    dept: &str,
    period: &str,
    records: &[CanonicalRecord],
) -> Result<()> {
    let dir = out_root.join(dept);
    std::fs::create_dir_all(&dir)?;

    let mut rows: Vec<Vec<String>> = records.iter().map(record_row).collect();
    rows.sort();

    let base = records_basename(dept, period);
    write_csv(&dir.join(format!("{base}.csv")), RECORD_HEADERS, &rows)?;
    write_xlsx(
        &dir.join(format!("{base}.xlsx")),
        RECORD_HEADERS,
        &rows,
        RECORD_NUMERIC_COLS,
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Company-wide merge
// ---------------------------------------------------------------------------

/// Merge every per-department records CSV into the company-wide rollup plus
/// a department × period monetary summary. Re-derives everything from the
/// artifacts on disk, so reruns are idempotent.
pub fn merge_all(out_root: &Path) -> Result<()> {
    let re = Regex::new(r"_(\d{4}-\d{2})_records\.csv$")
        .map_err(|e| crate::error::LedgerError::Other(e.to_string()))?;
    let company_root = out_root.join(COMPANY_DIR);

    let mut sources: Vec<(PathBuf, String)> = Vec::new();
    for entry in WalkDir::new(out_root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.path().starts_with(&company_root) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(caps) = re.captures(&name) {
            sources.push((entry.path().to_path_buf(), caps[1].to_string()));
        }
    }
    sources.sort();

    let mut merged: Vec<Vec<String>> = Vec::new();
    for (path, period) in &sources {
        let mut rdr = csv::Reader::from_path(path)?;
        for result in rdr.records() {
            let record = result?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            if row.is_empty() {
                continue;
            }
            row.insert(1, period.clone());
            merged.push(row);
        }
    }
    merged.sort();

    let mut summary: BTreeMap<(String, String), f64> = BTreeMap::new();
    for row in &merged {
        if row.len() < 10 {
            continue;
        }
        let amount: f64 = row[9].parse().unwrap_or(0.0);
        *summary
            .entry((row[1].clone(), row[0].clone()))
            .or_insert(0.0) += amount;
    }
    let summary_rows: Vec<Vec<String>> = summary
        .iter()
        .map(|((period, dept), total)| {
            vec![period.clone(), dept.clone(), fmt_number(*total)]
        })
        .collect();

    std::fs::create_dir_all(&company_root)?;
    write_csv(
        &company_root.join("company_records.csv"),
        COMPANY_HEADERS,
        &merged,
    )?;
    write_xlsx(
        &company_root.join("company_records.xlsx"),
        COMPANY_HEADERS,
        &merged,
        COMPANY_NUMERIC_COLS,
    )?;
    write_csv(
        &company_root.join("department_summary.csv"),
        SUMMARY_HEADERS,
        &summary_rows,
    )?;
    write_xlsx(
        &company_root.join("department_summary.xlsx"),
        SUMMARY_HEADERS,
        &summary_rows,
        SUMMARY_NUMERIC_COLS,
    )?;

    log::info!(
        "company rollup regenerated: {} rows from {} artifacts",
        merged.len(),
        sources.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Last-write marker
// ---------------------------------------------------------------------------

/// Shared "last batch written at T" marker the debounce task watches.
pub fn touch_last_updated(out_root: &Path) -> Result<()> {
    std::fs::create_dir_all(out_root)?;
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    std::fs::write(out_root.join(MARKER_FILE), secs.to_string())?;
    Ok(())
}

pub fn read_last_updated(out_root: &Path) -> Option<u64> {
    let content = std::fs::read_to_string(out_root.join(MARKER_FILE)).ok()?;
    content.trim().parse().ok()
}
