use chrono::NaiveDate;
use regex::Regex;

// ---------------------------------------------------------------------------
// Date interpretation
// ---------------------------------------------------------------------------

const OUTPUT_FORMAT: &str = "%Y/%m/%d";

/// Full-date formats accepted as-is (the year comes from the cell).
const NATIVE_FORMATS: &[&str] = &[
    "%Y/%m/%d",
    "%Y-%m-%d",
    "%Y年%m月%d日",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y.%m.%d",
    "%m/%d/%Y",
];

fn month_day(year: i32, month: u32, day: u32) -> Option<String> {
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format(OUTPUT_FORMAT).to_string())
}

/// Normalize heterogeneous ledger date text to `YYYY/MM/DD`.
///
/// Month/day-only shapes (`5月3日`, `5/3`, `5-3`, `5月3`) borrow the year
/// from `year_hint` (the file's declared period), never from the cell.
/// Returns the empty string when nothing parses; the caller decides whether
/// that drops the row.
pub fn interpret(raw: &str, year_hint: i32) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }

    for fmt in NATIVE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.format(OUTPUT_FORMAT).to_string();
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return dt.date().format(OUTPUT_FORMAT).to_string();
        }
    }

    // M月D日
    if let Some(caps) = capture(raw, r"^(\d{1,2})月(\d{1,2})日$") {
        if let Some(s) = month_day(year_hint, caps.0, caps.1) {
            return s;
        }
    }

    // M/D or M-D
    if let Some(caps) = capture(raw, r"^(\d{1,2})[/-](\d{1,2})$") {
        if let Some(s) = month_day(year_hint, caps.0, caps.1) {
            return s;
        }
    }

    // M月D (day suffix omitted)
    if let Some(caps) = capture(raw, r"^(\d{1,2})月(\d{1,2})$") {
        if let Some(s) = month_day(year_hint, caps.0, caps.1) {
            return s;
        }
    }

    String::new()
}

fn capture(raw: &str, pattern: &str) -> Option<(u32, u32)> {
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(raw)?;
    let a: u32 = caps[1].parse().ok()?;
    let b: u32 = caps[2].parse().ok()?;
    Some((a, b))
}
